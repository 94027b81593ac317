//! Operation State Machine
//!
//! An operation drives one request through an ordered pool of compensable
//! actions:
//!
//! ```text
//! CREATED -> RUNNING -> COMPLETED
//!                    -> ROLLING_BACK -> ROLLED_BACK | FAILED
//!                    -> FAILED
//! ```
//!
//! The record is upserted after every transition. The signed payout is saved
//! together with the broadcast marker, before it is sent. Once a broadcast was
//! attempted the operation never rolls back; it stays RUNNING, re-checks the
//! chain and re-sends the saved transaction until it shows up.

pub mod action;
pub mod pool;
pub mod redeem;

use bitcoin::consensus::encode::serialize_hex;
use bitcoin::Transaction;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::common::config::ConfigError;
use crate::common::logging::{log_alert, log_operation_event};
use crate::contract::BridgeContract;
use crate::events::{BridgeEvent, EventBus};
use crate::storage::{OperationStore, StorageError};
use crate::types::{
    ActionStatus, OperationParams, OperationRecord, OperationStatus, OperationType,
};
use crate::wallet::WalletBtc;

pub use action::{Action, ActionContext, ActionError, Phase};
pub use pool::build_actions_pool;

/// Operation errors surfaced to callers
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("operation already exists: {0}")]
    Duplicate(String),
}

/// Retry and confirmation settings
#[derive(Debug, Clone)]
pub struct OperationSettings {
    pub retry_base: Duration,
    pub retry_max: Duration,
    /// Attempts before a reversible step gives up and rolls back
    pub max_action_attempts: u32,
    /// Attempts before a stuck operation raises an alert
    pub stuck_alert_after: u32,
    pub required_confirmations: u32,
}

impl Default for OperationSettings {
    fn default() -> Self {
        Self {
            retry_base: Duration::from_secs(1),
            retry_max: Duration::from_secs(60),
            max_action_attempts: 5,
            stuck_alert_after: 30,
            required_confirmations: 0,
        }
    }
}

impl OperationSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base: self.retry_base,
            max_delay: self.retry_max,
        }
    }
}

/// Exponential backoff with jitter, capped at `max_delay`
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        if base_ms == 0 {
            return Duration::ZERO;
        }

        let exp = base_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
        let jitter = rand::thread_rng().gen_range(0..=exp / 4);
        let capped = exp.saturating_add(jitter).min(self.max_delay.as_millis() as u64);
        Duration::from_millis(capped)
    }
}

/// Collaborators shared by every operation
#[derive(Clone)]
pub struct OperationDeps {
    pub store: Arc<dyn OperationStore>,
    pub wallet: Arc<WalletBtc>,
    pub contract: Arc<dyn BridgeContract>,
    pub events: EventBus,
    pub settings: OperationSettings,
}

/// How a failed attempt is handled
enum Outcome {
    Retry,
    RollBack,
    Fail,
}

/// One request driven through its actions pool
pub struct Operation {
    record: OperationRecord,
    actions: Vec<Box<dyn Action>>,
    ctx: ActionContext,
    deps: OperationDeps,
}

impl Operation {
    /// New operation in CREATED; nothing is persisted until [`Operation::run`]
    pub fn new(
        op_type: OperationType,
        params: OperationParams,
        deps: OperationDeps,
    ) -> Result<Self, ConfigError> {
        let actions = build_actions_pool(op_type.as_str(), &deps)?;
        let names: Vec<&str> = actions.iter().map(|a| a.name()).collect();
        let record = OperationRecord::new(op_type, &params, &names);

        Ok(Self {
            ctx: ActionContext::new(params),
            record,
            actions,
            deps,
        })
    }

    /// Rebuild an operation from its persisted record
    pub fn resume(mut record: OperationRecord, deps: OperationDeps) -> Result<Self, ConfigError> {
        let actions = build_actions_pool(&record.op_type, &deps)?;

        if record.actions.is_empty() {
            let names: Vec<&str> = actions.iter().map(|a| a.name()).collect();
            record.actions = OperationRecord::new(record.operation_type()?, &record.params(), &names)
                .actions;
        }

        Ok(Self::with_actions(record, actions, deps))
    }

    pub(crate) fn with_actions(
        record: OperationRecord,
        actions: Vec<Box<dyn Action>>,
        deps: OperationDeps,
    ) -> Self {
        let mut ctx = ActionContext::new(record.params());
        ctx.txid = record.btc_txid.clone();
        if let Some(raw) = &record.signed_tx {
            match decode_transaction(raw) {
                Ok(tx) => {
                    ctx.txid = Some(tx.compute_txid().to_string());
                    ctx.signed = Some(tx);
                }
                Err(e) => {
                    warn!(target: "vault::operation", id = %record.id, error = %e, "Saved transaction cannot be decoded");
                }
            }
        }
        ctx.broadcast_attempted = actions
            .iter()
            .filter(|a| a.phase() == Phase::Broadcast)
            .any(|a| {
                matches!(
                    record.action_status(a.name()),
                    Some(ActionStatus::BroadcastUnconfirmed) | Some(ActionStatus::Executed)
                )
            });

        Self {
            record,
            actions,
            ctx,
            deps,
        }
    }

    pub fn record(&self) -> &OperationRecord {
        &self.record
    }

    pub fn status(&self) -> OperationStatus {
        self.record.status
    }

    fn id(&self) -> String {
        self.record.id.to_hex()
    }

    /// Drive the operation until it is terminal or shutdown is signalled
    pub async fn run(&mut self, shutdown: &mut watch::Receiver<bool>) -> OperationStatus {
        match self.record.status {
            OperationStatus::Created => {
                if !self.start().await {
                    return self.record.status;
                }
            }
            OperationStatus::RollingBack => {
                // Only reversible steps can have been executed
                info!(target: "vault::operation", id = %self.id(), "Finishing interrupted rollback");
                self.transition(OperationStatus::RolledBack).await;
                return self.record.status;
            }
            OperationStatus::Running => {
                info!(
                    target: "vault::operation",
                    id = %self.id(),
                    broadcast_attempted = self.ctx.broadcast_attempted,
                    "Resuming operation"
                );
            }
            status => return status,
        }

        self.execute_pipeline(shutdown).await
    }

    /// CREATED -> RUNNING, inserting the record; false for a duplicate id
    async fn start(&mut self) -> bool {
        self.record.status = OperationStatus::Running;
        self.record.touch();

        let mut attempt = 0;
        loop {
            match self.deps.store.create_operation(&self.record).await {
                Ok(true) => break,
                Ok(false) => {
                    warn!(
                        target: "vault::operation",
                        id = %self.id(),
                        "Operation already exists, not starting a second run"
                    );
                    self.record.status = OperationStatus::Created;
                    return false;
                }
                Err(e) => {
                    attempt += 1;
                    warn!(
                        target: "vault::operation",
                        id = %self.id(),
                        attempt,
                        error = %e,
                        "PersistenceFailure: could not create operation"
                    );
                    tokio::time::sleep(self.deps.settings.retry_policy().delay(attempt)).await;
                }
            }
        }

        self.announce();
        true
    }

    async fn execute_pipeline(&mut self, shutdown: &mut watch::Receiver<bool>) -> OperationStatus {
        let policy = self.deps.settings.retry_policy();

        for index in 0..self.actions.len() {
            let name = self.actions[index].name();
            let phase = self.actions[index].phase();
            let mut attempt: u32 = 0;

            loop {
                if *shutdown.borrow() {
                    info!(target: "vault::operation", id = %self.id(), action = name, "Shutdown, leaving operation RUNNING");
                    self.release_held().await;
                    return self.record.status;
                }

                let result = match self.write_ahead(index, phase).await {
                    Ok(()) => self.actions[index].execute(&mut self.ctx).await,
                    Err(err) => Err(err),
                };

                let err = match result {
                    Ok(()) => {
                        self.record.set_action_status(name, ActionStatus::Executed);
                        if let Some(tx) = &self.ctx.found {
                            self.record.btc_txid = Some(tx.txid.clone());
                        } else if let Some(txid) = &self.ctx.txid {
                            self.record.btc_txid = Some(txid.clone());
                        }
                        self.persist().await;
                        break;
                    }
                    Err(err) => err,
                };

                attempt += 1;
                let outcome = self.classify(&err, attempt);
                warn!(
                    target: "vault::operation",
                    id = %self.id(),
                    action = name,
                    attempt,
                    error = %err,
                    "Action failed"
                );

                match outcome {
                    Outcome::Retry => {
                        if attempt == self.deps.settings.stuck_alert_after {
                            log_alert(
                                "OPERATION_STUCK",
                                &self.id(),
                                serde_json::json!({
                                    "action": name,
                                    "attempts": attempt,
                                    "error": err.to_string(),
                                    "btc_txid": self.record.btc_txid,
                                }),
                            );
                        }
                        wait(policy.delay(attempt), shutdown).await;
                    }
                    Outcome::RollBack => {
                        self.record.set_action_status(name, ActionStatus::Failed);
                        self.record.error = Some(err.to_string());
                        return self.roll_back(index).await;
                    }
                    Outcome::Fail => {
                        self.record.set_action_status(name, ActionStatus::Failed);
                        self.record.error = Some(err.to_string());
                        return self.fail(index, &err).await;
                    }
                }
            }
        }

        self.ctx.release_spend_lock();
        self.transition(OperationStatus::Completed).await;
        self.record.status
    }

    /// Before a broadcast: sign, then persist the transaction with the marker
    async fn write_ahead(&mut self, index: usize, phase: Phase) -> Result<(), ActionError> {
        if phase != Phase::Broadcast {
            return Ok(());
        }
        self.actions[index].prepare(&mut self.ctx).await?;

        let name = self.actions[index].name();
        let signed_tx = self.ctx.signed.as_ref().map(serialize_hex);
        if self.record.action_status(name) == Some(ActionStatus::BroadcastUnconfirmed)
            && self.record.signed_tx == signed_tx
        {
            return Ok(());
        }

        if signed_tx.is_some() {
            self.record.btc_txid = self.ctx.txid.clone();
        }
        self.record.signed_tx = signed_tx;
        self.record
            .set_action_status(name, ActionStatus::BroadcastUnconfirmed);
        self.persist().await;
        Ok(())
    }

    /// Drop the spend lock, and the reserved outputs while still reversible
    async fn release_held(&mut self) {
        if !self.ctx.is_irreversible() {
            self.deps.wallet.release(&self.ctx.selected).await;
            self.ctx.selected.clear();
        }
        self.ctx.release_spend_lock();
    }

    fn classify(&self, err: &ActionError, attempt: u32) -> Outcome {
        if self.ctx.is_irreversible() {
            return match err {
                ActionError::Fatal(_) => Outcome::Fail,
                _ => Outcome::Retry,
            };
        }

        match err {
            ActionError::InsufficientFunds { .. } => Outcome::Fail,
            ActionError::Fatal(_) => Outcome::RollBack,
            ActionError::External(_) if attempt >= self.deps.settings.max_action_attempts => {
                Outcome::RollBack
            }
            _ => Outcome::Retry,
        }
    }

    /// Definitive failure: undo what is reversible, then RUNNING -> FAILED
    async fn fail(&mut self, failed_index: usize, err: &ActionError) -> OperationStatus {
        if !self.ctx.is_irreversible() {
            if let Err(rollback_err) = self.rollback_actions(failed_index).await {
                self.record.error = Some(format!("{}; rollback failed: {}", err, rollback_err));
            }
        } else {
            log_alert(
                "OPERATION_FAILED_AFTER_BROADCAST",
                &self.id(),
                serde_json::json!({
                    "error": err.to_string(),
                    "btc_txid": self.record.btc_txid,
                }),
            );
        }

        self.ctx.release_spend_lock();
        self.transition(OperationStatus::Failed).await;
        self.record.status
    }

    /// RUNNING -> ROLLING_BACK -> ROLLED_BACK, or FAILED if a rollback fails
    async fn roll_back(&mut self, failed_index: usize) -> OperationStatus {
        self.transition(OperationStatus::RollingBack).await;

        let next = match self.rollback_actions(failed_index).await {
            Ok(()) => OperationStatus::RolledBack,
            Err(e) => {
                self.record.error = Some(format!("rollback failed: {}", e));
                OperationStatus::Failed
            }
        };

        self.ctx.release_spend_lock();
        self.transition(next).await;
        self.record.status
    }

    /// Roll back executed actions before `failed_index`, newest first
    async fn rollback_actions(&mut self, failed_index: usize) -> Result<(), ActionError> {
        for index in (0..failed_index).rev() {
            let name = self.actions[index].name();
            if self.actions[index].phase() != Phase::PreBroadcast {
                break;
            }
            if self.record.action_status(name) != Some(ActionStatus::Executed) {
                continue;
            }

            match self.actions[index].rollback(&mut self.ctx).await {
                Ok(()) => {
                    self.record.set_action_status(name, ActionStatus::RolledBack);
                    self.persist().await;
                }
                Err(e) => {
                    self.record.set_action_status(name, ActionStatus::Failed);
                    log_alert(
                        "ROLLBACK_FAILED",
                        &self.id(),
                        serde_json::json!({
                            "action": name,
                            "error": e.to_string(),
                        }),
                    );
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn transition(&mut self, next: OperationStatus) {
        if !self.record.status.can_transition_to(next) {
            error!(
                target: "vault::operation",
                id = %self.id(),
                from = %self.record.status,
                to = %next,
                "Refusing invalid status transition"
            );
            return;
        }

        self.record.status = next;
        self.record.touch();
        self.persist().await;
        self.announce();
    }

    fn announce(&self) {
        log_operation_event(
            "OPERATION_STATUS",
            &self.id(),
            self.record.status.as_str(),
            self.record.amount,
            self.record.error.as_deref(),
        );
        self.deps
            .events
            .publish(BridgeEvent::OperationUpdated(self.record.clone()));
    }

    /// Upsert the record, retrying until the store accepts it
    async fn persist(&mut self) {
        let policy = self.deps.settings.retry_policy();
        let mut attempt = 0;

        while let Err(e) = self.deps.store.upsert_operation(&self.record).await {
            attempt += 1;
            warn!(
                target: "vault::operation",
                id = %self.id(),
                attempt,
                error = %e,
                "PersistenceFailure: could not save operation"
            );
            tokio::time::sleep(policy.delay(attempt)).await;
        }
    }
}

fn decode_transaction(raw: &str) -> Result<Transaction, String> {
    let bytes = hex::decode(raw).map_err(|e| e.to_string())?;
    bitcoin::consensus::deserialize(&bytes).map_err(|e| e.to_string())
}

/// Sleep for `delay`, waking early on a shutdown signal
async fn wait(delay: Duration, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        changed = shutdown.changed() => {
            if changed.is_err() {
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{MockBridgeContract, TxReceipt};
    use crate::events::Topic;
    use crate::storage::MemoryStore;
    use crate::testing::{FakeChain, TestVault, TEST_VAULT};
    use crate::types::{RequestId, RequestStatus};
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn settings() -> OperationSettings {
        OperationSettings {
            retry_base: Duration::ZERO,
            retry_max: Duration::ZERO,
            max_action_attempts: 3,
            stuck_alert_after: 5,
            required_confirmations: 0,
        }
    }

    fn params(vault: &TestVault, id: u64, amount: u64) -> OperationParams {
        OperationParams {
            id: RequestId::from_u64(id),
            requester: "0xuser".into(),
            vault: TEST_VAULT.into(),
            btc_address: vault.recipient(),
            amount,
        }
    }

    fn notifying_contract() -> MockBridgeContract {
        let mut contract = MockBridgeContract::new();
        contract
            .expect_redeem_status()
            .returning(|_| Ok(RequestStatus::Pending));
        contract
            .expect_notify_redeem_complete()
            .times(1)
            .returning(|_, _| {
                Ok(TxReceipt {
                    transaction_hash: "0xreceipt".into(),
                    status: true,
                })
            });
        contract
    }

    fn deps(vault: &TestVault, contract: MockBridgeContract) -> OperationDeps {
        OperationDeps {
            store: vault.store.clone(),
            wallet: vault.wallet.clone(),
            contract: Arc::new(contract),
            events: EventBus::default(),
            settings: settings(),
        }
    }

    fn no_shutdown() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[test]
    fn test_retry_policy_backoff() {
        let policy = RetryPolicy {
            base: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
        };
        let first = policy.delay(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
        let third = policy.delay(3);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(500));
        assert_eq!(policy.delay(10), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn test_redeem_completes_after_change_is_visible() {
        let chain = Arc::new(FakeChain::new(500).with_visibility_delay(4));
        let store = Arc::new(MemoryStore::new());
        let vault = TestVault::with_parts(chain, store, &[5_000, 3_000, 2_000]).await;
        let deps = deps(&vault, notifying_contract());
        let mut updates = deps.events.subscribe(&[Topic::Operations]);

        let mut op = Operation::new(OperationType::Redeem, params(&vault, 77, 6_000), deps).unwrap();
        let (_tx, mut shutdown) = no_shutdown();
        let status = op.run(&mut shutdown).await;

        assert_eq!(status, OperationStatus::Completed);
        assert_eq!(vault.chain.broadcast_count(), 1);
        assert_eq!(vault.wallet.reserved_count().await, 0);

        let txid = op.record().btc_txid.clone().expect("txid recorded");
        let tx = vault.chain.transaction(&txid).unwrap();
        assert_eq!(tx.inputs.len(), 2);
        assert_eq!(tx.outputs.len(), 3);
        assert_eq!(tx.value_to(&vault.recipient()), 6_000);
        assert_eq!(tx.value_to(&vault.funding_address(1)), 1_500);
        assert_eq!(tx.outputs[2].value, 0);
        assert_eq!(tx.embedded_id(), Some(RequestId::from_u64(77)));

        let stored = vault
            .store
            .get_operation(&RequestId::from_u64(77))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, OperationStatus::Completed);
        assert!(stored
            .actions
            .iter()
            .all(|a| a.status == ActionStatus::Executed));

        match updates.next().await {
            Some(BridgeEvent::OperationUpdated(r)) => assert_eq!(r.status, OperationStatus::Running),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_redeem_above_balance_fails_without_side_effects() {
        let vault = TestVault::with_issues(&[5_000, 3_000, 2_000]).await;
        let mut contract = MockBridgeContract::new();
        contract.expect_notify_redeem_complete().times(0);

        let mut op = Operation::new(
            OperationType::Redeem,
            params(&vault, 78, 20_000),
            deps(&vault, contract),
        )
        .unwrap();
        let (_tx, mut shutdown) = no_shutdown();

        assert_eq!(op.run(&mut shutdown).await, OperationStatus::Failed);
        assert_eq!(vault.chain.broadcast_count(), 0);
        assert_eq!(vault.wallet.reserved_count().await, 0);
        assert!(op.record().error.as_deref().unwrap().contains("insufficient funds"));
        assert_eq!(
            op.record().action_status("BuildTransaction"),
            Some(ActionStatus::Pending)
        );

        // The spend lock was released
        let _guard = vault.wallet.lock_vault().await;
    }

    #[tokio::test]
    async fn test_duplicate_operation_is_not_started() {
        let vault = TestVault::with_issues(&[5_000]).await;
        let (_tx, mut shutdown) = no_shutdown();

        let mut first = Operation::new(
            OperationType::Redeem,
            params(&vault, 79, 1_000),
            deps(&vault, notifying_contract()),
        )
        .unwrap();
        assert_eq!(first.run(&mut shutdown).await, OperationStatus::Completed);

        let mut contract = MockBridgeContract::new();
        contract.expect_notify_redeem_complete().times(0);
        let mut second = Operation::new(
            OperationType::Redeem,
            params(&vault, 79, 1_000),
            deps(&vault, contract),
        )
        .unwrap();
        assert_eq!(second.run(&mut shutdown).await, OperationStatus::Created);
        assert_eq!(vault.chain.broadcast_count(), 1);
    }

    #[tokio::test]
    async fn test_fee_outage_rolls_back_after_max_attempts() {
        let vault = TestVault::with_issues(&[5_000]).await;
        vault.chain.fail_next_fee_queries(10);

        let mut op = Operation::new(
            OperationType::Redeem,
            params(&vault, 80, 1_000),
            deps(&vault, MockBridgeContract::new()),
        )
        .unwrap();
        let (_tx, mut shutdown) = no_shutdown();

        assert_eq!(op.run(&mut shutdown).await, OperationStatus::RolledBack);
        assert_eq!(vault.chain.broadcast_count(), 0);
        assert_eq!(vault.wallet.reserved_count().await, 0);
    }

    #[tokio::test]
    async fn test_transient_fee_failure_is_retried() {
        let vault = TestVault::with_issues(&[5_000]).await;
        vault.chain.fail_next_fee_queries(2);

        let mut op = Operation::new(
            OperationType::Redeem,
            params(&vault, 81, 1_000),
            deps(&vault, notifying_contract()),
        )
        .unwrap();
        let (_tx, mut shutdown) = no_shutdown();

        assert_eq!(op.run(&mut shutdown).await, OperationStatus::Completed);
    }

    #[tokio::test]
    async fn test_ambiguous_broadcast_is_not_repeated() {
        let vault = TestVault::with_issues(&[5_000, 3_000]).await;
        vault.chain.accept_then_fail_broadcasts(1);

        let mut op = Operation::new(
            OperationType::Redeem,
            params(&vault, 82, 6_000),
            deps(&vault, notifying_contract()),
        )
        .unwrap();
        let (_tx, mut shutdown) = no_shutdown();

        assert_eq!(op.run(&mut shutdown).await, OperationStatus::Completed);
        assert_eq!(vault.chain.broadcast_count(), 1);
    }

    #[tokio::test]
    async fn test_recovery_after_restart_does_not_rebroadcast() {
        let vault = TestVault::with_issues(&[5_000, 3_000]).await;
        vault.chain.accept_then_fail_broadcasts(1);

        let mut contract = MockBridgeContract::new();
        contract.expect_notify_redeem_complete().times(0);
        let mut op = Operation::new(
            OperationType::Redeem,
            params(&vault, 83, 6_000),
            deps(&vault, contract),
        )
        .unwrap();

        // Process stops right after the first, ambiguous broadcast
        assert!(op.start().await);
        for index in 0..3 {
            let name = op.actions[index].name();
            let phase = op.actions[index].phase();
            op.write_ahead(index, phase).await.unwrap();
            let result = op.actions[index].execute(&mut op.ctx).await;
            if index < 2 {
                result.unwrap();
                op.record.set_action_status(name, ActionStatus::Executed);
            } else {
                assert!(matches!(result, Err(ActionError::BroadcastUnconfirmed(_))));
            }
        }
        op.persist().await;
        drop(op);

        // Restart: fresh wallet state, same chain and store
        let restarted = TestVault::with_parts(vault.chain.clone(), vault.store.clone(), &[]).await;
        let record = restarted
            .store
            .get_operation(&RequestId::from_u64(83))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, OperationStatus::Running);

        let mut resumed = Operation::resume(record, deps(&restarted, notifying_contract())).unwrap();
        assert!(resumed.ctx.broadcast_attempted);
        assert!(resumed.ctx.signed.is_some());
        let (_tx, mut shutdown) = no_shutdown();

        assert_eq!(resumed.run(&mut shutdown).await, OperationStatus::Completed);
        assert_eq!(vault.chain.broadcast_count(), 1);
        assert!(resumed.record().btc_txid.is_some());
    }

    #[tokio::test]
    async fn test_saved_transaction_is_sent_after_crash_before_broadcast() {
        let vault = TestVault::with_issues(&[5_000, 3_000]).await;

        let mut contract = MockBridgeContract::new();
        contract.expect_notify_redeem_complete().times(0);
        let mut op = Operation::new(
            OperationType::Redeem,
            params(&vault, 88, 6_000),
            deps(&vault, contract),
        )
        .unwrap();

        // Marker and signed tx are saved, then the process dies before sending
        assert!(op.start().await);
        for index in 0..2 {
            let name = op.actions[index].name();
            op.actions[index].execute(&mut op.ctx).await.unwrap();
            op.record.set_action_status(name, ActionStatus::Executed);
        }
        op.write_ahead(2, Phase::Broadcast).await.unwrap();
        drop(op);
        assert_eq!(vault.chain.broadcast_count(), 0);

        let restarted = TestVault::with_parts(vault.chain.clone(), vault.store.clone(), &[]).await;
        let record = restarted
            .store
            .get_operation(&RequestId::from_u64(88))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            record.action_status("SignAndBroadcast"),
            Some(ActionStatus::BroadcastUnconfirmed)
        );
        let saved_txid = record.btc_txid.clone().expect("txid saved with the marker");
        assert!(record.signed_tx.is_some());

        let mut resumed = Operation::resume(record, deps(&restarted, notifying_contract())).unwrap();
        let (_tx, mut shutdown) = no_shutdown();

        assert_eq!(resumed.run(&mut shutdown).await, OperationStatus::Completed);
        assert_eq!(vault.chain.broadcast_count(), 1);
        assert_eq!(resumed.record().btc_txid.as_deref(), Some(saved_txid.as_str()));
        assert!(vault.chain.transaction(&saved_txid).is_some());
        assert_eq!(restarted.wallet.reserved_count().await, 0);
    }

    #[tokio::test]
    async fn test_rejected_broadcast_resends_same_transaction() {
        let vault = TestVault::with_issues(&[5_000, 3_000]).await;
        vault.chain.fail_next_broadcasts(2);

        let mut op = Operation::new(
            OperationType::Redeem,
            params(&vault, 89, 6_000),
            deps(&vault, notifying_contract()),
        )
        .unwrap();
        let (_tx, mut shutdown) = no_shutdown();

        assert_eq!(op.run(&mut shutdown).await, OperationStatus::Completed);
        assert_eq!(vault.chain.broadcast_count(), 1);
        assert_eq!(vault.wallet.reserved_count().await, 0);

        let saved = decode_transaction(op.record().signed_tx.as_deref().unwrap()).unwrap();
        assert_eq!(
            op.record().btc_txid.as_deref(),
            Some(saved.compute_txid().to_string().as_str())
        );
    }

    #[tokio::test]
    async fn test_history_outage_during_selection_rolls_back() {
        let vault = TestVault::with_issues(&[5_000]).await;
        vault.chain.fail_next_history_reads(10);

        let mut op = Operation::new(
            OperationType::Redeem,
            params(&vault, 91, 1_000),
            deps(&vault, MockBridgeContract::new()),
        )
        .unwrap();
        let (_tx, mut shutdown) = no_shutdown();

        assert_eq!(op.run(&mut shutdown).await, OperationStatus::RolledBack);
        assert_eq!(vault.chain.broadcast_count(), 0);
        assert_eq!(vault.wallet.reserved_count().await, 0);
        assert_eq!(
            op.record().action_status("SelectUtxos"),
            Some(ActionStatus::Failed)
        );
        let _guard = vault.wallet.lock_vault().await;
    }

    #[tokio::test]
    async fn test_shutdown_before_broadcast_releases_reservations() {
        let vault = TestVault::with_issues(&[5_000, 3_000]).await;
        let mut contract = MockBridgeContract::new();
        contract.expect_notify_redeem_complete().times(0);
        let mut op = Operation::new(
            OperationType::Redeem,
            params(&vault, 92, 6_000),
            deps(&vault, contract),
        )
        .unwrap();

        assert!(op.start().await);
        op.actions[0].execute(&mut op.ctx).await.unwrap();
        op.record
            .set_action_status("SelectUtxos", ActionStatus::Executed);
        assert_eq!(vault.wallet.reserved_count().await, 2);

        let (_stop, mut stopped) = watch::channel(true);
        assert_eq!(op.execute_pipeline(&mut stopped).await, OperationStatus::Running);
        assert_eq!(vault.wallet.reserved_count().await, 0);
        drop(op);
        drop(vault.wallet.lock_vault().await);

        // Same wallet picks the operation up again
        let record = vault
            .store
            .get_operation(&RequestId::from_u64(92))
            .await
            .unwrap()
            .unwrap();
        let mut resumed = Operation::resume(record, deps(&vault, notifying_contract())).unwrap();
        let (_tx, mut shutdown) = no_shutdown();

        assert_eq!(resumed.run(&mut shutdown).await, OperationStatus::Completed);
        assert_eq!(vault.chain.broadcast_count(), 1);
        assert_eq!(vault.wallet.reserved_count().await, 0);
    }

    #[tokio::test]
    async fn test_recovered_rolling_back_finishes_rollback() {
        let vault = TestVault::with_issues(&[5_000]).await;
        let mut record = OperationRecord::new(
            OperationType::Redeem,
            &params(&vault, 84, 1_000),
            &["SelectUtxos"],
        );
        record.status = OperationStatus::RollingBack;

        let mut op = Operation::resume(record, deps(&vault, MockBridgeContract::new())).unwrap();
        let (_tx, mut shutdown) = no_shutdown();

        assert_eq!(op.run(&mut shutdown).await, OperationStatus::RolledBack);
        let stored = vault
            .store
            .get_operation(&RequestId::from_u64(84))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, OperationStatus::RolledBack);
    }

    #[tokio::test]
    async fn test_unknown_type_is_a_configuration_error() {
        let vault = TestVault::with_issues(&[]).await;
        let mut record = OperationRecord::new(
            OperationType::Redeem,
            &params(&vault, 85, 1_000),
            &[],
        );
        record.op_type = "ISSUE".into();

        let result = Operation::resume(record, deps(&vault, MockBridgeContract::new()));
        assert!(matches!(result, Err(ConfigError::UnsupportedOperation(_))));
    }

    #[tokio::test]
    async fn test_persistence_failures_are_retried() {
        let vault = TestVault::with_issues(&[5_000]).await;
        vault.store.fail_next_writes(3);

        let mut op = Operation::new(
            OperationType::Redeem,
            params(&vault, 86, 1_000),
            deps(&vault, notifying_contract()),
        )
        .unwrap();
        let (_tx, mut shutdown) = no_shutdown();

        assert_eq!(op.run(&mut shutdown).await, OperationStatus::Completed);
        let stored = vault
            .store
            .get_operation(&RequestId::from_u64(86))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, OperationStatus::Completed);
    }

    #[tokio::test]
    async fn test_shutdown_leaves_operation_running() {
        let chain = Arc::new(FakeChain::new(500).with_visibility_delay(1_000));
        let vault = TestVault::with_parts(chain, Arc::new(MemoryStore::new()), &[5_000]).await;
        let mut contract = MockBridgeContract::new();
        contract.expect_notify_redeem_complete().times(0);
        let mut deps = deps(&vault, contract);
        deps.settings.retry_base = Duration::from_millis(1);
        deps.settings.retry_max = Duration::from_millis(5);

        let mut op =
            Operation::new(OperationType::Redeem, params(&vault, 87, 1_000), deps).unwrap();
        let (stop, mut shutdown) = watch::channel(false);

        let runner = tokio::spawn(async move {
            let status = op.run(&mut shutdown).await;
            (status, op)
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.send(true).unwrap();

        let (status, op) = runner.await.unwrap();
        assert_eq!(status, OperationStatus::Running);
        assert_eq!(
            op.record().action_status("SignAndBroadcast"),
            Some(ActionStatus::Executed)
        );
        assert_eq!(vault.chain.broadcast_count(), 1);
    }

    /// Scripted action recording its calls
    struct Step {
        name: &'static str,
        fail_execute: bool,
        fail_rollback: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Action for Step {
        fn name(&self) -> &'static str {
            self.name
        }

        fn phase(&self) -> Phase {
            Phase::PreBroadcast
        }

        async fn execute(&self, _ctx: &mut ActionContext) -> Result<(), ActionError> {
            self.log.lock().unwrap().push(format!("execute {}", self.name));
            if self.fail_execute {
                return Err(ActionError::Fatal("scripted".into()));
            }
            Ok(())
        }

        async fn rollback(&self, _ctx: &mut ActionContext) -> Result<(), ActionError> {
            self.log.lock().unwrap().push(format!("rollback {}", self.name));
            if self.fail_rollback {
                return Err(ActionError::External("scripted".into()));
            }
            Ok(())
        }
    }

    fn scripted(
        vault: &TestVault,
        fail_rollback_of: Option<&'static str>,
    ) -> (Operation, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let names = ["first", "second", "third"];
        let actions: Vec<Box<dyn Action>> = names
            .iter()
            .map(|name| {
                Box::new(Step {
                    name: *name,
                    fail_execute: *name == "third",
                    fail_rollback: Some(*name) == fail_rollback_of,
                    log: log.clone(),
                }) as Box<dyn Action>
            })
            .collect();
        let record = OperationRecord::new(OperationType::Redeem, &params(vault, 90, 1), &names);
        let op = Operation::with_actions(record, actions, deps(vault, MockBridgeContract::new()));
        (op, log)
    }

    #[tokio::test]
    async fn test_rollbacks_run_in_reverse_order() {
        let vault = TestVault::with_issues(&[]).await;
        let (mut op, log) = scripted(&vault, None);
        let (_tx, mut shutdown) = no_shutdown();

        assert_eq!(op.run(&mut shutdown).await, OperationStatus::RolledBack);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "execute first",
                "execute second",
                "execute third",
                "rollback second",
                "rollback first",
            ]
        );
        assert_eq!(op.record().action_status("first"), Some(ActionStatus::RolledBack));
        assert_eq!(op.record().action_status("third"), Some(ActionStatus::Failed));
    }

    #[tokio::test]
    async fn test_failed_rollback_needs_manual_intervention() {
        let vault = TestVault::with_issues(&[]).await;
        let (mut op, log) = scripted(&vault, Some("second"));
        let (_tx, mut shutdown) = no_shutdown();

        assert_eq!(op.run(&mut shutdown).await, OperationStatus::Failed);
        // Traversal stops at the failing rollback
        assert_eq!(log.lock().unwrap().last().unwrap(), "rollback second");
        assert!(op.record().error.as_deref().unwrap().contains("rollback failed"));
    }
}
