//! Vault Client
//!
//! Top-level service. It turns pending redeem requests for this vault into
//! operations, restores interrupted operations on start, keeps the request
//! sync loops running and pings the dashboard.

pub mod recovery;

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::common::config::{ConfigError, VaultConfig};
use crate::common::logging::generate_correlation_id;
use crate::contract::{BridgeContract, ContractError, OnChainVault, TxReceipt};
use crate::events::{BridgeEvent, EventBus, Subscription, Topic};
use crate::operation::{Operation, OperationDeps, OperationSettings};
use crate::storage::{OperationStore, Page, Query, StorageError, StoreInfo};
use crate::sync::RequestSync;
use crate::types::{
    validate_amount, AmountError, BridgeRequest, OperationParams, OperationRecord,
    OperationStatus, OperationType, RequestId, RequestKind, RequestStatus,
};
use crate::wallet::{FreeOutput, WalletBtc, WalletError};

#[derive(Debug, Error)]
pub enum VaultClientError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("wallet error: {0}")]
    Wallet(#[from] WalletError),

    #[error("contract error: {0}")]
    Contract(#[from] ContractError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("invalid amount: {0}")]
    Amount(#[from] AmountError),

    #[error("vault client is already running")]
    AlreadyRunning,
}

/// Lifecycle of the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientStatus {
    Stopped,
    Launched,
}

/// Client settings
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub dashboard_url: Option<String>,
    pub ping_interval: Duration,
    pub operation: OperationSettings,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            dashboard_url: None,
            ping_interval: Duration::from_secs(30),
            operation: OperationSettings::default(),
        }
    }
}

impl From<&VaultConfig> for ClientSettings {
    fn from(config: &VaultConfig) -> Self {
        Self {
            dashboard_url: config.dashboard_url.clone(),
            ping_interval: config.ping_interval,
            operation: config.operation_settings(),
        }
    }
}

/// Snapshot returned by [`VaultClient::info`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultInfo {
    /// Every request sync loop has completed a pass
    pub synchronized: bool,
    pub registered: bool,
    pub status: ClientStatus,
    pub vault_address: String,
    pub vault_info: Option<OnChainVault>,
    pub balances: BTreeMap<String, u64>,
    pub operations: StoreInfo,
}

#[derive(Debug, Serialize)]
struct PingBody<'a> {
    vault: &'a str,
}

type RunningOperations = Arc<Mutex<HashMap<RequestId, JoinHandle<OperationStatus>>>>;

/// Vault client
pub struct VaultClient {
    vault: String,
    settings: ClientSettings,
    wallet: Arc<WalletBtc>,
    contract: Arc<dyn BridgeContract>,
    store: Arc<dyn OperationStore>,
    events: EventBus,
    syncs: Vec<Arc<RequestSync>>,
    running: RunningOperations,
    status: RwLock<ClientStatus>,
    shutdown: watch::Sender<bool>,
    http: reqwest::Client,
}

impl VaultClient {
    pub fn new(
        settings: ClientSettings,
        wallet: Arc<WalletBtc>,
        contract: Arc<dyn BridgeContract>,
        store: Arc<dyn OperationStore>,
        events: EventBus,
        syncs: Vec<Arc<RequestSync>>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            vault: contract.vault_address(),
            settings,
            wallet,
            contract,
            store,
            events,
            syncs,
            running: Arc::new(Mutex::new(HashMap::new())),
            status: RwLock::new(ClientStatus::Stopped),
            shutdown,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn vault_address(&self) -> &str {
        &self.vault
    }

    pub fn wallet(&self) -> &Arc<WalletBtc> {
        &self.wallet
    }

    fn deps(&self) -> OperationDeps {
        OperationDeps {
            store: self.store.clone(),
            wallet: self.wallet.clone(),
            contract: self.contract.clone(),
            events: self.events.clone(),
            settings: self.settings.operation.clone(),
        }
    }

    /// Start intake, sync and ping loops, then restore interrupted operations
    pub async fn start(self: &Arc<Self>) -> Result<(), VaultClientError> {
        {
            let mut status = self.status.write().await;
            if *status == ClientStatus::Launched {
                return Err(VaultClientError::AlreadyRunning);
            }
            *status = ClientStatus::Launched;
        }
        self.shutdown.send_replace(false);

        // Subscribe before the sync loops publish anything
        let intake = self.events.subscribe(&[Topic::RedeemRequests]);
        {
            let client = self.clone();
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move { client.intake_loop(intake, shutdown).await });
        }

        for sync in &self.syncs {
            if let Err(e) = sync.start().await {
                error!(target: "vault::sync", kind = %sync.kind(), error = %e, "Failed to load tracked requests");
            }
            let sync = sync.clone();
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move { sync.run(shutdown).await });
        }

        if self.settings.dashboard_url.is_some() {
            let client = self.clone();
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move { client.ping_loop(shutdown).await });
        }

        let restored = self.load_operations().await?;
        info!(target: "vault::system", vault = %self.vault, restored, "Vault client started");
        Ok(())
    }

    /// Resume every in-progress operation from the store
    pub async fn load_operations(&self) -> Result<usize, VaultClientError> {
        let operations = recovery::load_operations(&self.deps()).await?;
        let mut running = self.running.lock().await;
        let count = operations.len();

        for operation in operations {
            let id = operation.record().id;
            if running.contains_key(&id) {
                continue;
            }
            running.insert(id, self.spawn_operation(operation));
        }
        Ok(count)
    }

    /// Start an operation for `params` unless one already exists for its id
    pub async fn create_operation(
        &self,
        op_type: OperationType,
        params: OperationParams,
    ) -> Result<Option<OperationRecord>, VaultClientError> {
        let mut running = self.running.lock().await;

        if running.contains_key(&params.id) || self.store.get_operation(&params.id).await?.is_some()
        {
            debug!(target: "vault::operation", id = %params.id, "Operation already created");
            return Ok(None);
        }

        info!(
            target: "vault::operation",
            id = %params.id,
            op_type = %op_type,
            amount = params.amount,
            btc_address = %params.btc_address,
            "Start new operation"
        );

        let operation = Operation::new(op_type, params, self.deps())?;
        let record = operation.record().clone();
        running.insert(record.id, self.spawn_operation(operation));
        Ok(Some(record))
    }

    fn spawn_operation(&self, mut operation: Operation) -> JoinHandle<OperationStatus> {
        let running = self.running.clone();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let id = operation.record().id;
            let status = operation.run(&mut shutdown).await;
            if status.is_terminal() {
                running.lock().await.remove(&id);
            }
            status
        })
    }

    /// Turn a pending redeem for this vault into an operation
    pub async fn add_redeem(
        &self,
        redeem: &BridgeRequest,
    ) -> Result<Option<OperationRecord>, VaultClientError> {
        if redeem.kind != RequestKind::Redeem
            || !redeem.is_for_vault(&self.vault)
            || redeem.status != RequestStatus::Pending
        {
            return Ok(None);
        }

        validate_amount(redeem.amount)?;
        let dust_limit = self.wallet.settings().dust_limit;
        if redeem.amount < dust_limit {
            return Err(AmountError::BelowDust {
                amount: redeem.amount,
                limit: dust_limit,
            }
            .into());
        }
        self.create_operation(OperationType::Redeem, OperationParams::from(redeem))
            .await
    }

    async fn intake_loop(&self, mut events: Subscription, mut shutdown: watch::Receiver<bool>) {
        loop {
            let event = tokio::select! {
                event = events.next() => event,
                _ = shutdown.changed() => None,
            };

            let redeem = match event {
                Some(BridgeEvent::RequestAdded(r)) | Some(BridgeEvent::RequestUpdated(r)) => r,
                Some(BridgeEvent::OperationUpdated(_)) => continue,
                None => break,
            };

            if let Err(e) = self.add_redeem(&redeem).await {
                error!(target: "vault::operation", id = %redeem.id, error = %e, "Failed to create redeem operation");
            }
        }
        debug!(target: "vault::system", "Intake loop stopped");
    }

    /// One liveness ping; failures are logged and ignored
    pub async fn ping_dashboard(&self) {
        let Some(url) = &self.settings.dashboard_url else {
            return;
        };

        let correlation_id = generate_correlation_id();
        let result = self
            .http
            .post(format!("{}/monitor/ping", url.trim_end_matches('/')))
            .json(&PingBody { vault: &self.vault })
            .send()
            .await
            .and_then(|r| r.error_for_status());

        match result {
            Ok(_) => debug!(target: "vault::system", correlation_id = %correlation_id, "Dashboard ping sent"),
            Err(e) => {
                warn!(target: "vault::system", correlation_id = %correlation_id, error = %e, "Dashboard ping failed")
            }
        }
    }

    async fn ping_loop(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            self.ping_dashboard().await;
            tokio::select! {
                _ = tokio::time::sleep(self.settings.ping_interval) => {}
                _ = shutdown.changed() => break,
            }
        }
    }

    pub async fn info(&self) -> Result<VaultInfo, VaultClientError> {
        let mut synchronized = true;
        for sync in &self.syncs {
            synchronized &= sync.last_update().await.is_some();
        }

        let vault_info = self.contract.vault_info().await?;
        let registered = vault_info.registered;

        Ok(VaultInfo {
            synchronized,
            registered,
            status: *self.status.read().await,
            vault_address: self.vault.clone(),
            vault_info: registered.then_some(vault_info),
            balances: self.wallet.get_balances().await?,
            operations: self.store.operations_info().await?,
        })
    }

    /// Register with `collateral` and the uncompressed master public key
    pub async fn register(&self, collateral: u128) -> Result<TxReceipt, VaultClientError> {
        let key = self.wallet.deriver().master_public_key()?;
        let receipt = self.contract.register(collateral, key.x, key.y).await?;

        info!(
            target: "vault::system",
            vault = %self.vault,
            tx = %receipt.transaction_hash,
            "Vault registered"
        );
        Ok(receipt)
    }

    /// Free outputs covering `amount`, or all of them
    pub async fn list_free_outputs(
        &self,
        amount: Option<u64>,
    ) -> Result<Vec<FreeOutput>, VaultClientError> {
        let outputs = match amount {
            Some(amount) => self.wallet.get_free_outputs(amount, false).await?,
            None => self.wallet.get_free_outputs(0, true).await?,
        };
        Ok(outputs)
    }

    pub async fn get_data(&self, query: &Query) -> Result<Page<OperationRecord>, VaultClientError> {
        Ok(self.store.query_operations(query).await?)
    }

    pub async fn get_info(&self) -> Result<StoreInfo, VaultClientError> {
        Ok(self.store.operations_info().await?)
    }

    pub async fn running_operations(&self) -> usize {
        self.running.lock().await.len()
    }

    /// Signal every loop and operation to stop, then wait for operations
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        *self.status.write().await = ClientStatus::Stopped;

        let handles: Vec<(RequestId, JoinHandle<OperationStatus>)> =
            self.running.lock().await.drain().collect();
        for (id, handle) in handles {
            match handle.await {
                Ok(status) => debug!(target: "vault::operation", id = %id, status = %status, "Operation stopped"),
                Err(e) => error!(target: "vault::operation", id = %id, error = %e, "Operation task failed"),
            }
        }
        info!(target: "vault::system", "Vault client stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::MockBridgeContract;
    use crate::storage::Sort;
    use crate::testing::{TestVault, TEST_VAULT};

    fn settings() -> ClientSettings {
        ClientSettings {
            dashboard_url: None,
            ping_interval: Duration::from_secs(30),
            operation: OperationSettings {
                retry_base: Duration::from_millis(1),
                retry_max: Duration::from_millis(5),
                ..OperationSettings::default()
            },
        }
    }

    fn base_contract() -> MockBridgeContract {
        let mut contract = MockBridgeContract::new();
        contract
            .expect_vault_address()
            .return_const(TEST_VAULT.to_string());
        contract
    }

    fn client(vault: &TestVault, contract: MockBridgeContract) -> Arc<VaultClient> {
        Arc::new(VaultClient::new(
            settings(),
            vault.wallet.clone(),
            Arc::new(contract),
            vault.store.clone(),
            EventBus::default(),
            vec![],
        ))
    }

    fn redeem(vault: &TestVault, id: u64, amount: u64, status: RequestStatus) -> BridgeRequest {
        BridgeRequest {
            kind: RequestKind::Redeem,
            id: RequestId::from_u64(id),
            requester: "0xuser".into(),
            vault: "0xVAULT".into(),
            btc_address: vault.recipient(),
            amount,
            status,
            btc_tx: None,
            opentime: 1,
            last_update: 1,
        }
    }

    async fn wait_for(client: &VaultClient, id: u64, status: OperationStatus) -> OperationRecord {
        for _ in 0..500 {
            if let Some(record) = client
                .store
                .get_operation(&RequestId::from_u64(id))
                .await
                .unwrap()
            {
                if record.status == status {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("operation {} never reached {}", id, status);
    }

    #[tokio::test]
    async fn test_pending_redeem_creates_one_operation() {
        let vault = TestVault::with_issues(&[5_000, 3_000]).await;
        let mut contract = base_contract();
        contract
            .expect_redeem_status()
            .returning(|_| Ok(RequestStatus::Pending));
        contract
            .expect_notify_redeem_complete()
            .times(1)
            .returning(|_, _| {
                Ok(TxReceipt {
                    transaction_hash: "0xdone".into(),
                    status: true,
                })
            });
        let client = client(&vault, contract);

        let request = redeem(&vault, 7, 4_000, RequestStatus::Pending);
        assert!(client.add_redeem(&request).await.unwrap().is_some());
        assert!(client.add_redeem(&request).await.unwrap().is_none());

        let record = wait_for(&client, 7, OperationStatus::Completed).await;
        assert!(record.btc_txid.is_some());
        assert_eq!(vault.chain.broadcast_count(), 1);

        // Finished operations are not started again
        assert!(client.add_redeem(&request).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_foreign_or_settled_redeems_are_ignored() {
        let vault = TestVault::with_issues(&[5_000]).await;
        let client = client(&vault, base_contract());

        let mut foreign = redeem(&vault, 1, 1_000, RequestStatus::Pending);
        foreign.vault = "0xother".into();
        assert!(client.add_redeem(&foreign).await.unwrap().is_none());

        let settled = redeem(&vault, 2, 1_000, RequestStatus::Completed);
        assert!(client.add_redeem(&settled).await.unwrap().is_none());

        let zero = redeem(&vault, 3, 0, RequestStatus::Pending);
        assert!(matches!(
            client.add_redeem(&zero).await,
            Err(VaultClientError::Amount(_))
        ));

        let dust = redeem(&vault, 4, 100, RequestStatus::Pending);
        assert!(matches!(
            client.add_redeem(&dust).await,
            Err(VaultClientError::Amount(AmountError::BelowDust { amount: 100, .. }))
        ));
        assert_eq!(client.running_operations().await, 0);
    }

    #[tokio::test]
    async fn test_intake_picks_up_published_redeems() {
        let vault = TestVault::with_issues(&[5_000]).await;
        let mut contract = base_contract();
        contract
            .expect_redeem_status()
            .returning(|_| Ok(RequestStatus::Pending));
        contract
            .expect_notify_redeem_complete()
            .returning(|_, _| {
                Ok(TxReceipt {
                    transaction_hash: "0xdone".into(),
                    status: true,
                })
            });
        let client = client(&vault, contract);
        client.start().await.unwrap();

        client.events.publish(BridgeEvent::RequestAdded(redeem(
            &vault,
            9,
            1_000,
            RequestStatus::Pending,
        )));

        wait_for(&client, 9, OperationStatus::Completed).await;
        client.stop().await;
        assert_eq!(client.running_operations().await, 0);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let vault = TestVault::with_issues(&[]).await;
        let client = client(&vault, base_contract());
        client.start().await.unwrap();
        assert!(matches!(
            client.start().await,
            Err(VaultClientError::AlreadyRunning)
        ));
        client.stop().await;
    }

    #[tokio::test]
    async fn test_info_and_queries() {
        let vault = TestVault::with_issues(&[5_000, 3_000]).await;
        let mut contract = base_contract();
        contract.expect_vault_info().returning(|| {
            Ok(OnChainVault {
                registered: true,
                status: "1".into(),
                collateral: "1000".into(),
                pub_x: None,
                pub_y: None,
            })
        });
        let client = client(&vault, contract);

        let info = client.info().await.unwrap();
        assert!(info.registered);
        assert!(info.synchronized);
        assert_eq!(info.status, ClientStatus::Stopped);
        assert_eq!(info.balances.values().sum::<u64>(), 8_000);
        assert_eq!(info.operations.total, 0);

        assert_eq!(client.list_free_outputs(None).await.unwrap().len(), 2);
        assert_eq!(client.list_free_outputs(Some(4_000)).await.unwrap().len(), 1);

        let page = client
            .get_data(&Query::all().with_sort(Sort::descending("lastUpdate")))
            .await
            .unwrap();
        assert_eq!(page.total_elements, 0);
        assert_eq!(client.get_info().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_register_sends_master_public_key() {
        let vault = TestVault::with_issues(&[]).await;
        let expected = vault.deriver.master_public_key().unwrap();

        let mut contract = base_contract();
        contract
            .expect_register()
            .withf(move |collateral, x, y| *collateral == 5_000 && *x == expected.x && *y == expected.y)
            .times(1)
            .returning(|_, _, _| {
                Ok(TxReceipt {
                    transaction_hash: "0xreg".into(),
                    status: true,
                })
            });
        let client = client(&vault, contract);

        let receipt = client.register(5_000).await.unwrap();
        assert_eq!(receipt.transaction_hash, "0xreg");
    }

    #[tokio::test]
    async fn test_restart_resumes_running_operation() {
        let vault = TestVault::with_issues(&[5_000]).await;
        let sent = vault
            .wallet
            .build_and_send(1_000, &vault.recipient(), &RequestId::from_u64(11))
            .await
            .unwrap();

        let mut record = OperationRecord::new(
            OperationType::Redeem,
            &OperationParams::from(&redeem(&vault, 11, 1_000, RequestStatus::Pending)),
            &[
                "SelectUtxos",
                "BuildTransaction",
                "SignAndBroadcast",
                "ConfirmOnChain",
                "NotifyContract",
            ],
        );
        record.status = OperationStatus::Running;
        record.set_action_status("SignAndBroadcast", crate::types::ActionStatus::BroadcastUnconfirmed);
        vault.store.upsert_operation(&record).await.unwrap();

        let mut contract = base_contract();
        contract
            .expect_redeem_status()
            .returning(|_| Ok(RequestStatus::Pending));
        contract
            .expect_notify_redeem_complete()
            .times(1)
            .returning(|_, _| {
                Ok(TxReceipt {
                    transaction_hash: "0xdone".into(),
                    status: true,
                })
            });
        let client = client(&vault, contract);

        assert_eq!(client.load_operations().await.unwrap(), 1);
        let done = wait_for(&client, 11, OperationStatus::Completed).await;
        assert_eq!(done.btc_txid, sent.transaction_hash);
        assert_eq!(vault.chain.broadcast_count(), 1);
    }
}
