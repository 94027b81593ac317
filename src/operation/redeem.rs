//! REDEEM pipeline
//!
//! Pays a redeem request out of the vault's deposit outputs. Every step that
//! touches the chain first looks for an earlier payout carrying the redeem id,
//! so a retried or recovered operation never pays twice.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use crate::contract::BridgeContract;
use crate::types::RequestStatus;
use crate::wallet::WalletBtc;

use super::action::{Action, ActionContext, ActionError, Phase};

/// Lock the vault, fetch the fee and reserve outputs covering amount + fee
pub struct SelectUtxos {
    wallet: Arc<WalletBtc>,
}

impl SelectUtxos {
    pub fn new(wallet: Arc<WalletBtc>) -> Self {
        Self { wallet }
    }
}

#[async_trait]
impl Action for SelectUtxos {
    fn name(&self) -> &'static str {
        "SelectUtxos"
    }

    fn phase(&self) -> Phase {
        Phase::PreBroadcast
    }

    async fn execute(&self, ctx: &mut ActionContext) -> Result<(), ActionError> {
        if ctx.found.is_some() {
            return Ok(());
        }

        let existing = self
            .wallet
            .find_redeem_transaction(&ctx.params.btc_address, &ctx.params.id)
            .await?;
        if let Some(tx) = existing {
            info!(
                target: "vault::operation",
                id = %ctx.params.id,
                txid = %tx.txid,
                "Redeem already paid on chain"
            );
            ctx.found = Some(tx);
            return Ok(());
        }

        if ctx.broadcast_attempted {
            // The saved transaction fixes the inputs; keep other operations off them
            let Some(signed) = &ctx.signed else {
                return Err(ActionError::NotYetConfirmed(format!(
                    "earlier broadcast of {} not visible yet",
                    ctx.txid.as_deref().unwrap_or("unknown tx")
                )));
            };
            self.wallet.reserve_inputs(signed).await;
            return Ok(());
        }

        if ctx.spend_guard.is_none() {
            ctx.spend_guard = Some(self.wallet.lock_vault().await);
        }

        let amount = ctx.params.amount;
        let selected = async {
            let fee = self.wallet.network_fee().await?;
            let required = amount
                .checked_add(fee)
                .ok_or_else(|| ActionError::Fatal("amount + fee overflows".into()))?;
            let outputs = self.wallet.select_outputs(required).await?;
            Ok::<_, ActionError>((fee, outputs))
        }
        .await;

        match selected {
            Ok((fee, outputs)) => {
                debug!(
                    target: "vault::operation",
                    id = %ctx.params.id,
                    fee,
                    inputs = outputs.len(),
                    "Outputs selected"
                );
                ctx.fee = Some(fee);
                ctx.selected = outputs;
                Ok(())
            }
            Err(e) => {
                ctx.release_spend_lock();
                Err(e)
            }
        }
    }

    async fn rollback(&self, ctx: &mut ActionContext) -> Result<(), ActionError> {
        self.wallet.release(&ctx.selected).await;
        ctx.selected.clear();
        ctx.fee = None;
        ctx.release_spend_lock();
        Ok(())
    }
}

/// Payout, change and redeem id embed
pub struct BuildTransaction {
    wallet: Arc<WalletBtc>,
}

impl BuildTransaction {
    pub fn new(wallet: Arc<WalletBtc>) -> Self {
        Self { wallet }
    }
}

#[async_trait]
impl Action for BuildTransaction {
    fn name(&self) -> &'static str {
        "BuildTransaction"
    }

    fn phase(&self) -> Phase {
        Phase::PreBroadcast
    }

    async fn execute(&self, ctx: &mut ActionContext) -> Result<(), ActionError> {
        if ctx.found.is_some() || ctx.signed.is_some() {
            return Ok(());
        }

        let fee = ctx
            .fee
            .ok_or_else(|| ActionError::Fatal("no fee recorded before build".into()))?;
        let unsigned = self.wallet.build_transaction(
            &ctx.selected,
            ctx.params.amount,
            fee,
            &ctx.params.btc_address,
            &ctx.params.id,
        )?;

        debug!(
            target: "vault::operation",
            id = %ctx.params.id,
            change = unsigned.change,
            "Redeem transaction built"
        );
        ctx.unsigned = Some(unsigned);
        Ok(())
    }

    async fn rollback(&self, ctx: &mut ActionContext) -> Result<(), ActionError> {
        ctx.unsigned = None;
        ctx.signed = None;
        Ok(())
    }
}

/// Sign once, re-check the chain, broadcast
pub struct SignAndBroadcast {
    wallet: Arc<WalletBtc>,
}

impl SignAndBroadcast {
    pub fn new(wallet: Arc<WalletBtc>) -> Self {
        Self { wallet }
    }
}

#[async_trait]
impl Action for SignAndBroadcast {
    fn name(&self) -> &'static str {
        "SignAndBroadcast"
    }

    fn phase(&self) -> Phase {
        Phase::Broadcast
    }

    /// Sign once; the operation saves the result before broadcasting
    async fn prepare(&self, ctx: &mut ActionContext) -> Result<(), ActionError> {
        if ctx.found.is_some() || ctx.signed.is_some() {
            return Ok(());
        }

        let unsigned = ctx
            .unsigned
            .as_ref()
            .ok_or_else(|| ActionError::Fatal("nothing to sign".into()))?;
        let tx = self.wallet.sign_transaction(unsigned)?;
        ctx.txid = Some(tx.compute_txid().to_string());
        ctx.signed = Some(tx);
        Ok(())
    }

    async fn execute(&self, ctx: &mut ActionContext) -> Result<(), ActionError> {
        if ctx.found.is_some() {
            ctx.release_spend_lock();
            return Ok(());
        }

        let existing = self
            .wallet
            .find_redeem_transaction(&ctx.params.btc_address, &ctx.params.id)
            .await?;
        if let Some(tx) = existing {
            ctx.txid = Some(tx.txid.clone());
            ctx.found = Some(tx);
            ctx.release_spend_lock();
            return Ok(());
        }

        // A retry re-sends the saved transaction unchanged
        self.prepare(ctx).await?;
        let signed = ctx
            .signed
            .clone()
            .ok_or_else(|| ActionError::Fatal("nothing to broadcast".into()))?;

        ctx.broadcast_attempted = true;
        let result = self.wallet.broadcast(&signed).await;
        ctx.release_spend_lock();
        result?;
        Ok(())
    }

    async fn rollback(&self, _ctx: &mut ActionContext) -> Result<(), ActionError> {
        // A broadcast cannot be recalled
        Ok(())
    }
}

/// Locate the payout on chain at the required depth
pub struct ConfirmOnChain {
    wallet: Arc<WalletBtc>,
    required_confirmations: u32,
}

impl ConfirmOnChain {
    pub fn new(wallet: Arc<WalletBtc>, required_confirmations: u32) -> Self {
        Self {
            wallet,
            required_confirmations,
        }
    }
}

#[async_trait]
impl Action for ConfirmOnChain {
    fn name(&self) -> &'static str {
        "ConfirmOnChain"
    }

    fn phase(&self) -> Phase {
        Phase::PostBroadcast
    }

    async fn execute(&self, ctx: &mut ActionContext) -> Result<(), ActionError> {
        let id = ctx.params.id;
        let hint = ctx
            .found
            .as_ref()
            .map(|tx| tx.txid.clone())
            .or_else(|| ctx.txid.clone());

        // Change lands back in the vault; without change, watch the recipient
        let found = match &ctx.unsigned {
            Some(unsigned) => {
                let address = if unsigned.change > 0 {
                    &unsigned.change_address
                } else {
                    &unsigned.recipient
                };
                self.wallet
                    .find_transaction(address, hint.as_deref(), &id)
                    .await?
            }
            None => {
                self.wallet
                    .find_redeem_transaction(&ctx.params.btc_address, &id)
                    .await?
            }
        };

        let tx = found.ok_or_else(|| {
            ActionError::NotYetConfirmed(format!(
                "{} not found on chain",
                hint.as_deref().unwrap_or("redeem transaction")
            ))
        })?;

        if self.required_confirmations > 0 {
            let tip = self.wallet.tip_height().await?;
            let depth = tx.confirmations(tip);
            if depth < self.required_confirmations as u64 {
                let txid = tx.txid.clone();
                ctx.found = Some(tx);
                return Err(ActionError::NotYetConfirmed(format!(
                    "{} has {} of {} confirmations",
                    txid, depth, self.required_confirmations
                )));
            }
        }

        info!(target: "vault::operation", id = %id, txid = %tx.txid, "Redeem transaction on chain");
        self.wallet.release(&ctx.selected).await;
        if let Some(signed) = &ctx.signed {
            self.wallet.release_inputs(signed).await;
        }
        ctx.txid = Some(tx.txid.clone());
        ctx.found = Some(tx);
        Ok(())
    }

    async fn rollback(&self, _ctx: &mut ActionContext) -> Result<(), ActionError> {
        Ok(())
    }
}

/// Report the payout to the bridge contract
pub struct NotifyContract {
    contract: Arc<dyn BridgeContract>,
}

impl NotifyContract {
    pub fn new(contract: Arc<dyn BridgeContract>) -> Self {
        Self { contract }
    }
}

#[async_trait]
impl Action for NotifyContract {
    fn name(&self) -> &'static str {
        "NotifyContract"
    }

    fn phase(&self) -> Phase {
        Phase::PostBroadcast
    }

    async fn execute(&self, ctx: &mut ActionContext) -> Result<(), ActionError> {
        let id = ctx.params.id;
        let txid = ctx
            .found
            .as_ref()
            .map(|tx| tx.txid.clone())
            .ok_or_else(|| ActionError::NotYetConfirmed("redeem transaction not located".into()))?;

        if self.contract.redeem_status(id).await? == RequestStatus::Completed {
            info!(target: "vault::operation", id = %id, "Redeem already completed on contract");
            return Ok(());
        }

        let receipt = self.contract.notify_redeem_complete(id, txid).await?;
        info!(
            target: "vault::operation",
            id = %id,
            receipt = %receipt.transaction_hash,
            "Contract notified of redeem payout"
        );
        Ok(())
    }

    async fn rollback(&self, _ctx: &mut ActionContext) -> Result<(), ActionError> {
        Ok(())
    }
}
