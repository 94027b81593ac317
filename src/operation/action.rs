//! Compensable actions
//!
//! An action is a forward step plus its paired rollback. Actions of one
//! operation share an [`ActionContext`] and run strictly in order.

use async_trait::async_trait;
use bitcoin::Transaction;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

use crate::bitcoin::ChainTx;
use crate::contract::ContractError;
use crate::types::OperationParams;
use crate::wallet::{FreeOutput, UnsignedTx, WalletError};

/// Where an action sits relative to the irreversible broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    PreBroadcast,
    Broadcast,
    PostBroadcast,
}

/// Action failures, classified by how the operation reacts
#[derive(Debug, Error)]
pub enum ActionError {
    /// Definitive for the request
    #[error("insufficient funds: need {required} sats, have {available} sats")]
    InsufficientFunds { required: u64, available: u64 },

    /// Network, RPC or contract failure; retried
    #[error("external call failed: {0}")]
    External(String),

    /// A broadcast may or may not have reached the network
    #[error("broadcast unconfirmed: {0}")]
    BroadcastUnconfirmed(String),

    /// Waiting for the chain to show the transaction
    #[error("not yet confirmed: {0}")]
    NotYetConfirmed(String),

    /// Retrying cannot help
    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<WalletError> for ActionError {
    fn from(err: WalletError) -> Self {
        match err {
            WalletError::InsufficientFunds {
                required,
                available,
            } => ActionError::InsufficientFunds {
                required,
                available,
            },
            WalletError::Network(e) => ActionError::External(e.to_string()),
            WalletError::Storage(e) => ActionError::External(e.to_string()),
            WalletError::BroadcastUnconfirmed(msg) => ActionError::BroadcastUnconfirmed(msg),
            other => ActionError::Fatal(other.to_string()),
        }
    }
}

impl From<ContractError> for ActionError {
    fn from(err: ContractError) -> Self {
        ActionError::External(err.to_string())
    }
}

/// State shared by the actions of one operation
pub struct ActionContext {
    pub params: OperationParams,
    pub fee: Option<u64>,
    pub selected: Vec<FreeOutput>,
    pub unsigned: Option<UnsignedTx>,
    pub signed: Option<Transaction>,
    /// Txid of the signed tx, or a hint restored from the record
    pub txid: Option<String>,
    /// A broadcast was attempted (possibly before a restart)
    pub broadcast_attempted: bool,
    /// Transaction located on chain by content
    pub found: Option<ChainTx>,
    /// Per-vault spend lock, held from selection through broadcast
    pub spend_guard: Option<OwnedMutexGuard<()>>,
}

impl ActionContext {
    pub fn new(params: OperationParams) -> Self {
        Self {
            params,
            fee: None,
            selected: Vec::new(),
            unsigned: None,
            signed: None,
            txid: None,
            broadcast_attempted: false,
            found: None,
            spend_guard: None,
        }
    }

    /// Once true, nothing may be rolled back
    pub fn is_irreversible(&self) -> bool {
        self.broadcast_attempted || self.found.is_some()
    }

    pub fn release_spend_lock(&mut self) {
        self.spend_guard = None;
    }
}

/// A forward step with a paired rollback
#[async_trait]
pub trait Action: Send + Sync {
    fn name(&self) -> &'static str;

    fn phase(&self) -> Phase;

    /// Work that must be saved before a broadcast is marked as attempted
    async fn prepare(&self, _ctx: &mut ActionContext) -> Result<(), ActionError> {
        Ok(())
    }

    async fn execute(&self, ctx: &mut ActionContext) -> Result<(), ActionError>;

    async fn rollback(&self, ctx: &mut ActionContext) -> Result<(), ActionError>;
}
