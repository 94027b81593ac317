//! Per-kind request handling
//!
//! Issue and redeem requests are refreshed the same way; what differs is the
//! contract call that reports their status and how the matching BTC
//! transaction is recognised.

use async_trait::async_trait;
use std::sync::Arc;

use crate::bitcoin::BitcoinNetwork;
use crate::contract::BridgeContract;
use crate::types::{BridgeRequest, RequestKind, RequestStatus};
use crate::wallet::parse_btc_address;

use super::SyncError;

#[async_trait]
pub trait RequestStrategy: Send + Sync {
    fn kind(&self) -> RequestKind;

    /// Current status according to the contract
    async fn fetch_status(&self, request: &BridgeRequest) -> Result<RequestStatus, SyncError>;

    /// Txid of the BTC transaction settling `request`, if visible
    async fn correlate_transaction(
        &self,
        request: &BridgeRequest,
    ) -> Result<Option<String>, SyncError>;
}

/// Deposits: the user pays exactly `amount` to the derived deposit address
pub struct IssueRequestStrategy {
    contract: Arc<dyn BridgeContract>,
    network: Arc<dyn BitcoinNetwork>,
    btc_network: bitcoin::Network,
}

impl IssueRequestStrategy {
    pub fn new(
        contract: Arc<dyn BridgeContract>,
        network: Arc<dyn BitcoinNetwork>,
        btc_network: bitcoin::Network,
    ) -> Self {
        Self {
            contract,
            network,
            btc_network,
        }
    }
}

#[async_trait]
impl RequestStrategy for IssueRequestStrategy {
    fn kind(&self) -> RequestKind {
        RequestKind::Issue
    }

    async fn fetch_status(&self, request: &BridgeRequest) -> Result<RequestStatus, SyncError> {
        Ok(self.contract.issue_status(request.id).await?)
    }

    async fn correlate_transaction(
        &self,
        request: &BridgeRequest,
    ) -> Result<Option<String>, SyncError> {
        let address = parse_btc_address(&request.btc_address, self.btc_network)
            .map_err(|e| SyncError::InvalidAddress(e.to_string()))?
            .to_string();
        let history = self.network.address_transactions(&address).await?;

        Ok(history
            .into_iter()
            .find(|tx| tx.value_to(&address) == request.amount)
            .map(|tx| tx.txid))
    }
}

/// Redeems: the vault's payout embeds the redeem id
pub struct RedeemRequestStrategy {
    contract: Arc<dyn BridgeContract>,
    network: Arc<dyn BitcoinNetwork>,
    btc_network: bitcoin::Network,
}

impl RedeemRequestStrategy {
    pub fn new(
        contract: Arc<dyn BridgeContract>,
        network: Arc<dyn BitcoinNetwork>,
        btc_network: bitcoin::Network,
    ) -> Self {
        Self {
            contract,
            network,
            btc_network,
        }
    }
}

#[async_trait]
impl RequestStrategy for RedeemRequestStrategy {
    fn kind(&self) -> RequestKind {
        RequestKind::Redeem
    }

    async fn fetch_status(&self, request: &BridgeRequest) -> Result<RequestStatus, SyncError> {
        Ok(self.contract.redeem_status(request.id).await?)
    }

    async fn correlate_transaction(
        &self,
        request: &BridgeRequest,
    ) -> Result<Option<String>, SyncError> {
        let address = parse_btc_address(&request.btc_address, self.btc_network)
            .map_err(|e| SyncError::InvalidAddress(e.to_string()))?
            .to_string();
        let history = self.network.address_transactions(&address).await?;

        Ok(history
            .into_iter()
            .find(|tx| tx.embeds(&request.id))
            .map(|tx| tx.txid))
    }
}
