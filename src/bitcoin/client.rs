//! Esplora API Client for Bitcoin Network Interaction
//!
//! Provides access to Bitcoin blockchain data via the Esplora API.
//! Used for reading funding address histories, broadcasting redeem
//! transactions and estimating the per-transaction fee.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use super::network::{BitcoinNetwork, ChainTx, ChainTxInput, ChainTxOutput};

/// Esplora API endpoints
pub const MAINNET_URL: &str = "https://blockstream.info/api";
pub const TESTNET_URL: &str = "https://blockstream.info/testnet/api";

/// Confirmed transactions per page of `/address/:addr/txs/chain`
const CHAIN_PAGE_SIZE: usize = 25;

/// Virtual size a redeem transaction is priced at (2 inputs, payout, change, embed)
pub const REFERENCE_TX_VSIZE: u64 = 260;

/// Lowest fee ever paid, in satoshis
pub const MIN_FEE_SATS: u64 = 500;

/// Confirmation target used for the fee estimate
const FEE_TARGET_BLOCKS: &str = "6";

/// Esplora HTTP client
#[derive(Debug, Clone)]
pub struct EsploraClient {
    client: Client,
    base_url: String,
}

impl EsploraClient {
    /// Create a new client with custom URL
    pub fn new(base_url: &str) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Create a client for Bitcoin mainnet
    pub fn new_mainnet() -> Self {
        Self::new(MAINNET_URL)
    }

    /// Create a client for Bitcoin testnet
    pub fn new_testnet() -> Self {
        Self::new(TESTNET_URL)
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Get current block height
    pub async fn get_block_height(&self) -> Result<u64, EsploraError> {
        let url = format!("{}/blocks/tip/height", self.base_url);
        let resp = self.client.get(&url).send().await?;

        let height: u64 = resp
            .text()
            .await?
            .trim()
            .parse()
            .map_err(|_| EsploraError::ParseError("Failed to parse block height".to_string()))?;

        Ok(height)
    }

    /// Broadcast a raw transaction
    pub async fn broadcast_tx(&self, tx_hex: &str) -> Result<String, EsploraError> {
        let url = format!("{}/tx", self.base_url);
        let resp = self.client.post(&url).body(tx_hex.to_string()).send().await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await.unwrap_or_default();
            return Err(EsploraError::BroadcastFailed(error_text));
        }

        let txid = resp.text().await?;
        Ok(txid.trim().to_string())
    }

    /// Get every transaction touching an address (mempool first, then confirmed)
    pub async fn get_address_txs(&self, address: &str) -> Result<Vec<ChainTx>, EsploraError> {
        let url = format!("{}/address/{}/txs", self.base_url, address);
        let mut txs = self.fetch_tx_page(&url, address).await?;

        // The first page holds up to 25 confirmed txs; keep paging while full
        let mut confirmed_on_page = txs.iter().filter(|t| t.confirmed).count();
        while confirmed_on_page >= CHAIN_PAGE_SIZE {
            let last_seen = match txs.iter().rev().find(|t| t.confirmed) {
                Some(tx) => tx.txid.clone(),
                None => break,
            };
            let url = format!(
                "{}/address/{}/txs/chain/{}",
                self.base_url, address, last_seen
            );
            let page = self.fetch_tx_page(&url, address).await?;
            confirmed_on_page = page.len();
            txs.extend(page);
        }

        Ok(txs)
    }

    async fn fetch_tx_page(&self, url: &str, address: &str) -> Result<Vec<ChainTx>, EsploraError> {
        let resp = self.client.get(url).send().await?;

        if !resp.status().is_success() {
            return Err(EsploraError::AddressNotFound(address.to_string()));
        }

        let txs: Vec<EsploraTx> = resp.json().await?;
        Ok(txs.into_iter().map(ChainTx::from).collect())
    }

    /// Get fee estimates (confirmation target -> sat/vB)
    pub async fn get_fee_estimates(&self) -> Result<HashMap<String, f64>, EsploraError> {
        let url = format!("{}/fee-estimates", self.base_url);
        let resp = self.client.get(&url).send().await?;

        if !resp.status().is_success() {
            return Err(EsploraError::ParseError(format!(
                "fee estimates unavailable: {}",
                resp.status()
            )));
        }

        Ok(resp.json().await?)
    }
}

/// Flat fee for a reference-sized transaction at `rate` sat/vB
pub fn flat_fee(rate: f64) -> u64 {
    let fee = (rate.max(0.0) * REFERENCE_TX_VSIZE as f64).ceil() as u64;
    fee.max(MIN_FEE_SATS)
}

#[async_trait]
impl BitcoinNetwork for EsploraClient {
    async fn address_transactions(&self, address: &str) -> Result<Vec<ChainTx>, EsploraError> {
        self.get_address_txs(address).await
    }

    async fn broadcast(&self, tx_hex: &str) -> Result<String, EsploraError> {
        self.broadcast_tx(tx_hex).await
    }

    async fn network_fee(&self) -> Result<u64, EsploraError> {
        let estimates = self.get_fee_estimates().await?;
        let rate = estimates
            .get(FEE_TARGET_BLOCKS)
            .copied()
            .or_else(|| estimates.values().copied().reduce(f64::min))
            .unwrap_or(1.0);

        Ok(flat_fee(rate))
    }

    async fn tip_height(&self) -> Result<u64, EsploraError> {
        self.get_block_height().await
    }
}

/// Transaction status
#[derive(Debug, Clone, Deserialize)]
pub struct EsploraTxStatus {
    pub confirmed: bool,
    pub block_height: Option<u64>,
    pub block_hash: Option<String>,
    pub block_time: Option<u64>,
}

/// Transaction as returned by `/address/:addr/txs`
#[derive(Debug, Clone, Deserialize)]
struct EsploraTx {
    txid: String,
    vin: Vec<EsploraVin>,
    vout: Vec<EsploraVout>,
    status: EsploraTxStatus,
}

#[derive(Debug, Clone, Deserialize)]
struct EsploraVin {
    txid: String,
    vout: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct EsploraVout {
    scriptpubkey: String,
    scriptpubkey_address: Option<String>,
    value: u64,
}

impl From<EsploraTx> for ChainTx {
    fn from(tx: EsploraTx) -> Self {
        Self {
            txid: tx.txid,
            inputs: tx
                .vin
                .into_iter()
                .map(|i| ChainTxInput {
                    prev_txid: i.txid,
                    prev_vout: i.vout,
                })
                .collect(),
            outputs: tx
                .vout
                .into_iter()
                .map(|o| ChainTxOutput {
                    script_hex: o.scriptpubkey,
                    address: o.scriptpubkey_address,
                    value: o.value,
                })
                .collect(),
            confirmed: tx.status.confirmed,
            block_height: tx.status.block_height,
        }
    }
}

/// Esplora error types
#[derive(Debug, thiserror::Error)]
pub enum EsploraError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Address not found: {0}")]
    AddressNotFound(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Broadcast failed: {0}")]
    BroadcastFailed(String),
}
