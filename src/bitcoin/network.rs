//! Bitcoin network collaborator
//!
//! The wallet talks to the chain only through [`BitcoinNetwork`], so the
//! operation engine can run against Esplora in production and an in-memory
//! chain in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::client::EsploraError;
use crate::types::RequestId;

/// Script prefix of a 32-byte data-embed output: OP_RETURN OP_PUSHBYTES_32
pub const EMBED_SCRIPT_PREFIX: &str = "6a20";

/// Input of a chain transaction (the outpoint it spends)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTxInput {
    pub prev_txid: String,
    pub prev_vout: u32,
}

/// Output of a chain transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTxOutput {
    pub script_hex: String,
    /// None for non-standard or data outputs
    pub address: Option<String>,
    pub value: u64,
}

/// A transaction as seen in an address history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTx {
    pub txid: String,
    pub inputs: Vec<ChainTxInput>,
    pub outputs: Vec<ChainTxOutput>,
    pub confirmed: bool,
    pub block_height: Option<u64>,
}

impl ChainTx {
    /// True if any output is the data embed of `id`
    pub fn embeds(&self, id: &RequestId) -> bool {
        let expected = format!("{}{}", EMBED_SCRIPT_PREFIX, hex::encode(id.as_bytes()));
        self.outputs
            .iter()
            .any(|o| o.script_hex.eq_ignore_ascii_case(&expected))
    }

    /// Recover a redeem id from the first data-embed output
    pub fn embedded_id(&self) -> Option<RequestId> {
        self.outputs.iter().find_map(|o| {
            let data = o.script_hex.strip_prefix(EMBED_SCRIPT_PREFIX)?;
            let bytes: [u8; 32] = hex::decode(data).ok()?.try_into().ok()?;
            Some(RequestId::from_bytes(bytes))
        })
    }

    pub fn spends(&self, txid: &str, vout: u32) -> bool {
        self.inputs
            .iter()
            .any(|i| i.prev_vout == vout && i.prev_txid == txid)
    }

    /// Total value paid to `address`
    pub fn value_to(&self, address: &str) -> u64 {
        self.outputs
            .iter()
            .filter(|o| o.address.as_deref() == Some(address))
            .map(|o| o.value)
            .sum()
    }

    /// Confirmation depth at `tip` (0 while unconfirmed)
    pub fn confirmations(&self, tip: u64) -> u64 {
        match (self.confirmed, self.block_height) {
            (true, Some(height)) => tip.saturating_sub(height) + 1,
            _ => 0,
        }
    }
}

/// Chain access used by the wallet
#[async_trait]
pub trait BitcoinNetwork: Send + Sync {
    /// Full history of an address, mempool included
    async fn address_transactions(&self, address: &str) -> Result<Vec<ChainTx>, EsploraError>;

    /// Broadcast a raw transaction, returning its txid
    async fn broadcast(&self, tx_hex: &str) -> Result<String, EsploraError>;

    /// Flat fee for one redeem transaction, in satoshis
    async fn network_fee(&self) -> Result<u64, EsploraError>;

    async fn tip_height(&self) -> Result<u64, EsploraError>;
}
