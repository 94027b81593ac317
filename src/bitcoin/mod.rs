//! Bitcoin Infrastructure Module
//!
//! Chain access for the vault client:
//! - [`BitcoinNetwork`] trait the wallet is written against
//! - Esplora API client implementing it

pub mod client;
pub mod network;

// Re-exports for convenience
pub use client::{
    flat_fee, EsploraClient, EsploraError, EsploraTxStatus, MAINNET_URL, MIN_FEE_SATS,
    REFERENCE_TX_VSIZE, TESTNET_URL,
};
pub use network::{BitcoinNetwork, ChainTx, ChainTxInput, ChainTxOutput, EMBED_SCRIPT_PREFIX};
