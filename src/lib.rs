//! Vault Client - Custodial BTC Vault for a Bitcoin Bridge
//!
//! Watches redeem requests on the contract chain and pays them out of the
//! BTC the vault holds on per-deposit addresses.
//!
//! ## Components
//!
//! 1. **Operations** - Compensable action pipelines with persisted status
//! 2. **Wallet** - UTXO selection, P2WPKH signing, broadcast and search by content
//! 3. **Request sync** - Issue/redeem records kept in step with the contract
//! 4. **Vault client** - Intake, recovery on restart, registration and info
//!
//! Every amount is an integer number of satoshis.

pub mod bitcoin;
pub mod common;
pub mod contract;
pub mod events;
pub mod operation;
pub mod storage;
pub mod sync;
pub mod types;
pub mod vault;
pub mod wallet;

#[cfg(test)]
mod testing;

// Re-exports: configuration, errors, logging
pub use common::{ConfigError, VaultConfig, VaultError};

// Re-exports: chain access
pub use self::bitcoin::{BitcoinNetwork, EsploraClient, EsploraError};

// Re-exports: contract
pub use contract::{BridgeContract, ContractError, HttpContractGateway};

// Re-exports: operations
pub use operation::{Operation, OperationDeps, OperationSettings};

// Re-exports: storage
pub use storage::{MemoryStore, OperationStore, RequestStore, SqliteStore};

// Re-exports: wallet
pub use wallet::{KeyDeriver, WalletBtc, WalletError};

// Re-exports: service
pub use sync::{RequestSync, SyncSettings};
pub use vault::{ClientSettings, VaultClient, VaultInfo};
