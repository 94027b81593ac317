//! Common Error Types for the Vault Client
//!
//! Every module keeps its own `thiserror` enum; this root type folds them into
//! the categories the vault acts on (fatal configuration, insufficient funds,
//! retryable external calls, ambiguous broadcasts, persistence failures).

use thiserror::Error;

use crate::bitcoin::EsploraError;
use crate::contract::ContractError;
use crate::storage::StorageError;
use crate::vault::VaultClientError;
use crate::wallet::WalletError;

/// Root error type for the vault client
#[derive(Debug, Error)]
pub enum VaultError {
    /// Missing or invalid configuration; the process must not start operating
    #[error("configuration error: {0}")]
    Configuration(#[from] super::config::ConfigError),

    /// Logging errors
    #[error("logging error: {0}")]
    Logging(#[from] super::logging::LoggingError),

    /// Selection could not cover amount + fee
    #[error("insufficient funds: need {required} sats, have {available} sats")]
    InsufficientFunds { required: u64, available: u64 },

    /// RPC, contract or network failure
    #[error("external call failed: {0}")]
    ExternalCall(String),

    /// Broadcast outcome unknown; re-checked on the next cycle
    #[error("broadcast unconfirmed: {0}")]
    BroadcastUnconfirmed(String),

    /// Store unavailable while recording a transition
    #[error("persistence failure: {0}")]
    Persistence(#[from] StorageError),

    /// Validation errors
    #[error("validation error: {0}")]
    Validation(String),

    /// Internal errors
    #[error("internal error: {0}")]
    Internal(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VaultError {
    /// Create an external call error
    pub fn external(msg: impl Into<String>) -> Self {
        Self::ExternalCall(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a retryable error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VaultError::ExternalCall(_)
                | VaultError::BroadcastUnconfirmed(_)
                | VaultError::Persistence(_)
                | VaultError::Io(_)
        )
    }

    /// Get error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            VaultError::Configuration(_) => "CONFIGURATION_ERROR",
            VaultError::Logging(_) => "LOGGING_ERROR",
            VaultError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            VaultError::ExternalCall(_) => "EXTERNAL_CALL_FAILURE",
            VaultError::BroadcastUnconfirmed(_) => "BROADCAST_UNCONFIRMED",
            VaultError::Persistence(_) => "PERSISTENCE_FAILURE",
            VaultError::Validation(_) => "VALIDATION_ERROR",
            VaultError::Internal(_) => "INTERNAL_ERROR",
            VaultError::Io(_) => "IO_ERROR",
        }
    }
}

impl From<EsploraError> for VaultError {
    fn from(err: EsploraError) -> Self {
        Self::ExternalCall(err.to_string())
    }
}

impl From<ContractError> for VaultError {
    fn from(err: ContractError) -> Self {
        Self::ExternalCall(err.to_string())
    }
}

impl From<WalletError> for VaultError {
    fn from(err: WalletError) -> Self {
        match err {
            WalletError::InsufficientFunds {
                required,
                available,
            } => Self::InsufficientFunds {
                required,
                available,
            },
            WalletError::Network(e) => Self::ExternalCall(e.to_string()),
            WalletError::Storage(e) => Self::Persistence(e),
            WalletError::BroadcastUnconfirmed(msg) => Self::BroadcastUnconfirmed(msg),
            WalletError::InvalidAddress(msg) | WalletError::InvalidAmount(msg) => {
                Self::Validation(msg)
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<VaultClientError> for VaultError {
    fn from(err: VaultClientError) -> Self {
        match err {
            VaultClientError::Config(e) => Self::Configuration(e),
            VaultClientError::Wallet(e) => e.into(),
            VaultClientError::Contract(e) => e.into(),
            VaultClientError::Storage(e) => Self::Persistence(e),
            VaultClientError::Amount(e) => Self::Validation(e.to_string()),
            VaultClientError::AlreadyRunning => {
                Self::Internal("vault client is already running".to_string())
            }
        }
    }
}

/// Result type alias using VaultError
pub type Result<T> = std::result::Result<T, VaultError>;
