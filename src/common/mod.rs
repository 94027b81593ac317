//! Common Infrastructure Module
//!
//! Shared utilities and configuration for the vault client.
//!
//! This module contains:
//! - Configuration loading from environment variables
//! - Structured logging setup
//! - Common error types

pub mod config;
pub mod error;
pub mod logging;

// Re-exports for convenience
pub use config::{ConfigError, MasterSecret, Network, VaultConfig};
pub use error::{Result, VaultError};
pub use logging::{
    generate_correlation_id, init_from_config, init_logging, log_alert, log_operation_event,
    EventCategory, LogEvent, LogLevel, LoggingError,
};
