//! Environment-based Configuration for the Vault Client
//!
//! The configuration is built once at startup and shared by reference. Core
//! components never read the environment themselves; they receive the plain
//! settings structs derived from [`VaultConfig`].
//!
//! # Required Environment Variables
//!
//! - `VAULT_BTC_MASTER_KEY` - Hex-encoded 32-byte master secret for per-deposit keys
//! - `VAULT_ADDRESS` - Vault address on the contract chain (non-devnet only)
//!
//! # Optional Environment Variables
//!
//! - `VAULT_NETWORK` - "mainnet", "testnet" or "devnet" (default: "testnet")
//! - `VAULT_ESPLORA_URL` - Esplora API endpoint
//! - `VAULT_CONTRACT_URL` - Bridge contract gateway endpoint
//! - `VAULT_DASHBOARD_URL` - Dashboard endpoint for liveness pings
//! - `VAULT_DB_PATH` - SQLite database file (default: "data/vault.db")
//! - `VAULT_WAIT_INTERVAL_MS` - Loop/retry interval (default: 1000)
//! - `VAULT_SYNC_INTERVAL_MS` - Request sync interval (default: 1000)
//! - `VAULT_PING_INTERVAL_SECS` - Dashboard ping interval (default: 30)
//! - `VAULT_RETRY_MAX_MS` - Backoff ceiling (default: 60000)
//! - `VAULT_MAX_ACTION_ATTEMPTS` - Attempts before a pre-broadcast step rolls back (default: 5)
//! - `VAULT_STUCK_ALERT_AFTER` - Attempts before a stuck operation alert (default: 30)
//! - `VAULT_REQUIRED_CONFIRMATIONS` - Depth before a redeem counts as confirmed (default: 0)
//! - `VAULT_GAS_LIMIT` - Gas limit forwarded to contract calls (default: 6721900)
//! - `VAULT_LOG_LEVEL` - Logging level (default: "info")

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::operation::OperationSettings;
use crate::wallet::WalletSettings;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("unsupported operation type: {0}")]
    UnsupportedOperation(String),
}

/// Network environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
    Devnet,
}

impl FromStr for Network {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            "devnet" | "dev" => Ok(Network::Devnet),
            _ => Err(ConfigError::InvalidValue(
                "VAULT_NETWORK".to_string(),
                format!("unknown network: {}", s),
            )),
        }
    }
}

impl Network {
    /// Default Esplora API for this network
    pub fn default_esplora_url(&self) -> &'static str {
        match self {
            Network::Mainnet => "https://blockstream.info/api",
            Network::Testnet | Network::Devnet => "https://blockstream.info/testnet/api",
        }
    }

    /// Bitcoin network used for address encoding (bech32 hrp)
    pub fn bitcoin_network(&self) -> bitcoin::Network {
        match self {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Testnet | Network::Devnet => bitcoin::Network::Testnet,
        }
    }
}

/// Vault master secret. Never printed.
#[derive(Clone)]
pub struct MasterSecret([u8; 32]);

impl MasterSecret {
    /// Parse a hex-encoded 32-byte secret (optional `0x` prefix)
    pub fn from_hex(value: &str) -> Result<Self, ConfigError> {
        let trimmed = value.trim().trim_start_matches("0x");
        let bytes = hex::decode(trimmed).map_err(|e| {
            ConfigError::InvalidValue("VAULT_BTC_MASTER_KEY".to_string(), e.to_string())
        })?;

        let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            ConfigError::InvalidValue(
                "VAULT_BTC_MASTER_KEY".to_string(),
                "key must be 32 bytes".to_string(),
            )
        })?;

        Ok(Self(bytes))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterSecret(<redacted>)")
    }
}

/// Main configuration struct
#[derive(Debug, Clone)]
pub struct VaultConfig {
    /// Network environment
    pub network: Network,

    /// Vault address on the contract chain
    pub vault_address: String,

    /// Master secret for per-deposit key derivation
    pub master_secret: MasterSecret,

    /// Esplora API endpoint
    pub esplora_url: String,

    /// Bridge contract gateway endpoint
    pub contract_url: String,

    /// Dashboard endpoint (liveness pings are disabled when unset)
    pub dashboard_url: Option<String>,

    /// SQLite database path
    pub db_path: PathBuf,

    /// Fixed loop interval and base retry delay
    pub wait_interval: Duration,

    /// Request sync interval
    pub sync_interval: Duration,

    /// Dashboard ping interval
    pub ping_interval: Duration,

    /// Backoff ceiling
    pub retry_max_delay: Duration,

    /// Attempts before a failing pre-broadcast step rolls back
    pub max_action_attempts: u32,

    /// Attempts before a stuck-operation alert is raised
    pub stuck_alert_after: u32,

    /// Confirmations required before a redeem transaction counts as confirmed
    pub required_confirmations: u32,

    /// Gas limit forwarded to contract calls
    pub gas_limit: u64,

    /// Log level
    pub log_level: String,
}

impl VaultConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let network: Network = env::var("VAULT_NETWORK")
            .unwrap_or_else(|_| "testnet".to_string())
            .parse()?;

        let master_secret = env::var("VAULT_BTC_MASTER_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("VAULT_BTC_MASTER_KEY".to_string()))
            .and_then(|v| MasterSecret::from_hex(&v))?;

        let vault_address = match env::var("VAULT_ADDRESS") {
            Ok(value) => value,
            Err(_) if network == Network::Devnet => {
                "0x0000000000000000000000000000000000000000".to_string()
            }
            Err(_) => return Err(ConfigError::MissingEnvVar("VAULT_ADDRESS".to_string())),
        };

        let esplora_url = env::var("VAULT_ESPLORA_URL")
            .unwrap_or_else(|_| network.default_esplora_url().to_string());

        let contract_url = env::var("VAULT_CONTRACT_URL")
            .map_err(|_| ConfigError::MissingEnvVar("VAULT_CONTRACT_URL".to_string()))?;

        let dashboard_url = env::var("VAULT_DASHBOARD_URL").ok();

        let db_path = env::var("VAULT_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data/vault.db"));

        let wait_interval = Duration::from_millis(parse_or("VAULT_WAIT_INTERVAL_MS", 1000)?);
        let sync_interval = Duration::from_millis(parse_or("VAULT_SYNC_INTERVAL_MS", 1000)?);
        let ping_interval = Duration::from_secs(parse_or("VAULT_PING_INTERVAL_SECS", 30)?);
        let retry_max_delay = Duration::from_millis(parse_or("VAULT_RETRY_MAX_MS", 60_000)?);
        let max_action_attempts = parse_or("VAULT_MAX_ACTION_ATTEMPTS", 5)?;
        let stuck_alert_after = parse_or("VAULT_STUCK_ALERT_AFTER", 30)?;
        let required_confirmations = parse_or("VAULT_REQUIRED_CONFIRMATIONS", 0)?;
        let gas_limit = parse_or("VAULT_GAS_LIMIT", 6_721_900)?;

        if max_action_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "VAULT_MAX_ACTION_ATTEMPTS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let log_level = env::var("VAULT_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            network,
            vault_address,
            master_secret,
            esplora_url,
            contract_url,
            dashboard_url,
            db_path,
            wait_interval,
            sync_interval,
            ping_interval,
            retry_max_delay,
            max_action_attempts,
            stuck_alert_after,
            required_confirmations,
            gas_limit,
            log_level,
        })
    }

    /// Settings consumed by the wallet
    pub fn wallet_settings(&self) -> WalletSettings {
        WalletSettings {
            network: self.network.bitcoin_network(),
            settle_delay: Duration::from_millis(2000),
            ..WalletSettings::default()
        }
    }

    /// Settings consumed by operations
    pub fn operation_settings(&self) -> OperationSettings {
        OperationSettings {
            retry_base: self.wait_interval,
            retry_max: self.retry_max_delay,
            max_action_attempts: self.max_action_attempts,
            stuck_alert_after: self.stuck_alert_after,
            required_confirmations: self.required_confirmations,
        }
    }

    /// Print configuration summary (hiding sensitive values)
    pub fn print_summary(&self) {
        println!("=== Vault Client Configuration ===");
        println!("Network: {:?}", self.network);
        println!("Vault: {}", self.vault_address);
        println!("Esplora: {}", self.esplora_url);
        println!("Contract gateway: {}", self.contract_url);
        println!(
            "Dashboard: {}",
            self.dashboard_url.as_deref().unwrap_or("(disabled)")
        );
        println!("Database: {}", self.db_path.display());
        println!("Wait interval: {:?}", self.wait_interval);
        println!("Required confirmations: {}", self.required_confirmations);
        println!("Log Level: {}", self.log_level);
        println!("==================================");
    }
}

/// Parse an optional numeric env var, falling back to `default` when unset
fn parse_or<T: FromStr>(var_name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(var_name) {
        Ok(value) => value.trim().parse().map_err(|_| {
            ConfigError::InvalidValue(var_name.to_string(), format!("not a number: {}", value))
        }),
        Err(_) => Ok(default),
    }
}
