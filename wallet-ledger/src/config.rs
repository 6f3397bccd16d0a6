//! Configuration for the wallet ledger

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Store configuration
    pub store: StoreConfig,

    /// Account numbering
    pub accounts: AccountsConfig,

    /// Webhook reconciliation
    pub reconciliation: ReconciliationConfig,

    /// Post-commit notifications
    pub notifications: NotificationConfig,

    /// Log output
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "wallet-ledger".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            store: StoreConfig::default(),
            accounts: AccountsConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            notifications: NotificationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// RocksDB store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Max wait for a row lock inside a unit of work (milliseconds)
    pub lock_timeout_ms: i64,

    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/wallet-ledger"),
            lock_timeout_ms: 2_000,
            write_buffer_size_mb: 64,
            max_background_jobs: 2,
            enable_statistics: false,
        }
    }
}

/// Account number normalization
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountsConfig {
    /// Country calling code stripped from raw identifiers
    pub country_prefix: String,

    /// Currency used when a caller omits one
    pub default_currency: String,
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            country_prefix: "+234".to_string(),
            default_currency: "NGN".to_string(),
        }
    }
}

/// Reconciliation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    /// Provider name recorded on credits
    pub provider: String,

    /// Retries after a lock timeout on the dedup keys
    pub max_conflict_retries: u32,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            provider: "flutterwave".to_string(),
            max_conflict_retries: 3,
        }
    }
}

/// Notification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Bounded channel capacity; overflow is dropped and logged
    pub channel_capacity: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of compact text
    pub json: bool,

    /// Default `EnvFilter` directive when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json: false,
            filter: "info".to_string(),
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse TOML content
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("WALLET_DATA_DIR") {
            config.store.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(timeout) = std::env::var("WALLET_LOCK_TIMEOUT_MS") {
            config.store.lock_timeout_ms = timeout.parse().map_err(|e| {
                crate::Error::Config(format!("WALLET_LOCK_TIMEOUT_MS: {}", e))
            })?;
        }

        if let Ok(prefix) = std::env::var("WALLET_COUNTRY_PREFIX") {
            config.accounts.country_prefix = prefix;
        }

        if let Ok(currency) = std::env::var("WALLET_DEFAULT_CURRENCY") {
            config.accounts.default_currency = currency;
        }

        if let Ok(json) = std::env::var("WALLET_LOG_JSON") {
            config.logging.json = matches!(json.as_str(), "1" | "true" | "yes");
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the ledger cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.store.lock_timeout_ms <= 0 {
            return Err(crate::Error::Config(
                "store.lock_timeout_ms must be positive".to_string(),
            ));
        }
        if self.notifications.channel_capacity == 0 {
            return Err(crate::Error::Config(
                "notifications.channel_capacity must be positive".to_string(),
            ));
        }
        crate::types::Currency::parse(&self.accounts.default_currency)
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        Ok(())
    }
}
