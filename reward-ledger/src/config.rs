//! Configuration for the reward ledger

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for the on-disk backend
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Emit logs as JSON lines
    pub log_json: bool,

    /// How long a settings snapshot is served from cache (milliseconds)
    pub settings_cache_ttl_ms: u64,

    /// Storage configuration
    pub storage: StorageConfig,

    /// Telegram integration
    pub telegram: TelegramConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/reward-ledger"),
            service_name: "reward-ledger".to_string(),
            log_json: false,
            settings_cache_ttl_ms: 5_000,
            storage: StorageConfig::default(),
            telegram: TelegramConfig::default(),
        }
    }
}

/// Which account store implementation to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process, lost on restart
    Memory,
    /// RocksDB under `data_dir` (requires the `rocksdb` feature)
    RocksDb,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend selection
    pub backend: BackendKind,

    /// CAS attempts per update before giving up with a transient error
    pub max_cas_retries: u32,

    /// First backoff after a transient storage error (milliseconds)
    pub initial_backoff_ms: u64,

    /// Backoff ceiling (milliseconds)
    pub max_backoff_ms: u64,

    /// Write buffer size (MB), RocksDB only
    pub write_buffer_size_mb: usize,

    /// Max background jobs (compaction + flush), RocksDB only
    pub max_background_jobs: i32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            max_cas_retries: 16,
            initial_backoff_ms: 5,
            max_backoff_ms: 200,
            write_buffer_size_mb: 64,
            max_background_jobs: 2,
        }
    }
}

/// Telegram configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    /// Bot token used for init-data verification and Bot API calls
    pub bot_token: Option<String>,

    /// Bot API base URL
    pub api_base: String,

    /// Accounts granted admin capability on startup
    pub admin_ids: Vec<String>,

    /// Bot API request timeout (milliseconds)
    pub request_timeout_ms: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            api_base: "https://api.telegram.org".to_string(),
            admin_ids: Vec::new(),
            request_timeout_ms: 5_000,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("REWARD_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(backend) = std::env::var("REWARD_STORAGE_BACKEND") {
            config.storage.backend = match backend.to_ascii_lowercase().as_str() {
                "memory" => BackendKind::Memory,
                "rocksdb" => BackendKind::RocksDb,
                other => {
                    return Err(crate::Error::Config(format!(
                        "Unknown storage backend: {}",
                        other
                    )))
                }
            };
        }

        if let Ok(token) = std::env::var("BOT_TOKEN") {
            config.telegram.bot_token = Some(token);
        }

        if let Ok(ids) = std::env::var("REWARD_ADMIN_IDS") {
            config.telegram.admin_ids = ids
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(String::from)
                .collect();
        }

        if let Ok(flag) = std::env::var("REWARD_LOG_JSON") {
            config.log_json = matches!(flag.as_str(), "1" | "true");
        }

        Ok(config)
    }
}
