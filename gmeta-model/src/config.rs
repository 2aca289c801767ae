//! Runtime configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Environment variable overriding [`MetaStorageConfig::history_max_bytes`].
pub const HISTORY_MAX_BYTES_ENV: &str = "GMETA_HISTORY_MAX_BYTES";

pub const DEFAULT_HISTORY_MAX_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
}

/// Per-node metastorage settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaStorageConfig {
    /// Maximum retained history size in bytes. Zero retains nothing, forcing
    /// snapshot joins for any node not already at the latest version.
    pub history_max_bytes: u64,
    /// Deliveries buffered while joining before negotiation restarts.
    pub startup_extras_capacity: usize,
    pub join: JoinConfig,
    /// Periodic integrity check. Disabled when `None`.
    pub integrity_check_interval: Option<Duration>,
}

impl Default for MetaStorageConfig {
    fn default() -> Self {
        Self {
            history_max_bytes: DEFAULT_HISTORY_MAX_BYTES,
            startup_extras_capacity: 4096,
            join: JoinConfig::default(),
            integrity_check_interval: None,
        }
    }
}

impl MetaStorageConfig {
    /// Defaults overlaid with environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(raw) = std::env::var(HISTORY_MAX_BYTES_ENV) {
            self.history_max_bytes = parse_bytes(HISTORY_MAX_BYTES_ENV, &raw)?;
        }
        Ok(self)
    }

    pub fn with_history_max_bytes(mut self, bytes: u64) -> Self {
        self.history_max_bytes = bytes;
        self
    }
}

fn parse_bytes(var: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim().parse::<u64>().map_err(|_| ConfigError::InvalidValue {
        var,
        value: raw.to_string(),
    })
}

/// Join negotiation timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinConfig {
    /// Per-peer wait for a join reply.
    pub request_timeout: Duration,
    /// Pause between negotiation rounds.
    pub retry_backoff: Duration,
    /// Give up after this many rounds. Unbounded when `None`.
    pub max_rounds: Option<u32>,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(100),
            max_rounds: None,
        }
    }
}

/// Configuration for where to store data.
#[derive(Debug, Clone)]
pub enum StorageConfig {
    /// File-backed storage at the given path.
    File(PathBuf),
    /// In-memory storage (no filesystem). Useful for tests.
    InMemory,
}
