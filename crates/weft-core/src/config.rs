//! Coordination settings.
//!
//! Loaded from TOML; every field has a default so an empty file is valid.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0} must be greater than zero")]
    Zero(&'static str),

    #[error("invalid config: event_retention_ms ({retention}) is shorter than conflict_window_ms ({window})")]
    RetentionShorterThanWindow { retention: u64, window: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// A session is live while its last heartbeat is younger than this.
    pub heartbeat_timeout_ms: u64,

    /// Lookback window for conflict detection.
    pub conflict_window_ms: u64,

    /// Allocator capacity for workers that did not declare one.
    pub default_max_concurrent_tasks: usize,

    /// How often the reaper sweeps stale sessions.
    pub sweep_interval_ms: u64,

    /// Events older than this are dropped on the next committed write.
    pub event_retention_ms: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 5 * 60 * 1000,
            conflict_window_ms: 5 * 60 * 1000,
            default_max_concurrent_tasks: 3,
            sweep_interval_ms: 30 * 1000,
            event_retention_ms: 24 * 60 * 60 * 1000,
        }
    }
}

impl CoordinationConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_timeout_ms == 0 {
            return Err(ConfigError::Zero("heartbeat_timeout_ms"));
        }
        if self.conflict_window_ms == 0 {
            return Err(ConfigError::Zero("conflict_window_ms"));
        }
        if self.default_max_concurrent_tasks == 0 {
            return Err(ConfigError::Zero("default_max_concurrent_tasks"));
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::Zero("sweep_interval_ms"));
        }
        if self.event_retention_ms < self.conflict_window_ms {
            return Err(ConfigError::RetentionShorterThanWindow {
                retention: self.event_retention_ms,
                window: self.conflict_window_ms,
            });
        }
        Ok(())
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn conflict_window(&self) -> Duration {
        Duration::from_millis(self.conflict_window_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn event_retention(&self) -> Duration {
        Duration::from_millis(self.event_retention_ms)
    }
}
