//! YAML configuration for the gateway binary.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// SQLite database path.
    pub database: PathBuf,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Deployment id bound into key digests.
    #[serde(default)]
    pub key_context: Option<Uuid>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default)]
    pub store: CounterBackend,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            store: CounterBackend::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CounterBackend {
    #[default]
    Memory,
    Redis {
        url: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutConfig {
    /// Deadline for each store or counter call made while admitting.
    #[serde(default = "default_store_ms")]
    pub store_ms: u64,
    /// Deadline for detached side effects.
    #[serde(default = "default_background_ms")]
    pub background_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            store_ms: default_store_ms(),
            background_ms: default_background_ms(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_key_prefix() -> String {
    "sk".to_string()
}

fn default_window_secs() -> u64 {
    60
}

fn default_store_ms() -> u64 {
    2_000
}

fn default_background_ms() -> u64 {
    5_000
}

impl GatewayConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_yaml(&raw)?;
        // Relative database paths are resolved against the config file.
        if config.database.is_relative() {
            if let Some(base) = path.parent() {
                config.database = base.join(&config.database);
            }
        }
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Invalid("listen must not be empty".into()));
        }
        if self.database.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("database must not be empty".into()));
        }
        if self.key_prefix.is_empty() || self.key_prefix.chars().any(char::is_whitespace) {
            return Err(ConfigError::Invalid(
                "key_prefix must be non-empty without whitespace".into(),
            ));
        }
        if self.rate_limit.window_secs == 0 {
            return Err(ConfigError::Invalid("rate_limit.window_secs must be > 0".into()));
        }
        if self.timeouts.store_ms == 0 || self.timeouts.background_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be > 0".into()));
        }
        if let CounterBackend::Redis { url } = &self.rate_limit.store {
            if url.is_empty() {
                return Err(ConfigError::Invalid("redis url must not be empty".into()));
            }
            if !cfg!(feature = "redis-counters") {
                return Err(ConfigError::Invalid(
                    "redis counter store requires the redis-counters feature".into(),
                ));
            }
        }
        Ok(())
    }
}
