//! Process configuration
//!
//! Loads `autocheck.toml` for the server binary. Every section is optional
//! and falls back to its defaults; the library itself only ever receives the
//! already-built section structs.

use crate::bus::AmqpConfig;
use crate::check::SelfCheckConfig;
use crate::db::DatabaseConfig;
use crate::kv::RedisConfig;
use crate::watcher::WatcherConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "AUTOCHECK_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Complete configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub rabbitmq: AmqpConfig,
    pub selfcheck: SelfCheckConfig,
    pub watcher: WatcherConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit path, `AUTOCHECK_CONFIG`, or the usual locations
    ///
    /// With no file anywhere the defaults are used.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Self::from_file(path);
        }

        let candidates = [
            PathBuf::from("config/autocheck.toml"),
            PathBuf::from("./autocheck.toml"),
        ];
        for path in &candidates {
            if path.exists() {
                return Self::from_file(path);
            }
        }

        tracing::warn!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let pool = &self.database.pool;
        if pool.max_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "database.pool.max_size must be positive".to_string(),
            ));
        }
        if pool.min_idle > pool.max_size {
            return Err(ConfigError::InvalidConfig(format!(
                "database.pool.min_idle ({}) exceeds max_size ({})",
                pool.min_idle, pool.max_size
            )));
        }
        if self.selfcheck.session_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "selfcheck.session_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
