//! Store configuration
//!
//! Loaded from TOML, with every field defaulted:
//!
//! ```toml
//! [database]
//! url = "sqlite:checkpoints.db"
//! max_connections = 5
//! busy_timeout_ms = 5000
//!
//! [retry]
//! max_retries = 3
//! initial_delay_ms = 50
//! max_delay_ms = 2000
//! multiplier = 2.0
//!
//! [migration]
//! write_back = true
//! max_parent_depth = 1000
//! ```
//!
//! `CHECKPOINT_STORE_DATABASE_URL` overrides `database.url`, and string values
//! of the form `${VAR}` are expanded from the environment.

use crate::error::{CheckpointError, Result};
use crate::retry::RetryConfig;
use crate::traits::DEFAULT_MAX_PARENT_DEPTH;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Environment variable overriding `database.url`
pub const DATABASE_URL_ENV: &str = "CHECKPOINT_STORE_DATABASE_URL";

/// Main store configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StoreConfig {
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Retry policy for conflicting writes
    #[serde(default)]
    pub retry: RetryConfig,

    /// Read-time migration behavior
    #[serde(default)]
    pub migration: MigrationConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    /// sqlx connection URL, e.g. `sqlite:checkpoints.db` or `sqlite::memory:`
    #[serde(default = "default_url")]
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long SQLite waits on a locked database before reporting busy
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

fn default_url() -> String {
    "sqlite:checkpoints.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_busy_timeout() -> u64 {
    5_000
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

/// Read-time migration behavior
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationConfig {
    /// Persist values upgraded during a read back to storage
    #[serde(default = "default_write_back")]
    pub write_back: bool,

    /// Bound on parent-chain walks
    #[serde(default = "default_max_parent_depth")]
    pub max_parent_depth: usize,
}

fn default_write_back() -> bool {
    true
}

fn default_max_parent_depth() -> usize {
    DEFAULT_MAX_PARENT_DEPTH
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            write_back: default_write_back(),
            max_parent_depth: default_max_parent_depth(),
        }
    }
}

impl StoreConfig {
    /// Parse a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| CheckpointError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Configuration for a database at `url`, everything else defaulted
    pub fn with_url(url: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.database.url = url.into();
        config
    }

    /// Apply `${VAR}` expansion and the database URL override
    pub fn resolve_env_vars(&mut self) {
        self.database.url = expand_env_var(&self.database.url);
        if let Ok(url) = std::env::var(DATABASE_URL_ENV) {
            debug!(env = DATABASE_URL_ENV, "Database URL overridden from environment");
            self.database.url = url;
        }
    }

    /// Reject values the store cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.database.max_connections == 0 {
            return Err(CheckpointError::Config(
                "database.max_connections must be at least 1".to_string(),
            ));
        }
        if self.migration.max_parent_depth == 0 {
            return Err(CheckpointError::Config(
                "migration.max_parent_depth must be at least 1".to_string(),
            ));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(CheckpointError::Config(
                "retry.multiplier must be a finite number >= 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Supports `${VAR_NAME}` syntax; unset variables leave the value unchanged
fn expand_env_var(value: &str) -> String {
    if value.starts_with("${") && value.ends_with('}') {
        let var_name = &value[2..value.len() - 1];
        std::env::var(var_name).unwrap_or_else(|_| value.to_string())
    } else {
        value.to_string()
    }
}

/// Loads [`StoreConfig`] from an optional TOML file
pub struct ConfigLoader {
    path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Loader using defaults and the environment only
    pub fn new() -> Self {
        Self { path: None }
    }

    /// Loader reading `path` when it exists
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// Defaults, then the file (if present), then the environment
    pub async fn load(&self) -> Result<StoreConfig> {
        let mut config = match &self.path {
            Some(path) if path.exists() => {
                let config = Self::load_from_path(path).await?;
                debug!(path = %path.display(), "Loaded store config");
                config
            }
            Some(path) => {
                debug!(path = %path.display(), "Config file not found, using defaults");
                StoreConfig::default()
            }
            None => StoreConfig::default(),
        };

        config.resolve_env_vars();
        config.validate()?;

        info!(
            url = %config.database.url,
            write_back = config.migration.write_back,
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Load configuration from a specific path
    pub async fn load_from_path(path: &Path) -> Result<StoreConfig> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| {
                CheckpointError::Config(format!("Failed to read config {}: {}", path.display(), e))
            })?;
        StoreConfig::from_toml(&content)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
