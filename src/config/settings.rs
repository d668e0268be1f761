//! # Configuration Settings
//!
//! Defines the configuration structure for the Vaultline engine.

use crate::errors::{Result, VaultlineError};
use crate::services::secret_encryption::SecretEncryptionConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Database configuration
    #[validate(nested)]
    pub database: DatabaseConfig,

    /// Envelope encryption configuration
    #[validate(nested)]
    pub encryption: SecretEncryptionConfig,

    /// Resolution and approval engine tuning
    #[validate(nested)]
    pub engine: EngineConfig,

    /// Replicated import refresh policy
    #[validate(nested)]
    pub replication: ReplicationConfig,

    /// Observability configuration
    #[validate(nested)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(VaultlineError::from)?;

        if self.database.min_connections > self.database.max_connections {
            return Err(VaultlineError::validation_field(
                "min_connections cannot be greater than max_connections",
                "database.min_connections",
            ));
        }

        Ok(())
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database connection URL
    #[validate(length(min = 1, message = "Database URL cannot be empty"))]
    pub url: String,

    /// Maximum number of connections in the pool
    #[validate(range(min = 1, max = 100, message = "Max connections must be between 1 and 100"))]
    pub max_connections: u32,

    /// Minimum number of connections in the pool
    #[validate(range(min = 0, max = 50, message = "Min connections must be between 0 and 50"))]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[validate(range(
        min = 1,
        max = 60,
        message = "Connect timeout must be between 1 and 60 seconds"
    ))]
    pub connect_timeout_seconds: u64,

    /// Idle timeout in seconds (0 = no timeout)
    pub idle_timeout_seconds: u64,

    /// Enable automatic migrations
    pub auto_migrate: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://./data/vaultline.db".to_string(),
            max_connections: 10,
            min_connections: 0,
            connect_timeout_seconds: 10,
            idle_timeout_seconds: 600,
            auto_migrate: true,
        }
    }
}

impl DatabaseConfig {
    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    /// Get idle timeout as Duration (None if 0)
    pub fn idle_timeout(&self) -> Option<Duration> {
        if self.idle_timeout_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(self.idle_timeout_seconds))
        }
    }

    /// Check if this is a SQLite configuration
    pub fn is_sqlite(&self) -> bool {
        self.url.starts_with("sqlite:")
    }

    /// Check if this is an in-memory SQLite database
    pub fn is_in_memory(&self) -> bool {
        self.url.contains(":memory:") || self.url.contains("mode=memory")
    }

    /// Single-connection in-memory database with migrations applied on creation
    pub fn in_memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            min_connections: 1,
            idle_timeout_seconds: 0,
            auto_migrate: true,
            ..Default::default()
        }
    }
}

/// Resolution and approval engine tuning
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct EngineConfig {
    /// Longest acyclic reference chain a resolution may follow
    #[validate(range(min = 1, max = 10000, message = "Max reference depth must be 1-10000"))]
    pub max_reference_depth: usize,

    /// Wall-clock budget for a single read-path resolution
    #[validate(range(
        min = 10,
        max = 600000,
        message = "Resolution timeout must be between 10ms and 10 minutes"
    ))]
    pub resolution_timeout_ms: u64,

    /// How long a loaded policy set stays cached per environment
    pub policy_cache_ttl_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { max_reference_depth: 10, resolution_timeout_ms: 5000, policy_cache_ttl_seconds: 60 }
    }
}

impl EngineConfig {
    pub fn resolution_timeout(&self) -> Duration {
        Duration::from_millis(self.resolution_timeout_ms)
    }

    pub fn policy_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.policy_cache_ttl_seconds)
    }
}

/// Replicated import refresh policy
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Automatic resync cadence in seconds (0 = manual resync only)
    pub auto_resync_interval_seconds: u64,
}

impl ReplicationConfig {
    pub fn auto_resync_interval(&self) -> Option<Duration> {
        if self.auto_resync_interval_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(self.auto_resync_interval_seconds))
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Service name attached to log output
    #[validate(length(min = 1, message = "Service name cannot be empty"))]
    pub service_name: String,

    /// Log level or filter directive (trace, debug, info, warn, error)
    #[validate(length(min = 1, message = "Log level cannot be empty"))]
    pub log_level: String,

    /// Enable JSON structured logging
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { service_name: "vaultline".to_string(), log_level: "info".to_string(), json_logging: false }
    }
}
