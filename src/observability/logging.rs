//! # Structured Logging
//!
//! Subscriber setup and span macros for the tracing ecosystem.
//!
//! `RUST_LOG` takes precedence over the configured log level so operators can raise
//! verbosity for one module without touching configuration files.

use crate::config::{AppConfig, ObservabilityConfig};
use crate::errors::{Result, VaultlineError};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Create a tracing span for database operations.
///
/// ```rust,ignore
/// let span = db_span!("insert_secret", folder_id = %folder.id);
/// ```
#[macro_export]
macro_rules! db_span {
    ($operation:expr) => {
        tracing::debug_span!(
            "db_operation",
            operation = %$operation,
            operation_id = %uuid::Uuid::new_v4()
        )
    };
    ($operation:expr, $($field:tt)*) => {
        tracing::debug_span!(
            "db_operation",
            operation = %$operation,
            operation_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

/// Create a tracing span for an engine entry point (resolve, mutate, review).
///
/// ```rust,ignore
/// let span = engine_span!("approve_request", request_id = %id);
/// ```
#[macro_export]
macro_rules! engine_span {
    ($operation:expr) => {
        tracing::info_span!(
            "engine_operation",
            operation = %$operation,
            operation_id = %uuid::Uuid::new_v4()
        )
    };
    ($operation:expr, $($field:tt)*) => {
        tracing::info_span!(
            "engine_operation",
            operation = %$operation,
            operation_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| {
            VaultlineError::config(format!("Invalid log filter '{}': {}", config.log_level, e))
        })?;

    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.json_logging {
        registry.with(fmt::layer().json().with_current_span(true).with_span_list(false)).try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };

    result.map_err(|e| VaultlineError::config(format!("Failed to initialize logging: {}", e)))
}

/// Log configuration at startup
pub fn log_config_info(config: &AppConfig) {
    tracing::info!(
        service_name = %config.observability.service_name,
        database_in_memory = config.database.is_in_memory(),
        auto_migrate = config.database.auto_migrate,
        max_reference_depth = config.engine.max_reference_depth,
        resolution_timeout_ms = config.engine.resolution_timeout_ms,
        policy_cache_ttl_seconds = config.engine.policy_cache_ttl_seconds,
        auto_resync_interval_seconds = config.replication.auto_resync_interval_seconds,
        key_version = %config.encryption.key_version,
        "Vaultline configuration"
    );
}
