//! # Configuration Management
//!
//! Layered configuration for the Vaultline engine. Sources are applied in order, later
//! ones overriding earlier ones:
//!
//! 1. Built-in defaults
//! 2. Optional configuration file (YAML, TOML or JSON, chosen by extension)
//! 3. Environment variables prefixed `VAULTLINE__`, with `__` separating nested keys,
//!    e.g. `VAULTLINE__ENGINE__MAX_REFERENCE_DEPTH=20`

pub mod settings;

pub use crate::services::secret_encryption::SecretEncryptionConfig;
pub use settings::{
    AppConfig, DatabaseConfig, EngineConfig, ObservabilityConfig, ReplicationConfig,
};

use crate::errors::Result;

const ENV_PREFIX: &str = "VAULTLINE";
const ENV_SEPARATOR: &str = "__";

/// Load and validate configuration from defaults, an optional file and the environment.
pub fn load_config(path: Option<&str>) -> Result<AppConfig> {
    let mut builder =
        config::Config::builder().add_source(config::Config::try_from(&AppConfig::default())?);

    if let Some(path) = path {
        builder = builder.add_source(config::File::with_name(path).required(false));
    }

    let config: AppConfig = builder
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;

    config.validate()?;

    tracing::debug!(
        database_url = %config.database.url,
        max_reference_depth = config.engine.max_reference_depth,
        policy_cache_ttl_seconds = config.engine.policy_cache_ttl_seconds,
        "Configuration loaded"
    );

    Ok(config)
}
