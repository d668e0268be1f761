//! # Database Connection Pool Management
//!
//! Provides SQLite connection pool creation and management utilities.

use crate::config::DatabaseConfig;
use crate::errors::{Result, VaultlineError};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Pool, Sqlite, Transaction,
};
use std::{str::FromStr, time::Duration};

/// Type alias for the database connection pool
pub type DbPool = Pool<Sqlite>;

/// Transaction handed down to repositories as `&mut *tx`
pub type DbTransaction<'a> = Transaction<'a, Sqlite>;

const SQLITE_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a database connection pool with the specified configuration
pub async fn create_pool(config: &DatabaseConfig) -> Result<DbPool> {
    validate_config(config)?;

    let pool_options = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.connect_timeout())
        .test_before_acquire(true);

    // An in-memory database lives only as long as its connection.
    let pool_options = if config.is_in_memory() {
        pool_options.idle_timeout(None).max_lifetime(None)
    } else if let Some(idle_timeout) = config.idle_timeout() {
        pool_options.idle_timeout(idle_timeout)
    } else {
        pool_options
    };

    let mut connect_options = SqliteConnectOptions::from_str(&config.url)
        .map_err(|e| VaultlineError::Database {
            source: e,
            context: format!("Invalid SQLite connection string: {}", sanitize_url(&config.url)),
        })?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(SQLITE_BUSY_TIMEOUT);

    if !config.is_in_memory() {
        connect_options = connect_options.journal_mode(SqliteJournalMode::Wal);
    }

    let pool = pool_options.connect_with(connect_options).await.map_err(|e| {
        tracing::error!(
            error = %e,
            url = %sanitize_url(&config.url),
            busy_timeout_ms = SQLITE_BUSY_TIMEOUT.as_millis(),
            "Failed to create SQLite database pool"
        );
        VaultlineError::Database {
            source: e,
            context: format!("Failed to connect to database: {}", sanitize_url(&config.url)),
        }
    })?;

    tracing::info!(
        database_type = "sqlite",
        in_memory = config.is_in_memory(),
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        connect_timeout_ms = config.connect_timeout().as_millis(),
        idle_timeout_ms = config.idle_timeout().map(|d| d.as_millis()),
        "Database connection pool created"
    );

    if config.auto_migrate {
        tracing::info!("Auto-migration enabled, running database migrations");
        crate::storage::migrations::run_migrations(&pool).await?;
    }

    Ok(pool)
}

/// Begin a transaction on `pool`
pub async fn begin_transaction(pool: &DbPool) -> Result<DbTransaction<'_>> {
    pool.begin().await.map_err(|e| {
        tracing::error!(error = %e, "Failed to begin transaction");
        VaultlineError::Database { source: e, context: "Failed to begin transaction".to_string() }
    })
}

/// Commit `tx`
pub async fn commit_transaction(tx: DbTransaction<'_>) -> Result<()> {
    tx.commit().await.map_err(|e| {
        tracing::error!(error = %e, "Failed to commit transaction");
        VaultlineError::Database { source: e, context: "Failed to commit transaction".to_string() }
    })
}

/// Validate database configuration
fn validate_config(config: &DatabaseConfig) -> Result<()> {
    if config.max_connections == 0 {
        return Err(VaultlineError::validation("max_connections must be greater than 0"));
    }

    if config.min_connections > config.max_connections {
        return Err(VaultlineError::validation(
            "min_connections cannot be greater than max_connections",
        ));
    }

    if config.url.is_empty() {
        return Err(VaultlineError::validation("database URL cannot be empty"));
    }

    if !config.is_sqlite() {
        return Err(VaultlineError::validation("database URL must start with 'sqlite:'"));
    }

    Ok(())
}

/// Sanitize database URL for logging (remove credentials and query parameters)
fn sanitize_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) if parsed.query().is_some() => {
            format!("{}:{}", parsed.scheme(), parsed.path())
        }
        _ => url.to_string(),
    }
}

/// Get pool statistics for monitoring
pub fn get_pool_stats(pool: &DbPool) -> PoolStats {
    PoolStats { size: pool.size(), idle: pool.num_idle() }
}

/// Pool statistics for monitoring
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Total connections in the pool
    pub size: u32,
    /// Number of idle connections
    pub idle: usize,
}

impl PoolStats {
    /// Get the number of active connections
    pub fn active(&self) -> u32 {
        self.size.saturating_sub(self.idle as u32)
    }
}
