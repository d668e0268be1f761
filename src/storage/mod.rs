//! # Storage and Persistence
//!
//! SQLite connectivity, embedded migrations and the repositories behind the
//! secret engine.

pub mod migrations;
pub mod pool;
pub mod repositories;

#[cfg(test)]
pub mod test_helpers;

pub use crate::config::DatabaseConfig;

pub use migrations::{
    list_applied_migrations, migration_status, run_migrations, validate_migrations, AppliedMigration,
    MigrationState, MigrationStatus,
};
pub use pool::{
    begin_transaction, commit_transaction, create_pool, get_pool_stats, DbPool, DbTransaction,
    PoolStats,
};
pub use repositories::{
    ApprovalPolicyRepository, ApprovalRequestFilter, ApprovalRequestRepository,
    CreateApprovalPolicyRequest, EnvironmentRepository, FolderRepository, NewApprovalRequest,
    NewSecretImport, ProjectRepository, SecretImportRepository, SecretReferenceRepository,
    SecretRepository, SecretVersionRepository, UpdateApprovalPolicyRequest,
};

use crate::errors::{Result, VaultlineError};

/// Check database connectivity
pub async fn check_connection(pool: &DbPool) -> Result<()> {
    sqlx::query("SELECT 1").fetch_one(pool).await.map_err(|e| VaultlineError::Database {
        source: e,
        context: "Database connectivity check failed".to_string(),
    })?;

    Ok(())
}
