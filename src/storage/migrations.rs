//! # Schema migrations
//!
//! Migrations are embedded at compile time and recorded in `_vaultline_migrations`
//! together with a SHA-256 checksum of the SQL that was run. A database whose
//! recorded checksums no longer match the embedded SQL, or that carries versions
//! this build does not know, is refused rather than migrated further.

use crate::errors::{Result, VaultlineError};
use crate::storage::DbPool;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use std::collections::BTreeMap;
use tracing::{error, info, instrument, warn};

/// A migration compiled into the binary.
#[derive(Debug, Clone, Copy)]
pub struct EmbeddedMigration {
    pub version: i64,
    pub name: &'static str,
    sql: &'static str,
}

impl EmbeddedMigration {
    pub fn checksum(&self) -> Vec<u8> {
        Sha256::digest(self.sql.as_bytes()).to_vec()
    }
}

macro_rules! embedded {
    ($version:literal, $name:literal) => {
        EmbeddedMigration {
            version: $version,
            name: $name,
            sql: include_str!(concat!("../../migrations/", $version, "_", $name, ".sql")),
        }
    };
}

/// Ordered by version.
pub const MIGRATIONS: &[EmbeddedMigration] = &[
    embedded!(20260101000001, "create_projects_environments_folders"),
    embedded!(20260101000002, "create_secrets"),
    embedded!(20260101000003, "create_imports_and_approvals"),
];

/// A row of `_vaultline_migrations`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AppliedMigration {
    pub version: i64,
    pub name: String,
    pub checksum: Vec<u8>,
    pub execution_time_ms: i64,
    pub installed_on: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    Applied,
    Pending,
    /// Recorded checksum differs from the embedded SQL
    Modified,
    /// Recorded in the database but unknown to this build
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    pub version: i64,
    pub name: String,
    pub state: MigrationState,
    pub installed_on: Option<DateTime<Utc>>,
    pub execution_time_ms: Option<i64>,
}

/// Compare the embedded migrations against what the database has recorded.
pub fn reconcile(embedded: &[EmbeddedMigration], applied: &[AppliedMigration]) -> Vec<MigrationStatus> {
    let mut recorded: BTreeMap<i64, &AppliedMigration> = applied.iter().map(|m| (m.version, m)).collect();
    let mut statuses = Vec::with_capacity(embedded.len());

    for migration in embedded {
        let status = match recorded.remove(&migration.version) {
            Some(row) => MigrationStatus {
                version: migration.version,
                name: migration.name.to_string(),
                state: if row.checksum == migration.checksum() {
                    MigrationState::Applied
                } else {
                    MigrationState::Modified
                },
                installed_on: Some(row.installed_on),
                execution_time_ms: Some(row.execution_time_ms),
            },
            None => MigrationStatus {
                version: migration.version,
                name: migration.name.to_string(),
                state: MigrationState::Pending,
                installed_on: None,
                execution_time_ms: None,
            },
        };
        statuses.push(status);
    }

    statuses.extend(recorded.into_values().map(|row| MigrationStatus {
        version: row.version,
        name: row.name.clone(),
        state: MigrationState::Unknown,
        installed_on: Some(row.installed_on),
        execution_time_ms: Some(row.execution_time_ms),
    }));
    statuses.sort_by_key(|s| s.version);
    statuses
}

async fn ensure_migration_table(pool: &DbPool) -> Result<()> {
    sqlx::raw_sql(
        "CREATE TABLE IF NOT EXISTS _vaultline_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            checksum BLOB NOT NULL,
            execution_time_ms INTEGER NOT NULL,
            installed_on TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await
    .map_err(|e| VaultlineError::database(e, "Failed to create migration tracking table".to_string()))?;
    Ok(())
}

/// Rows of `_vaultline_migrations`, oldest first. Empty before the first run.
pub async fn list_applied_migrations(pool: &DbPool) -> Result<Vec<AppliedMigration>> {
    ensure_migration_table(pool).await?;
    sqlx::query_as::<_, AppliedMigration>(
        "SELECT version, name, checksum, execution_time_ms, installed_on FROM _vaultline_migrations ORDER BY version",
    )
    .fetch_all(pool)
    .await
    .map_err(|e| VaultlineError::database(e, "Failed to list applied migrations".to_string()))
}

/// Status of every embedded and every recorded migration.
pub async fn migration_status(pool: &DbPool) -> Result<Vec<MigrationStatus>> {
    let applied = list_applied_migrations(pool).await?;
    Ok(reconcile(MIGRATIONS, &applied))
}

/// True when every embedded migration is applied unmodified and nothing else is recorded.
pub async fn validate_migrations(pool: &DbPool) -> Result<bool> {
    let statuses = migration_status(pool).await?;
    for status in &statuses {
        if status.state != MigrationState::Applied {
            warn!(version = status.version, name = %status.name, state = ?status.state, "Migration out of step");
        }
    }
    Ok(statuses.iter().all(|s| s.state == MigrationState::Applied))
}

/// Apply every pending migration, each in its own transaction. Returns how many ran.
#[instrument(skip(pool), name = "run_migrations")]
pub async fn run_migrations(pool: &DbPool) -> Result<usize> {
    let statuses = migration_status(pool).await?;

    if let Some(diverged) =
        statuses.iter().find(|s| matches!(s.state, MigrationState::Modified | MigrationState::Unknown))
    {
        return Err(VaultlineError::config(format!(
            "Database schema diverged from this build at migration {} ({}): {:?}",
            diverged.version, diverged.name, diverged.state
        )));
    }

    let mut ran = 0;
    for status in statuses.iter().filter(|s| s.state == MigrationState::Pending) {
        let Some(migration) = MIGRATIONS.iter().find(|m| m.version == status.version) else {
            continue;
        };
        apply(pool, migration).await?;
        ran += 1;
    }

    if ran > 0 {
        info!(count = ran, "Database migrations completed");
    } else {
        info!("No pending migrations");
    }
    Ok(ran)
}

async fn apply(pool: &DbPool, migration: &EmbeddedMigration) -> Result<()> {
    let started = std::time::Instant::now();
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| VaultlineError::database(e, "Failed to start migration transaction".to_string()))?;

    sqlx::raw_sql(migration.sql).execute(&mut *tx).await.map_err(|e| {
        error!(error = %e, version = migration.version, "Migration failed");
        VaultlineError::database(e, format!("Migration {} ({}) failed", migration.version, migration.name))
    })?;

    let execution_time_ms = started.elapsed().as_millis() as i64;
    sqlx::query(
        "INSERT INTO _vaultline_migrations (version, name, checksum, execution_time_ms, installed_on) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(migration.version)
    .bind(migration.name)
    .bind(migration.checksum())
    .bind(execution_time_ms)
    .bind(Utc::now())
    .execute(&mut *tx)
    .await
    .map_err(|e| VaultlineError::database(e, format!("Failed to record migration {}", migration.version)))?;

    tx.commit()
        .await
        .map_err(|e| VaultlineError::database(e, "Failed to commit migration transaction".to_string()))?;

    info!(version = migration.version, name = migration.name, execution_time_ms, "Applied migration");
    Ok(())
}
