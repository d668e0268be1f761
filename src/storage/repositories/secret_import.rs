//! Folder import repository
//!
//! Imports are ordered per folder by a dense, zero-based `position`.

use crate::domain::{
    EnvironmentId, FolderId, ProjectId, SecretImport, SecretImportId, SecretPath,
};
use crate::errors::{Result, VaultlineError};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqliteConnection};
use tracing::instrument;

const IMPORT_SELECT: &str = "SELECT i.id, i.folder_id, i.position, i.import_environment_id, e.slug AS import_environment_slug, \
     i.import_path, i.is_replication, i.is_reserved, i.reserved_for_import_id, i.last_replicated_at, \
     i.replication_error, i.created_at, i.updated_at \
     FROM secret_imports i JOIN environments e ON e.id = i.import_environment_id";

#[derive(Debug, Clone, FromRow)]
struct SecretImportRow {
    pub id: String,
    pub folder_id: String,
    pub position: i64,
    pub import_environment_id: String,
    pub import_environment_slug: String,
    pub import_path: String,
    pub is_replication: bool,
    pub is_reserved: bool,
    pub reserved_for_import_id: Option<String>,
    pub last_replicated_at: Option<DateTime<Utc>>,
    pub replication_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<SecretImportRow> for SecretImport {
    type Error = VaultlineError;

    fn try_from(row: SecretImportRow) -> Result<Self> {
        let import_path = SecretPath::parse(&row.import_path).map_err(|e| {
            VaultlineError::internal(format!("Stored import path '{}' is invalid: {}", row.import_path, e))
        })?;

        Ok(SecretImport {
            id: SecretImportId::from_string(row.id),
            folder_id: FolderId::from_string(row.folder_id),
            position: row.position,
            import_environment_id: EnvironmentId::from_string(row.import_environment_id),
            import_environment_slug: row.import_environment_slug,
            import_path,
            is_replication: row.is_replication,
            is_reserved: row.is_reserved,
            reserved_for_import_id: row.reserved_for_import_id.map(SecretImportId::from_string),
            last_replicated_at: row.last_replicated_at,
            replication_error: row.replication_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_imports(rows: Vec<SecretImportRow>) -> Result<Vec<SecretImport>> {
    rows.into_iter().map(SecretImport::try_from).collect()
}

fn db_error(e: sqlx::Error, context: String) -> VaultlineError {
    tracing::error!(error = %e, context = %context, "Secret import query failed");
    VaultlineError::Database { source: e, context }
}

/// Fields of a new import row.
#[derive(Debug, Clone)]
pub struct NewSecretImport {
    pub folder_id: FolderId,
    pub import_environment_id: EnvironmentId,
    pub import_path: SecretPath,
    pub is_replication: bool,
    pub is_reserved: bool,
    pub reserved_for_import_id: Option<SecretImportId>,
}

pub struct SecretImportRepository;

impl SecretImportRepository {
    /// Append an import after the folder's last one.
    #[instrument(skip(conn, new), fields(folder_id = %new.folder_id, import_path = %new.import_path), name = "db_create_secret_import")]
    pub async fn create(conn: &mut SqliteConnection, new: &NewSecretImport) -> Result<SecretImport> {
        let id = SecretImportId::new();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO secret_imports (id, folder_id, position, import_environment_id, import_path, is_replication, \
             is_reserved, reserved_for_import_id, created_at, updated_at) \
             VALUES (?, ?, (SELECT COALESCE(MAX(position), -1) + 1 FROM secret_imports WHERE folder_id = ?), ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.as_str())
        .bind(new.folder_id.as_str())
        .bind(new.folder_id.as_str())
        .bind(new.import_environment_id.as_str())
        .bind(new.import_path.to_string())
        .bind(new.is_replication)
        .bind(new.is_reserved)
        .bind(new.reserved_for_import_id.as_ref().map(|i| i.as_str()))
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(|e| db_error(e, format!("Failed to create import of '{}'", new.import_path)))?;

        tracing::info!(
            import_id = %id,
            folder_id = %new.folder_id,
            import_path = %new.import_path,
            is_replication = new.is_replication,
            "Created secret import"
        );

        Self::get_by_id(conn, &id)
            .await?
            .ok_or_else(|| VaultlineError::internal(format!("Import '{}' vanished after insert", id)))
    }

    #[instrument(skip(conn), fields(import_id = %id), name = "db_get_secret_import")]
    pub async fn get_by_id(
        conn: &mut SqliteConnection,
        id: &SecretImportId,
    ) -> Result<Option<SecretImport>> {
        let row = sqlx::query_as::<_, SecretImportRow>(&format!("{} WHERE i.id = ?", IMPORT_SELECT))
            .bind(id.as_str())
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| db_error(e, format!("Failed to get import '{}'", id)))?;

        row.map(SecretImport::try_from).transpose()
    }

    /// Imports of a folder in position order, reserved ones included.
    #[instrument(skip(conn), fields(folder_id = %folder_id), name = "db_list_secret_imports")]
    pub async fn list_by_folder(
        conn: &mut SqliteConnection,
        folder_id: &FolderId,
    ) -> Result<Vec<SecretImport>> {
        let rows = sqlx::query_as::<_, SecretImportRow>(&format!(
            "{} WHERE i.folder_id = ? ORDER BY i.position",
            IMPORT_SELECT
        ))
        .bind(folder_id.as_str())
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| db_error(e, format!("Failed to list imports of folder '{}'", folder_id)))?;

        into_imports(rows)
    }

    /// Imports anywhere that point at `(environment_id, path)`.
    #[instrument(skip(conn), fields(environment_id = %environment_id, path = %path), name = "db_list_imports_of_target")]
    pub async fn list_by_target(
        conn: &mut SqliteConnection,
        environment_id: &EnvironmentId,
        path: &SecretPath,
    ) -> Result<Vec<SecretImport>> {
        let rows = sqlx::query_as::<_, SecretImportRow>(&format!(
            "{} WHERE i.import_environment_id = ? AND i.import_path = ? AND i.is_reserved = 0 ORDER BY i.created_at",
            IMPORT_SELECT
        ))
        .bind(environment_id.as_str())
        .bind(path.to_string())
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| db_error(e, format!("Failed to list importers of '{}'", path)))?;

        into_imports(rows)
    }

    /// Replicated imports of every folder in `project_id`.
    #[instrument(skip(conn), fields(project_id = %project_id), name = "db_list_replications")]
    pub async fn list_replications(
        conn: &mut SqliteConnection,
        project_id: &ProjectId,
    ) -> Result<Vec<SecretImport>> {
        let rows = sqlx::query_as::<_, SecretImportRow>(&format!(
            "{} JOIN secret_folders f ON f.id = i.folder_id JOIN environments fe ON fe.id = f.environment_id \
             WHERE fe.project_id = ? AND i.is_replication = 1 ORDER BY i.created_at",
            IMPORT_SELECT
        ))
        .bind(project_id.as_str())
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| db_error(e, format!("Failed to list replications of project '{}'", project_id)))?;

        into_imports(rows)
    }

    /// The reserved live import that serves a replication.
    #[instrument(skip(conn), fields(import_id = %replication_id), name = "db_find_reserved_import")]
    pub async fn find_reserved_for(
        conn: &mut SqliteConnection,
        replication_id: &SecretImportId,
    ) -> Result<Option<SecretImport>> {
        let row = sqlx::query_as::<_, SecretImportRow>(&format!(
            "{} WHERE i.reserved_for_import_id = ?",
            IMPORT_SELECT
        ))
        .bind(replication_id.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| db_error(e, format!("Failed to find reserved import of '{}'", replication_id)))?;

        row.map(SecretImport::try_from).transpose()
    }

    /// Move an import to `position`, shifting its neighbours to keep positions dense.
    #[instrument(skip(conn, import), fields(import_id = %import.id, from = import.position, to = position), name = "db_move_secret_import")]
    pub async fn set_position(
        conn: &mut SqliteConnection,
        import: &SecretImport,
        position: i64,
    ) -> Result<()> {
        let now = Utc::now();
        let from = import.position;

        let shift = if position < from {
            "UPDATE secret_imports SET position = position + 1, updated_at = ? \
             WHERE folder_id = ? AND position >= ? AND position < ?"
        } else {
            "UPDATE secret_imports SET position = position - 1, updated_at = ? \
             WHERE folder_id = ? AND position <= ? AND position > ?"
        };

        sqlx::query(shift)
            .bind(now)
            .bind(import.folder_id.as_str())
            .bind(position)
            .bind(from)
            .execute(&mut *conn)
            .await
            .map_err(|e| db_error(e, format!("Failed to shift imports of folder '{}'", import.folder_id)))?;

        sqlx::query("UPDATE secret_imports SET position = ?, updated_at = ? WHERE id = ?")
            .bind(position)
            .bind(now)
            .bind(import.id.as_str())
            .execute(&mut *conn)
            .await
            .map_err(|e| db_error(e, format!("Failed to move import '{}'", import.id)))?;

        Ok(())
    }

    /// Delete an import and close the gap it leaves.
    #[instrument(skip(conn, import), fields(import_id = %import.id), name = "db_delete_secret_import")]
    pub async fn delete(conn: &mut SqliteConnection, import: &SecretImport) -> Result<()> {
        let result = sqlx::query("DELETE FROM secret_imports WHERE id = ?")
            .bind(import.id.as_str())
            .execute(&mut *conn)
            .await
            .map_err(|e| db_error(e, format!("Failed to delete import '{}'", import.id)))?;

        if result.rows_affected() == 0 {
            return Err(VaultlineError::not_found("SecretImport", import.id.as_str()));
        }

        sqlx::query(
            "UPDATE secret_imports SET position = position - 1, updated_at = ? WHERE folder_id = ? AND position > ?",
        )
        .bind(Utc::now())
        .bind(import.folder_id.as_str())
        .bind(import.position)
        .execute(&mut *conn)
        .await
        .map_err(|e| db_error(e, format!("Failed to compact imports of folder '{}'", import.folder_id)))?;

        Ok(())
    }

    #[instrument(skip(conn, error), fields(import_id = %id), name = "db_record_replication")]
    pub async fn record_replication(
        conn: &mut SqliteConnection,
        id: &SecretImportId,
        replicated_at: Option<DateTime<Utc>>,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE secret_imports SET last_replicated_at = COALESCE(?, last_replicated_at), replication_error = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(replicated_at)
        .bind(error)
        .bind(Utc::now())
        .bind(id.as_str())
        .execute(&mut *conn)
        .await
        .map_err(|e| db_error(e, format!("Failed to record replication of import '{}'", id)))?;

        Ok(())
    }
}
