//! Folder repository
//!
//! Folders form one tree per environment rooted at `/`. The full path is stored
//! alongside `parent_id` so lookups by path need no recursive query.

use crate::domain::{EnvironmentId, Folder, FolderId, SecretPath};
use crate::errors::{ConflictKind, Result, VaultlineError};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqliteConnection};
use tracing::instrument;

const FOLDER_COLUMNS: &str =
    "id, environment_id, parent_id, name, path, is_reserved, created_at, updated_at";

/// Name stored for the root folder of every environment.
const ROOT_FOLDER_NAME: &str = "root";

#[derive(Debug, Clone, FromRow)]
struct FolderRow {
    pub id: String,
    pub environment_id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub path: String,
    pub is_reserved: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<FolderRow> for Folder {
    type Error = VaultlineError;

    fn try_from(row: FolderRow) -> Result<Self> {
        let path = SecretPath::parse(&row.path).map_err(|e| {
            VaultlineError::internal(format!("Stored folder path '{}' is invalid: {}", row.path, e))
        })?;

        Ok(Folder {
            id: FolderId::from_string(row.id),
            environment_id: EnvironmentId::from_string(row.environment_id),
            parent_id: row.parent_id.map(FolderId::from_string),
            name: row.name,
            path,
            is_reserved: row.is_reserved,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_folders(rows: Vec<FolderRow>) -> Result<Vec<Folder>> {
    rows.into_iter().map(Folder::try_from).collect()
}

pub struct FolderRepository;

impl FolderRepository {
    /// Create the root folder of a freshly created environment.
    #[instrument(skip(conn), fields(environment_id = %environment_id), name = "db_create_root_folder")]
    pub async fn create_root(
        conn: &mut SqliteConnection,
        environment_id: &EnvironmentId,
    ) -> Result<Folder> {
        Self::insert(conn, environment_id, None, ROOT_FOLDER_NAME, &SecretPath::root(), false).await
    }

    /// Create `name` under `parent`.
    #[instrument(skip(conn, parent), fields(parent_path = %parent.path, name = %name), name = "db_create_folder")]
    pub async fn create(
        conn: &mut SqliteConnection,
        parent: &Folder,
        name: &str,
        is_reserved: bool,
    ) -> Result<Folder> {
        let path = parent.path.join(name)?;
        Self::insert(conn, &parent.environment_id, Some(&parent.id), name, &path, is_reserved).await
    }

    async fn insert(
        conn: &mut SqliteConnection,
        environment_id: &EnvironmentId,
        parent_id: Option<&FolderId>,
        name: &str,
        path: &SecretPath,
        is_reserved: bool,
    ) -> Result<Folder> {
        let id = FolderId::new();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO secret_folders (id, environment_id, parent_id, name, path, is_reserved, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.as_str())
        .bind(environment_id.as_str())
        .bind(parent_id.map(|p| p.as_str()))
        .bind(name)
        .bind(path.to_string())
        .bind(is_reserved)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            if super::is_unique_violation(&e) {
                return VaultlineError::conflict(
                    ConflictKind::AlreadyExists,
                    format!("Folder '{}' already exists", path),
                );
            }
            tracing::error!(error = %e, environment_id = %environment_id, path = %path, "Failed to create folder");
            VaultlineError::Database {
                source: e,
                context: format!("Failed to create folder '{}'", path),
            }
        })?;

        tracing::debug!(folder_id = %id, environment_id = %environment_id, path = %path, "Created folder");

        Ok(Folder {
            id,
            environment_id: environment_id.clone(),
            parent_id: parent_id.cloned(),
            name: name.to_string(),
            path: path.clone(),
            is_reserved,
            created_at: now,
            updated_at: now,
        })
    }

    #[instrument(skip(conn), fields(folder_id = %id), name = "db_get_folder")]
    pub async fn get_by_id(conn: &mut SqliteConnection, id: &FolderId) -> Result<Option<Folder>> {
        let row = sqlx::query_as::<_, FolderRow>(&format!(
            "SELECT {} FROM secret_folders WHERE id = ?",
            FOLDER_COLUMNS
        ))
        .bind(id.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, folder_id = %id, "Failed to get folder");
            VaultlineError::Database { source: e, context: format!("Failed to get folder '{}'", id) }
        })?;

        row.map(Folder::try_from).transpose()
    }

    #[instrument(skip(conn), fields(environment_id = %environment_id, path = %path), name = "db_find_folder_by_path")]
    pub async fn find_by_path(
        conn: &mut SqliteConnection,
        environment_id: &EnvironmentId,
        path: &SecretPath,
    ) -> Result<Option<Folder>> {
        let row = sqlx::query_as::<_, FolderRow>(&format!(
            "SELECT {} FROM secret_folders WHERE environment_id = ? AND path = ?",
            FOLDER_COLUMNS
        ))
        .bind(environment_id.as_str())
        .bind(path.to_string())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, environment_id = %environment_id, path = %path, "Failed to find folder");
            VaultlineError::Database {
                source: e,
                context: format!("Failed to find folder '{}'", path),
            }
        })?;

        row.map(Folder::try_from).transpose()
    }

    /// Direct children of a folder, ordered by name.
    #[instrument(skip(conn), fields(folder_id = %folder_id), name = "db_list_child_folders")]
    pub async fn list_children(
        conn: &mut SqliteConnection,
        folder_id: &FolderId,
        include_reserved: bool,
    ) -> Result<Vec<Folder>> {
        let rows = sqlx::query_as::<_, FolderRow>(&format!(
            "SELECT {} FROM secret_folders WHERE parent_id = ? AND (? OR is_reserved = 0) ORDER BY name",
            FOLDER_COLUMNS
        ))
        .bind(folder_id.as_str())
        .bind(include_reserved)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, folder_id = %folder_id, "Failed to list child folders");
            VaultlineError::Database {
                source: e,
                context: format!("Failed to list children of folder '{}'", folder_id),
            }
        })?;

        into_folders(rows)
    }

    /// Every non-reserved folder strictly below `path`, ordered by path.
    #[instrument(skip(conn), fields(environment_id = %environment_id, path = %path), name = "db_list_descendant_folders")]
    pub async fn list_descendants(
        conn: &mut SqliteConnection,
        environment_id: &EnvironmentId,
        path: &SecretPath,
    ) -> Result<Vec<Folder>> {
        let prefix = if path.is_root() { "/".to_string() } else { format!("{}/", path) };

        // substr comparison: folder names may contain LIKE wildcards
        let rows = sqlx::query_as::<_, FolderRow>(&format!(
            "SELECT {} FROM secret_folders \
             WHERE environment_id = ? AND is_reserved = 0 AND path != ? AND substr(path, 1, length(?)) = ? \
             ORDER BY path",
            FOLDER_COLUMNS
        ))
        .bind(environment_id.as_str())
        .bind(path.to_string())
        .bind(&prefix)
        .bind(&prefix)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, environment_id = %environment_id, path = %path, "Failed to list descendant folders");
            VaultlineError::Database {
                source: e,
                context: format!("Failed to list folders below '{}'", path),
            }
        })?;

        into_folders(rows)
    }

    /// Delete a folder. Subfolders, their secrets and imports go with it.
    #[instrument(skip(conn), fields(folder_id = %id), name = "db_delete_folder")]
    pub async fn delete(conn: &mut SqliteConnection, id: &FolderId) -> Result<()> {
        let result = sqlx::query("DELETE FROM secret_folders WHERE id = ?")
            .bind(id.as_str())
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, folder_id = %id, "Failed to delete folder");
                VaultlineError::Database {
                    source: e,
                    context: format!("Failed to delete folder '{}'", id),
                }
            })?;

        if result.rows_affected() == 0 {
            return Err(VaultlineError::not_found("Folder", id.as_str()));
        }

        Ok(())
    }
}
