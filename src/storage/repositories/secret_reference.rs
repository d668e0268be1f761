//! Reference index
//!
//! Denormalized edges from a secret to the secrets its value references, used to
//! find dependents without decrypting every value in a project. Same-folder edges
//! carry no environment or path and follow the referencing secret when it moves.

use crate::domain::{FolderId, ProjectId, ReferenceEdge, SecretId, SecretLocator};
use crate::errors::{Result, VaultlineError};
use sqlx::{FromRow, SqliteConnection};
use tracing::instrument;

#[derive(Debug, Clone, FromRow)]
struct ReferenceRow {
    pub environment: Option<String>,
    pub secret_path: Option<String>,
    pub secret_key: String,
}

impl From<ReferenceRow> for ReferenceEdge {
    fn from(row: ReferenceRow) -> Self {
        ReferenceEdge {
            environment: row.environment,
            secret_path: row.secret_path,
            secret_key: row.secret_key,
        }
    }
}

pub struct SecretReferenceRepository;

impl SecretReferenceRepository {
    /// Replace every edge of `secret_id` with `edges`.
    #[instrument(skip(conn, edges), fields(secret_id = %secret_id, edge_count = edges.len()), name = "db_replace_secret_references")]
    pub async fn replace(
        conn: &mut SqliteConnection,
        secret_id: &SecretId,
        edges: &[ReferenceEdge],
    ) -> Result<()> {
        sqlx::query("DELETE FROM secret_references WHERE secret_id = ?")
            .bind(secret_id.as_str())
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, secret_id = %secret_id, "Failed to clear secret references");
                VaultlineError::Database {
                    source: e,
                    context: format!("Failed to clear references of secret '{}'", secret_id),
                }
            })?;

        for edge in edges {
            sqlx::query(
                "INSERT INTO secret_references (secret_id, environment, secret_path, secret_key) VALUES (?, ?, ?, ?)",
            )
            .bind(secret_id.as_str())
            .bind(&edge.environment)
            .bind(&edge.secret_path)
            .bind(&edge.secret_key)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, secret_id = %secret_id, "Failed to insert secret reference");
                VaultlineError::Database {
                    source: e,
                    context: format!("Failed to index references of secret '{}'", secret_id),
                }
            })?;
        }

        Ok(())
    }

    #[instrument(skip(conn), fields(secret_id = %secret_id), name = "db_list_secret_references")]
    pub async fn list_for_secret(
        conn: &mut SqliteConnection,
        secret_id: &SecretId,
    ) -> Result<Vec<ReferenceEdge>> {
        let rows = sqlx::query_as::<_, ReferenceRow>(
            "SELECT environment, secret_path, secret_key FROM secret_references WHERE secret_id = ? ORDER BY id",
        )
        .bind(secret_id.as_str())
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, secret_id = %secret_id, "Failed to list secret references");
            VaultlineError::Database {
                source: e,
                context: format!("Failed to list references of secret '{}'", secret_id),
            }
        })?;

        Ok(rows.into_iter().map(ReferenceEdge::from).collect())
    }

    /// Secrets in `project_id` whose value references `target`, which lives in `target_folder`.
    #[instrument(skip(conn), fields(target = %target), name = "db_find_reference_dependents")]
    pub async fn find_dependents(
        conn: &mut SqliteConnection,
        project_id: &ProjectId,
        target: &SecretLocator,
        target_folder: &FolderId,
    ) -> Result<Vec<SecretId>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT r.secret_id FROM secret_references r \
             JOIN secrets s ON s.id = r.secret_id \
             JOIN secret_folders f ON f.id = s.folder_id \
             JOIN environments e ON e.id = f.environment_id \
             WHERE e.project_id = ? AND r.secret_key = ? \
               AND ((r.environment = ? AND r.secret_path = ?) OR (r.environment IS NULL AND s.folder_id = ?)) \
             ORDER BY r.secret_id",
        )
        .bind(project_id.as_str())
        .bind(&target.key)
        .bind(&target.environment)
        .bind(target.path.to_string())
        .bind(target_folder.as_str())
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, target = %target, "Failed to find reference dependents");
            VaultlineError::Database {
                source: e,
                context: format!("Failed to find secrets referencing '{}'", target),
            }
        })?;

        Ok(ids.into_iter().map(SecretId::from_string).collect())
    }
}
