//! Project repository
//!
//! Projects are the tenant boundary: every environment, policy and request belongs
//! to exactly one, and the project id is bound into every sealed envelope.

use crate::domain::{Project, ProjectId};
use crate::errors::{ConflictKind, Result, VaultlineError};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqliteConnection};
use tracing::instrument;

#[derive(Debug, Clone, FromRow)]
struct ProjectRow {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ProjectRow> for Project {
    fn from(row: ProjectRow) -> Self {
        Project {
            id: ProjectId::from_string(row.id),
            name: row.name,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

pub struct ProjectRepository;

impl ProjectRepository {
    #[instrument(skip(conn), fields(project_id = %id), name = "db_create_project")]
    pub async fn create(conn: &mut SqliteConnection, id: &ProjectId, name: &str) -> Result<Project> {
        let now = Utc::now();

        sqlx::query("INSERT INTO projects (id, name, created_at, updated_at) VALUES (?, ?, ?, ?)")
            .bind(id.as_str())
            .bind(name)
            .bind(now)
            .bind(now)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                if super::is_unique_violation(&e) {
                    return VaultlineError::conflict(
                        ConflictKind::AlreadyExists,
                        format!("Project '{}' already exists", id),
                    );
                }
                tracing::error!(error = %e, project_id = %id, "Failed to create project");
                VaultlineError::Database {
                    source: e,
                    context: format!("Failed to create project '{}'", name),
                }
            })?;

        tracing::info!(project_id = %id, project_name = %name, "Created project");

        Ok(Project { id: id.clone(), name: name.to_string(), created_at: now, updated_at: now })
    }

    #[instrument(skip(conn), fields(project_id = %id), name = "db_get_project")]
    pub async fn get_by_id(conn: &mut SqliteConnection, id: &ProjectId) -> Result<Option<Project>> {
        let row = sqlx::query_as::<_, ProjectRow>(
            "SELECT id, name, created_at, updated_at FROM projects WHERE id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, project_id = %id, "Failed to get project");
            VaultlineError::Database {
                source: e,
                context: format!("Failed to get project '{}'", id),
            }
        })?;

        Ok(row.map(Project::from))
    }

    #[instrument(skip(conn), name = "db_list_projects")]
    pub async fn list(conn: &mut SqliteConnection) -> Result<Vec<Project>> {
        let rows = sqlx::query_as::<_, ProjectRow>(
            "SELECT id, name, created_at, updated_at FROM projects ORDER BY created_at, id",
        )
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to list projects");
            VaultlineError::Database { source: e, context: "Failed to list projects".to_string() }
        })?;

        Ok(rows.into_iter().map(Project::from).collect())
    }
}
