//! Environment repository

use crate::domain::{Environment, EnvironmentId, ProjectId};
use crate::errors::{ConflictKind, Result, VaultlineError};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqliteConnection};
use tracing::instrument;

const ENVIRONMENT_COLUMNS: &str = "id, project_id, slug, name, created_at, updated_at";

#[derive(Debug, Clone, FromRow)]
struct EnvironmentRow {
    pub id: String,
    pub project_id: String,
    pub slug: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<EnvironmentRow> for Environment {
    fn from(row: EnvironmentRow) -> Self {
        Environment {
            id: EnvironmentId::from_string(row.id),
            project_id: ProjectId::from_string(row.project_id),
            slug: row.slug,
            name: row.name,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

pub struct EnvironmentRepository;

impl EnvironmentRepository {
    #[instrument(skip(conn), fields(project_id = %project_id, slug = %slug), name = "db_create_environment")]
    pub async fn create(
        conn: &mut SqliteConnection,
        project_id: &ProjectId,
        slug: &str,
        name: &str,
    ) -> Result<Environment> {
        let id = EnvironmentId::new();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO environments (id, project_id, slug, name, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(id.as_str())
        .bind(project_id.as_str())
        .bind(slug)
        .bind(name)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            if super::is_unique_violation(&e) {
                tracing::warn!(project_id = %project_id, slug = %slug, "Environment slug already in use");
                return VaultlineError::conflict(
                    ConflictKind::AlreadyExists,
                    format!("Environment '{}' already exists in project '{}'", slug, project_id),
                );
            }
            tracing::error!(error = %e, project_id = %project_id, slug = %slug, "Failed to create environment");
            VaultlineError::Database {
                source: e,
                context: format!("Failed to create environment '{}'", slug),
            }
        })?;

        tracing::info!(environment_id = %id, project_id = %project_id, slug = %slug, "Created environment");

        Ok(Environment {
            id,
            project_id: project_id.clone(),
            slug: slug.to_string(),
            name: name.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    #[instrument(skip(conn), fields(environment_id = %id), name = "db_get_environment")]
    pub async fn get_by_id(
        conn: &mut SqliteConnection,
        id: &EnvironmentId,
    ) -> Result<Option<Environment>> {
        let row = sqlx::query_as::<_, EnvironmentRow>(&format!(
            "SELECT {} FROM environments WHERE id = ?",
            ENVIRONMENT_COLUMNS
        ))
        .bind(id.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, environment_id = %id, "Failed to get environment");
            VaultlineError::Database {
                source: e,
                context: format!("Failed to get environment '{}'", id),
            }
        })?;

        Ok(row.map(Environment::from))
    }

    #[instrument(skip(conn), fields(project_id = %project_id, slug = %slug), name = "db_find_environment_by_slug")]
    pub async fn find_by_slug(
        conn: &mut SqliteConnection,
        project_id: &ProjectId,
        slug: &str,
    ) -> Result<Option<Environment>> {
        let row = sqlx::query_as::<_, EnvironmentRow>(&format!(
            "SELECT {} FROM environments WHERE project_id = ? AND slug = ?",
            ENVIRONMENT_COLUMNS
        ))
        .bind(project_id.as_str())
        .bind(slug)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, project_id = %project_id, slug = %slug, "Failed to find environment");
            VaultlineError::Database {
                source: e,
                context: format!("Failed to find environment '{}'", slug),
            }
        })?;

        Ok(row.map(Environment::from))
    }

    #[instrument(skip(conn), fields(project_id = %project_id), name = "db_list_environments")]
    pub async fn list_by_project(
        conn: &mut SqliteConnection,
        project_id: &ProjectId,
    ) -> Result<Vec<Environment>> {
        let rows = sqlx::query_as::<_, EnvironmentRow>(&format!(
            "SELECT {} FROM environments WHERE project_id = ? ORDER BY slug",
            ENVIRONMENT_COLUMNS
        ))
        .bind(project_id.as_str())
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, project_id = %project_id, "Failed to list environments");
            VaultlineError::Database {
                source: e,
                context: format!("Failed to list environments of project '{}'", project_id),
            }
        })?;

        Ok(rows.into_iter().map(Environment::from).collect())
    }
}
