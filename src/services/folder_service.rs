//! Folder tree operations
//!
//! Resolves caller-facing `(project, environment slug, path)` targets to stored
//! folders and maintains the per-environment tree. All functions run on the
//! connection or transaction they are given.

use crate::domain::{Environment, Folder, FolderContext, FolderTarget, ProjectId, SecretPath};
use crate::errors::{ConflictKind, Result, VaultlineError};
use crate::storage::{EnvironmentRepository, FolderRepository};
use sqlx::SqliteConnection;
use tracing::{info, instrument};

pub struct FolderService;

impl FolderService {
    /// Environment `slug` of `project_id`, or `NotFound`.
    pub async fn environment(
        conn: &mut SqliteConnection,
        project_id: &ProjectId,
        slug: &str,
    ) -> Result<Environment> {
        EnvironmentRepository::find_by_slug(conn, project_id, slug)
            .await?
            .ok_or_else(|| VaultlineError::not_found("Environment", slug))
    }

    /// Resolve a target to an existing folder, or `None` if the path does not exist.
    pub async fn find(
        conn: &mut SqliteConnection,
        target: &FolderTarget,
    ) -> Result<Option<FolderContext>> {
        let environment = Self::environment(conn, &target.project_id, &target.environment).await?;
        let folder = FolderRepository::find_by_path(conn, &environment.id, &target.path).await?;
        Ok(folder.map(|folder| FolderContext { environment, folder }))
    }

    /// Resolve a target to an existing folder, or `NotFound`.
    pub async fn require(conn: &mut SqliteConnection, target: &FolderTarget) -> Result<FolderContext> {
        Self::find(conn, target).await?.ok_or_else(|| {
            VaultlineError::not_found("Folder", format!("{}:{}", target.environment, target.path))
        })
    }

    /// Return the folder at `path`, creating it and any missing ancestors.
    #[instrument(skip(conn, environment), fields(environment = %environment.slug, path = %path), name = "ensure_folder")]
    pub async fn ensure(
        conn: &mut SqliteConnection,
        environment: &Environment,
        path: &SecretPath,
    ) -> Result<Folder> {
        let mut parent: Option<Folder> = None;

        for ancestor in path.ancestors_inclusive() {
            let folder = match FolderRepository::find_by_path(conn, &environment.id, &ancestor).await? {
                Some(folder) => folder,
                None => match (&parent, ancestor.name()) {
                    (Some(parent), Some(name)) => {
                        FolderRepository::create(conn, parent, name, false).await?
                    }
                    _ => FolderRepository::create_root(conn, &environment.id).await?,
                },
            };
            parent = Some(folder);
        }

        parent.ok_or_else(|| VaultlineError::internal("Path produced no folders"))
    }

    /// Create the folder at `path`. Missing ancestors are created; an existing folder is a conflict.
    #[instrument(skip(conn, environment), fields(environment = %environment.slug, path = %path), name = "create_folder")]
    pub async fn create(
        conn: &mut SqliteConnection,
        environment: &Environment,
        path: &SecretPath,
    ) -> Result<Folder> {
        if FolderRepository::find_by_path(conn, &environment.id, path).await?.is_some() {
            return Err(VaultlineError::conflict(
                ConflictKind::AlreadyExists,
                format!("Folder '{}' already exists in environment '{}'", path, environment.slug),
            ));
        }

        let folder = Self::ensure(conn, environment, path).await?;
        info!(folder_id = %folder.id, environment = %environment.slug, path = %path, "Created folder");
        Ok(folder)
    }

    /// Delete the folder at `path` together with everything below it.
    #[instrument(skip(conn, environment), fields(environment = %environment.slug, path = %path), name = "delete_folder")]
    pub async fn delete(
        conn: &mut SqliteConnection,
        environment: &Environment,
        path: &SecretPath,
    ) -> Result<()> {
        if path.is_root() {
            return Err(VaultlineError::validation_field("The root folder cannot be deleted", "path"));
        }

        let folder = FolderRepository::find_by_path(conn, &environment.id, path)
            .await?
            .ok_or_else(|| VaultlineError::not_found("Folder", format!("{}:{}", environment.slug, path)))?;
        if folder.is_reserved {
            return Err(VaultlineError::validation_field(
                "Reserved replication folders are removed with their import",
                "path",
            ));
        }

        FolderRepository::delete(conn, &folder.id).await?;
        info!(folder_id = %folder.id, environment = %environment.slug, path = %path, "Deleted folder");
        Ok(())
    }

    /// Visible children of the folder at `path`.
    pub async fn list(
        conn: &mut SqliteConnection,
        environment: &Environment,
        path: &SecretPath,
    ) -> Result<Vec<Folder>> {
        let folder = FolderRepository::find_by_path(conn, &environment.id, path)
            .await?
            .ok_or_else(|| VaultlineError::not_found("Folder", format!("{}:{}", environment.slug, path)))?;
        FolderRepository::list_children(conn, &folder.id, false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_helpers::TestDatabase;

    fn path(raw: &str) -> SecretPath {
        SecretPath::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_ensure_creates_missing_ancestors_once() {
        let db = TestDatabase::new("folder_service_ensure").await;
        let env = db.environment("dev").clone();
        let mut conn = db.pool.acquire().await.unwrap();

        let leaf = FolderService::ensure(&mut conn, &env, &path("/a/b/c")).await.unwrap();
        assert_eq!(leaf.path, path("/a/b/c"));

        let again = FolderService::ensure(&mut conn, &env, &path("/a/b/c")).await.unwrap();
        assert_eq!(again.id, leaf.id);

        let children = FolderService::list(&mut conn, &env, &path("/a")).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name, "b");
    }

    #[tokio::test]
    async fn test_create_existing_folder_conflicts() {
        let db = TestDatabase::new("folder_service_create").await;
        let env = db.environment("dev").clone();
        let mut conn = db.pool.acquire().await.unwrap();

        FolderService::create(&mut conn, &env, &path("/app")).await.unwrap();
        let err = FolderService::create(&mut conn, &env, &path("/app")).await.unwrap_err();
        assert_eq!(err.conflict_kind(), Some(ConflictKind::AlreadyExists));
        assert!(FolderService::create(&mut conn, &env, &SecretPath::root()).await.is_err());
    }

    #[tokio::test]
    async fn test_root_cannot_be_deleted() {
        let db = TestDatabase::new("folder_service_delete").await;
        let env = db.environment("dev").clone();
        let mut conn = db.pool.acquire().await.unwrap();

        assert!(matches!(
            FolderService::delete(&mut conn, &env, &SecretPath::root()).await,
            Err(VaultlineError::Validation { .. })
        ));
        FolderService::create(&mut conn, &env, &path("/app/db")).await.unwrap();
        FolderService::delete(&mut conn, &env, &path("/app")).await.unwrap();
        assert!(FolderService::list(&mut conn, &env, &path("/app")).await.is_err());
    }

    #[tokio::test]
    async fn test_find_unknown_environment_is_not_found() {
        let db = TestDatabase::new("folder_service_find").await;
        let mut conn = db.pool.acquire().await.unwrap();

        let target = FolderTarget::new(db.project.id.clone(), "qa", SecretPath::root());
        assert!(matches!(
            FolderService::find(&mut conn, &target).await,
            Err(VaultlineError::NotFound { .. })
        ));
    }
}
