//! Test database utilities for in-library tests.
//!
//! Each `TestDatabase` owns a fresh in-memory SQLite database with all migrations
//! applied and a seeded project with `dev`, `staging` and `prod` environments.

use crate::config::DatabaseConfig;
use crate::domain::{Environment, EnvironmentId, Folder, Project, ProjectId};
use crate::storage::repositories::{EnvironmentRepository, FolderRepository, ProjectRepository};
use crate::storage::{create_pool, DbPool};

/// Predictable project id for seed data.
pub const TEST_PROJECT_ID: &str = "00000000-0000-0000-0000-0000000000a1";

/// Environment slugs seeded into every test database.
pub const TEST_ENVIRONMENTS: [&str; 3] = ["dev", "staging", "prod"];

pub struct TestDatabase {
    pub pool: DbPool,
    pub project: Project,
    pub environments: Vec<Environment>,
}

impl TestDatabase {
    /// Create a migrated in-memory database. `prefix` only labels panics.
    pub async fn new(prefix: &str) -> Self {
        let pool = create_pool(&DatabaseConfig::in_memory())
            .await
            .unwrap_or_else(|e| panic!("Failed to create test pool for {}: {}", prefix, e));

        let mut conn = pool.acquire().await.unwrap();
        let project = ProjectRepository::create(
            &mut conn,
            &ProjectId::from_string(TEST_PROJECT_ID.to_string()),
            "Test Project",
        )
        .await
        .unwrap_or_else(|e| panic!("Failed to seed project for {}: {}", prefix, e));

        let mut environments = Vec::new();
        for slug in TEST_ENVIRONMENTS {
            let env = EnvironmentRepository::create(&mut conn, &project.id, slug, slug)
                .await
                .unwrap_or_else(|e| panic!("Failed to seed environment '{}': {}", slug, e));
            FolderRepository::create_root(&mut conn, &env.id)
                .await
                .unwrap_or_else(|e| panic!("Failed to seed root folder for '{}': {}", slug, e));
            environments.push(env);
        }
        drop(conn);

        Self { pool, project, environments }
    }

    pub fn environment(&self, slug: &str) -> &Environment {
        self.environments
            .iter()
            .find(|env| env.slug == slug)
            .unwrap_or_else(|| panic!("no seeded environment '{}'", slug))
    }

    pub fn environment_id(&self, slug: &str) -> EnvironmentId {
        self.environment(slug).id.clone()
    }

    pub async fn root_folder(&self, slug: &str) -> Folder {
        let mut conn = self.pool.acquire().await.unwrap();
        FolderRepository::find_by_path(
            &mut conn,
            &self.environment_id(slug),
            &crate::domain::SecretPath::root(),
        )
        .await
        .unwrap()
        .unwrap()
    }
}
