//! Test database utilities for integration tests.
//!
//! Provides file-based SQLite databases under `data/test/` for test isolation
//! and easier debugging of test failures. File databases allow several pooled
//! connections, so concurrent writers really race.

#![allow(clippy::duplicate_mod)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;
use vaultline::config::{DatabaseConfig, EngineConfig};
use vaultline::domain::{FolderTarget, Project, ProjectId};
use vaultline::services::{EnvelopeCodec, SecretEncryption, SecretEncryptionConfig, SecretEngine};
use vaultline::storage::{create_pool, DbPool};

/// Counter for generating unique database names within a test run
static DB_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Environment slugs seeded by `TestEngine`.
pub const TEST_ENVIRONMENTS: [&str; 3] = ["dev", "staging", "prod"];

fn test_db_dir() -> PathBuf {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(manifest_dir).join("data").join("test")
}

fn unique_db_name(prefix: &str) -> String {
    let counter = DB_COUNTER.fetch_add(1, Ordering::SeqCst);
    let uuid_short = &Uuid::new_v4().to_string()[..8];
    format!("{}_{}_{}_{}.db", prefix, std::process::id(), counter, uuid_short)
}

/// A migrated test database that is deleted on drop.
pub struct TestDatabase {
    pub pool: DbPool,
    pub path: PathBuf,
}

impl TestDatabase {
    pub async fn new(prefix: &str) -> Self {
        let db_dir = test_db_dir();
        std::fs::create_dir_all(&db_dir).expect("create test database directory");

        let path = db_dir.join(unique_db_name(prefix));
        let config = DatabaseConfig {
            url: format!("sqlite://{}?mode=rwc", path.display()),
            max_connections: 5,
            auto_migrate: true,
            ..Default::default()
        };
        let pool = create_pool(&config).await.expect("create test database pool");

        Self { pool, path }
    }
}

impl Drop for TestDatabase {
    fn drop(&mut self) {
        // Best effort cleanup - don't panic in drop
        let _ = std::fs::remove_file(&self.path);
        let _ = std::fs::remove_file(self.path.with_extension("db-wal"));
        let _ = std::fs::remove_file(self.path.with_extension("db-shm"));
    }
}

/// An engine over a fresh database with one project and the `TEST_ENVIRONMENTS`.
pub struct TestEngine {
    pub db: TestDatabase,
    pub engine: SecretEngine,
    pub project: Project,
}

impl TestEngine {
    pub async fn new(prefix: &str) -> Self {
        Self::with_settings(prefix, EngineConfig::default()).await
    }

    pub async fn with_settings(prefix: &str, settings: EngineConfig) -> Self {
        let db = TestDatabase::new(prefix).await;
        let codec: Arc<dyn EnvelopeCodec> = Arc::new(
            SecretEncryption::new(&SecretEncryptionConfig::for_testing()).expect("test codec"),
        );
        let engine = SecretEngine::new(db.pool.clone(), codec, settings);

        let project = engine.create_project("Integration").await.expect("create project");
        for slug in TEST_ENVIRONMENTS {
            engine.create_environment(&project.id, slug, slug).await.expect("create environment");
        }

        Self { db, engine, project }
    }

    pub fn project_id(&self) -> &ProjectId {
        &self.project.id
    }

    pub fn target(&self, environment: &str, path: &str) -> FolderTarget {
        FolderTarget::new(self.project.id.clone(), environment, super::path(path))
    }
}
