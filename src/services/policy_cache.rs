//! Approval policy cache with TTL.
//!
//! Policy lookup runs on every gated mutation and matches globs against the
//! target path, so compiled policies are cached per `(project, environment)`.
//! Entries expire after the configured TTL and are dropped on every policy
//! write made through the engine.
//!
//! # Thread Safety
//!
//! The cache is shared across requests behind a `RwLock`. The lock is never held
//! while the database is read; a miss loads outside the lock and then stores.

use crate::domain::{most_specific_policy, CompiledPolicy, EnvironmentId, ProjectId, SecretPath};
use crate::errors::Result;
use crate::storage::ApprovalPolicyRepository;
use sqlx::SqliteConnection;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

type CacheKey = (ProjectId, EnvironmentId);

#[derive(Debug, Clone)]
struct CachedPolicies {
    policies: Arc<Vec<CompiledPolicy>>,
    cached_at: Instant,
}

impl CachedPolicies {
    fn new(policies: Vec<CompiledPolicy>) -> Self {
        Self { policies: Arc::new(policies), cached_at: Instant::now() }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.cached_at.elapsed() > ttl
    }
}

#[derive(Debug)]
pub struct PolicyCache {
    cache: RwLock<HashMap<CacheKey, CachedPolicies>>,
    ttl: Duration,
}

impl PolicyCache {
    pub fn new(ttl: Duration) -> Self {
        Self { cache: RwLock::new(HashMap::new()), ttl }
    }

    /// Live policies of an environment, compiled.
    pub async fn policies(
        &self,
        conn: &mut SqliteConnection,
        project_id: &ProjectId,
        environment_id: &EnvironmentId,
    ) -> Result<Arc<Vec<CompiledPolicy>>> {
        let key = (project_id.clone(), environment_id.clone());
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(&key) {
                if !cached.is_expired(self.ttl) {
                    return Ok(cached.policies.clone());
                }
            }
        }

        let policies = ApprovalPolicyRepository::list_by_environment(conn, project_id, environment_id)
            .await?
            .into_iter()
            .map(CompiledPolicy::compile)
            .collect::<Result<Vec<_>>>()?;
        debug!(project_id = %project_id, environment_id = %environment_id, count = policies.len(), "Loaded approval policies");

        let entry = CachedPolicies::new(policies);
        let policies = entry.policies.clone();
        self.cache.write().await.insert(key, entry);
        Ok(policies)
    }

    /// Most specific active policy for `path`.
    pub async fn find(
        &self,
        conn: &mut SqliteConnection,
        project_id: &ProjectId,
        environment_id: &EnvironmentId,
        path: &SecretPath,
    ) -> Result<Option<CompiledPolicy>> {
        let policies = self.policies(conn, project_id, environment_id).await?;
        Ok(most_specific_policy(&policies, path).cloned())
    }

    pub async fn invalidate(&self, project_id: &ProjectId, environment_id: &EnvironmentId) {
        self.cache.write().await.remove(&(project_id.clone(), environment_id.clone()));
    }

    pub async fn invalidate_all(&self) {
        self.cache.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EnforcementLevel;
    use crate::storage::test_helpers::TestDatabase;
    use crate::storage::CreateApprovalPolicyRequest;

    fn request(path: &str) -> CreateApprovalPolicyRequest {
        CreateApprovalPolicyRequest {
            name: format!("policy {}", path),
            secret_path: path.to_string(),
            approvals: 1,
            approvers: vec![],
            bypassers: vec![],
            enforcement_level: EnforcementLevel::Hard,
            allow_self_approval: false,
        }
    }

    #[tokio::test]
    async fn test_cache_serves_until_invalidated() {
        let db = TestDatabase::new("policy_cache").await;
        let env = db.environment_id("prod");
        let cache = PolicyCache::new(Duration::from_secs(60));
        let mut conn = db.pool.acquire().await.unwrap();
        let app = SecretPath::parse("/app").unwrap();

        assert!(cache.find(&mut conn, &db.project.id, &env, &app).await.unwrap().is_none());

        ApprovalPolicyRepository::create(&mut conn, &db.project.id, &env, &request("/app"))
            .await
            .unwrap();
        assert!(cache.find(&mut conn, &db.project.id, &env, &app).await.unwrap().is_none());

        cache.invalidate(&db.project.id, &env).await;
        let found = cache.find(&mut conn, &db.project.id, &env, &app).await.unwrap().unwrap();
        assert_eq!(found.policy.secret_path, "/app");
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_expired_entries_reload() {
        let db = TestDatabase::new("policy_cache_ttl").await;
        let env = db.environment_id("prod");
        let cache = PolicyCache::new(Duration::ZERO);
        let mut conn = db.pool.acquire().await.unwrap();
        let app = SecretPath::parse("/app/db").unwrap();

        assert!(cache.find(&mut conn, &db.project.id, &env, &app).await.unwrap().is_none());
        ApprovalPolicyRepository::create(&mut conn, &db.project.id, &env, &request("/app/*"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(cache.find(&mut conn, &db.project.id, &env, &app).await.unwrap().is_some());

        cache.invalidate_all().await;
        assert_eq!(cache.len().await, 0);
    }
}
