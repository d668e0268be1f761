//! # Secret Engine
//!
//! Entry point for the API layer. Reads go import resolution, then decryption,
//! then optional reference expansion; writes are sealed and handed to the
//! approval gate, which either applies them or parks them in a request.
//!
//! Every read runs under the configured wall-clock budget. Every write runs in
//! one transaction: sealing errors, gate decisions and applier failures all roll
//! back together.

use super::approval_gate::{ApprovalGate, MutationOutcome};
use super::folder_service::FolderService;
use super::import_resolver::{EffectiveSecret, ImportGraphSource};
use super::import_service::{ImportService, ImportingFolder};
use super::mutation_applier::MutationApplier;
use super::policy_cache::PolicyCache;
use super::reference_resolver::{ReferenceResolver, ReferenceTree, ResolveOptions, RootKind};
use super::sealer::Sealer;
use super::secret_encryption::{EnvelopeCodec, SecretEncryption};
use super::store_source::{FolderStore, StoreSource};
use crate::config::{AppConfig, EngineConfig};
use crate::domain::approval::compile_policy_path;
use crate::domain::path::is_valid_folder_name;
use crate::domain::secret::format_multiline;
use crate::domain::{
    ActorContext, ApprovalPolicy, ApprovalPolicyId, ApprovalRequest, ApprovalRequestId, Environment, Folder,
    FolderContext, FolderTarget, ImportProvenance, MoveItem, MoveSecrets, Project, ProjectId,
    ReplicationSummary, RequestStatusCounts, SealedMove, SecretId, SecretImport, SecretImportId,
    SecretLocator, SecretMetadataEntry, SecretMutation, SecretOperation, SecretPath, SecretType,
    SecretView, HIDDEN_SECRET_VALUE,
};
use crate::errors::{Result, VaultlineError};
use crate::storage::{
    begin_transaction, commit_transaction, create_pool, ApprovalPolicyRepository, ApprovalRequestFilter,
    ApprovalRequestRepository, CreateApprovalPolicyRequest, DbPool, EnvironmentRepository, FolderRepository,
    ProjectRepository, SecretImportRepository, SecretReferenceRepository, SecretRepository,
    SecretVersionRepository, UpdateApprovalPolicyRequest,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn, Instrument};
use validator::Validate;

/// How a read renders values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SecretReadOptions {
    /// Include every descendant folder
    pub recursive: bool,
    /// Expand `${...}` references; unresolved ones become empty strings
    pub expand_references: bool,
    /// When false, values are replaced by the mask (the viewer's own Personal secrets excepted)
    pub view_secret_value: bool,
}

impl Default for SecretReadOptions {
    fn default() -> Self {
        Self { recursive: false, expand_references: false, view_secret_value: true }
    }
}

impl SecretReadOptions {
    pub fn expanded() -> Self {
        Self { expand_references: true, ..Self::default() }
    }
}

/// A secret whose value references another one.
#[derive(Debug, Clone, Serialize)]
pub struct SecretDependent {
    pub id: SecretId,
    pub key: String,
    pub environment: String,
    pub secret_path: SecretPath,
}

/// One entry of a secret's history, decrypted.
#[derive(Debug, Clone, Serialize)]
pub struct SecretVersionView {
    pub secret_id: SecretId,
    pub version: i64,
    pub key: String,
    pub secret_type: SecretType,
    pub value: String,
    pub secret_value_hidden: bool,
    pub comment: Option<String>,
    pub tags: Vec<String>,
    pub metadata: Vec<SecretMetadataEntry>,
    pub actor_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SecretEngine {
    pool: DbPool,
    codec: Arc<dyn EnvelopeCodec>,
    gate: ApprovalGate,
    imports: ImportService,
    settings: EngineConfig,
}

impl SecretEngine {
    pub fn new(pool: DbPool, codec: Arc<dyn EnvelopeCodec>, settings: EngineConfig) -> Self {
        let applier = MutationApplier::new(codec.clone());
        let policies = Arc::new(PolicyCache::new(settings.policy_cache_ttl()));
        Self {
            gate: ApprovalGate::new(applier.clone(), policies),
            imports: ImportService::new(applier, codec.clone()),
            pool,
            codec,
            settings,
        }
    }

    /// Connect to the configured database and build the default codec.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let pool = create_pool(&config.database).await?;
        let codec: Arc<dyn EnvelopeCodec> = Arc::new(SecretEncryption::new(&config.encryption)?);
        Ok(Self::new(pool, codec, config.engine.clone()))
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn settings(&self) -> &EngineConfig {
        &self.settings
    }

    async fn within_budget<T, F>(&self, operation: &'static str, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.settings.resolution_timeout(), work).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, timeout_ms = self.settings.resolution_timeout_ms, "Resolution exceeded its time budget");
                Err(VaultlineError::timeout(operation, self.settings.resolution_timeout_ms))
            }
        }
    }

    // ---- projects, environments and folders ----

    pub async fn create_project(&self, name: &str) -> Result<Project> {
        if name.trim().is_empty() {
            return Err(VaultlineError::validation_field("Project name cannot be empty", "name"));
        }
        let mut conn = self.pool.acquire().await?;
        ProjectRepository::create(&mut conn, &ProjectId::new(), name).await
    }

    /// Create an environment together with its root folder.
    pub async fn create_environment(&self, project_id: &ProjectId, slug: &str, name: &str) -> Result<Environment> {
        if !is_valid_folder_name(slug) {
            return Err(VaultlineError::validation_field(
                format!("Environment slug '{}' may only contain letters, digits, '_' and '-'", slug),
                "slug",
            ));
        }

        let mut tx = begin_transaction(&self.pool).await?;
        ProjectRepository::get_by_id(&mut tx, project_id)
            .await?
            .ok_or_else(|| VaultlineError::not_found("Project", project_id.as_str()))?;
        let environment = EnvironmentRepository::create(&mut tx, project_id, slug, name).await?;
        FolderRepository::create_root(&mut tx, &environment.id).await?;
        commit_transaction(tx).await?;

        info!(project_id = %project_id, slug, "Created environment");
        Ok(environment)
    }

    pub async fn get_environment(&self, project_id: &ProjectId, slug: &str) -> Result<Environment> {
        let mut conn = self.pool.acquire().await?;
        FolderService::environment(&mut conn, project_id, slug).await
    }

    pub async fn list_environments(&self, project_id: &ProjectId) -> Result<Vec<Environment>> {
        let mut conn = self.pool.acquire().await?;
        EnvironmentRepository::list_by_project(&mut conn, project_id).await
    }

    pub async fn create_folder(&self, target: &FolderTarget) -> Result<Folder> {
        let mut tx = begin_transaction(&self.pool).await?;
        let environment = FolderService::environment(&mut tx, &target.project_id, &target.environment).await?;
        let folder = FolderService::create(&mut tx, &environment, &target.path).await?;
        commit_transaction(tx).await?;
        Ok(folder)
    }

    pub async fn delete_folder(&self, target: &FolderTarget) -> Result<()> {
        let mut tx = begin_transaction(&self.pool).await?;
        let environment = FolderService::environment(&mut tx, &target.project_id, &target.environment).await?;
        FolderService::delete(&mut tx, &environment, &target.path).await?;
        commit_transaction(tx).await
    }

    pub async fn list_folders(&self, target: &FolderTarget) -> Result<Vec<Folder>> {
        let mut conn = self.pool.acquire().await?;
        let environment = FolderService::environment(&mut conn, &target.project_id, &target.environment).await?;
        FolderService::list(&mut conn, &environment, &target.path).await
    }

    // ---- reads ----

    /// Effective secrets of `target` as `actor` sees them.
    pub async fn get_effective_secrets(
        &self,
        actor: &ActorContext,
        target: &FolderTarget,
        options: SecretReadOptions,
    ) -> Result<Vec<SecretView>> {
        let span = crate::engine_span!(
            "get_effective_secrets",
            environment = %target.environment,
            path = %target.path,
            recursive = options.recursive,
            expand = options.expand_references
        );
        self.within_budget("get_effective_secrets", self.read_effective(actor, target, options))
            .instrument(span)
            .await
    }

    async fn read_effective(
        &self,
        actor: &ActorContext,
        target: &FolderTarget,
        options: SecretReadOptions,
    ) -> Result<Vec<SecretView>> {
        let mut conn = self.pool.acquire().await?;
        let mut source = StoreSource::new(&mut conn, target.project_id.clone(), &*self.codec);
        let context = locate(&mut source.store, target).await?;
        let folders =
            source.imports.resolve(&mut source.store, &context, actor.personal_owner(), options.recursive).await?;

        let mut resolver = ReferenceResolver::new(ResolveOptions::expand(self.settings.max_reference_depth));
        let mut views = Vec::new();
        for folder in &folders {
            for secret in &folder.secrets {
                views.push(self.render(&mut source, &mut resolver, actor, &folder.context, secret, options).await?);
            }
        }
        Ok(views)
    }

    /// One effective secret of `target`, optionally as it was at `version`.
    pub async fn get_secret_by_key(
        &self,
        actor: &ActorContext,
        target: &FolderTarget,
        key: &str,
        version: Option<i64>,
        options: SecretReadOptions,
    ) -> Result<SecretView> {
        let span = crate::engine_span!("get_secret_by_key", environment = %target.environment, path = %target.path, key);
        self.within_budget("get_secret_by_key", async {
            let mut conn = self.pool.acquire().await?;
            let mut source = StoreSource::new(&mut conn, target.project_id.clone(), &*self.codec);
            let context = locate(&mut source.store, target).await?;
            let mut secret = find_effective(&mut source, &context, actor, key).await?;

            if let Some(version) = version.filter(|v| *v != secret.record.version) {
                let historic = SecretVersionRepository::get(source.store.connection(), &secret.record.id, version)
                    .await?
                    .ok_or_else(|| {
                        VaultlineError::not_found("SecretVersion", format!("{}@{}", secret.record.id, version))
                    })?;
                let record = &mut secret.record;
                record.key = historic.key;
                record.version = historic.version;
                record.value = historic.value;
                record.comment = historic.comment;
                record.skip_multiline_encoding = historic.skip_multiline_encoding;
                record.tags = historic.tags;
                record.metadata = historic.metadata;
                record.updated_at = historic.created_at;
            }

            let mut resolver = ReferenceResolver::new(ResolveOptions::expand(self.settings.max_reference_depth));
            self.render(&mut source, &mut resolver, actor, &context, &secret, options).await
        })
        .instrument(span)
        .await
    }

    /// Reference graph of one secret. Unresolved references fail instead of expanding to "".
    pub async fn get_reference_tree(
        &self,
        actor: &ActorContext,
        target: &FolderTarget,
        key: &str,
        view_secret_value: bool,
    ) -> Result<ReferenceTree> {
        let span = crate::engine_span!("get_reference_tree", environment = %target.environment, path = %target.path, key);
        self.within_budget("get_reference_tree", async {
            let mut conn = self.pool.acquire().await?;
            let mut source = StoreSource::new(&mut conn, target.project_id.clone(), &*self.codec);
            let context = locate(&mut source.store, target).await?;
            let secret = find_effective(&mut source, &context, actor, key).await?;

            let raw = self.codec.open_string(&secret.record.value, &target.project_id)?;
            let home = SecretLocator::new(secret.environment.clone(), secret.secret_path.clone(), key);
            let mut resolver = ReferenceResolver::new(ResolveOptions::validate(self.settings.max_reference_depth));
            let mut tree = resolver.tree_as(&mut source, &home, root_kind(&secret), &raw).await?;
            if !view_secret_value {
                tree.mask_values(HIDDEN_SECRET_VALUE);
            }
            Ok(tree)
        })
        .instrument(span)
        .await
    }

    /// Version history of a secret, newest first. History outlives the live secret.
    pub async fn get_secret_versions(
        &self,
        actor: &ActorContext,
        project_id: &ProjectId,
        secret_id: &SecretId,
        view_secret_value: bool,
    ) -> Result<Vec<SecretVersionView>> {
        let mut conn = self.pool.acquire().await?;
        let history = SecretVersionRepository::list_by_secret(&mut conn, secret_id).await?;
        let Some(latest) = history.first() else {
            return Err(VaultlineError::not_found("Secret", secret_id.as_str()));
        };

        if latest.secret_type == SecretType::Personal && latest.owner_actor_id.as_deref() != actor.personal_owner() {
            return Err(VaultlineError::not_found("Secret", secret_id.as_str()));
        }
        if let Some(folder) = FolderRepository::get_by_id(&mut conn, &latest.folder_id).await? {
            let environment = EnvironmentRepository::get_by_id(&mut conn, &folder.environment_id).await?;
            if environment.map(|env| &env.project_id != project_id).unwrap_or(true) {
                return Err(VaultlineError::not_found("Secret", secret_id.as_str()));
            }
        }

        let sealer = Sealer::new(&*self.codec, project_id);
        history
            .into_iter()
            .map(|entry| {
                let owned_by_viewer = entry.secret_type == SecretType::Personal;
                let hidden = !view_secret_value && !owned_by_viewer;
                Ok(SecretVersionView {
                    value: if hidden { HIDDEN_SECRET_VALUE.to_string() } else { sealer.open_value(&entry.value)? },
                    secret_value_hidden: hidden,
                    comment: sealer.open_comment(entry.comment.as_ref())?,
                    metadata: sealer.open_metadata(&entry.metadata)?,
                    secret_id: entry.secret_id,
                    version: entry.version,
                    key: entry.key,
                    secret_type: entry.secret_type,
                    tags: entry.tags,
                    actor_id: entry.actor_id,
                    created_at: entry.created_at,
                })
            })
            .collect()
    }

    /// Secrets whose values reference `key` as it is defined for `target`.
    pub async fn get_secret_dependents(
        &self,
        actor: &ActorContext,
        target: &FolderTarget,
        key: &str,
    ) -> Result<Vec<SecretDependent>> {
        let mut conn = self.pool.acquire().await?;
        let mut source = StoreSource::new(&mut conn, target.project_id.clone(), &*self.codec);
        let context = locate(&mut source.store, target).await?;
        let secret = find_effective(&mut source, &context, actor, key).await?;
        drop(source);

        let locator = SecretLocator::new(secret.environment.clone(), secret.secret_path.clone(), key);
        let ids =
            SecretReferenceRepository::find_dependents(&mut conn, &target.project_id, &locator, &secret.record.folder_id)
                .await?;

        let mut dependents = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(record) = SecretRepository::get_by_id(&mut conn, &id).await? else { continue };
            if record.secret_type == SecretType::Personal && record.owner_actor_id.as_deref() != actor.personal_owner() {
                continue;
            }
            let Some(folder) = FolderRepository::get_by_id(&mut conn, &record.folder_id).await? else { continue };
            let Some(environment) = EnvironmentRepository::get_by_id(&mut conn, &folder.environment_id).await? else {
                continue;
            };
            dependents.push(SecretDependent {
                id: record.id,
                key: record.key,
                environment: environment.slug,
                secret_path: folder.path,
            });
        }
        Ok(dependents)
    }

    async fn render(
        &self,
        source: &mut StoreSource<'_>,
        resolver: &mut ReferenceResolver,
        actor: &ActorContext,
        context: &FolderContext,
        secret: &EffectiveSecret,
        options: SecretReadOptions,
    ) -> Result<SecretView> {
        let record = &secret.record;
        let sealer = Sealer::new(&*self.codec, context.project_id());
        let owned_by_viewer = record.secret_type == SecretType::Personal
            && record.owner_actor_id.is_some()
            && record.owner_actor_id.as_deref() == actor.personal_owner();
        let hidden = !options.view_secret_value && !owned_by_viewer;

        let value = if hidden {
            HIDDEN_SECRET_VALUE.to_string()
        } else {
            let raw = sealer.open_value(&record.value)?;
            let value = if options.expand_references {
                let home = SecretLocator::new(secret.environment.clone(), secret.secret_path.clone(), record.key.clone());
                resolver.resolve_as(source, &home, root_kind(secret), &raw).await?
            } else {
                raw
            };
            format_multiline(&value, record.skip_multiline_encoding)
        };

        Ok(SecretView {
            id: record.id.clone(),
            key: record.key.clone(),
            version: record.version,
            secret_type: record.secret_type,
            value,
            secret_value_hidden: hidden,
            comment: sealer.open_comment(record.comment.as_ref())?,
            tags: record.tags.clone(),
            metadata: sealer.open_metadata(&record.metadata)?,
            skip_multiline_encoding: record.skip_multiline_encoding,
            environment: context.environment.slug.clone(),
            secret_path: context.folder.path.clone(),
            imported_from: secret.is_imported_into(&context.folder.id).then(|| ImportProvenance {
                environment: secret.environment.clone(),
                secret_path: secret.secret_path.clone(),
            }),
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }

    // ---- writes ----

    /// Seal and submit a batch against `target`. Creates materialize a missing folder.
    pub async fn mutate(
        &self,
        actor: &ActorContext,
        target: &FolderTarget,
        mutations: Vec<SecretMutation>,
    ) -> Result<MutationOutcome> {
        let span = crate::engine_span!(
            "mutate",
            environment = %target.environment,
            path = %target.path,
            actor_id = %actor.actor_id,
            operations = mutations.len()
        );
        async move {
            if mutations.is_empty() {
                return Err(VaultlineError::validation("A mutation batch needs at least one operation"));
            }

            let sealer = Sealer::new(&*self.codec, &target.project_id);
            let batched = mutations.len() > 1;
            let mut tx = begin_transaction(&self.pool).await?;

            let environment = FolderService::environment(&mut tx, &target.project_id, &target.environment).await?;
            let folder = if mutations.iter().any(|m| matches!(m, SecretMutation::Create(_))) {
                FolderService::ensure(&mut tx, &environment, &target.path).await?
            } else {
                FolderRepository::find_by_path(&mut tx, &environment.id, &target.path)
                    .await?
                    .ok_or_else(|| VaultlineError::not_found("Folder", format!("{}:{}", target.environment, target.path)))?
            };

            let mut operations = Vec::with_capacity(mutations.len());
            for (index, mutation) in mutations.iter().enumerate() {
                let sealed = match mutation {
                    SecretMutation::Create(create) => sealer.create(actor, create).map(SecretOperation::Create),
                    SecretMutation::Update(update) => sealer.update(actor, update).map(SecretOperation::Update),
                    SecretMutation::Delete(delete) => sealer.delete(actor, delete).map(SecretOperation::Delete),
                    SecretMutation::Move(moved) => {
                        seal_move(&mut tx, &target.project_id, moved).await.map(SecretOperation::Move)
                    }
                };
                operations.push(sealed.map_err(|e| if batched { VaultlineError::batch(index, e) } else { e })?);
            }

            let context = FolderContext { environment, folder };
            let outcome = self.gate.submit(&mut tx, actor, &context, operations).await?;
            commit_transaction(tx).await?;
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    // ---- approval requests ----

    pub async fn approve_request(
        &self,
        actor: &ActorContext,
        project_id: &ProjectId,
        request_id: &ApprovalRequestId,
    ) -> Result<ApprovalRequest> {
        self.gate.approve(&self.pool, project_id, actor, request_id).await
    }

    pub async fn reject_request(
        &self,
        actor: &ActorContext,
        project_id: &ProjectId,
        request_id: &ApprovalRequestId,
    ) -> Result<ApprovalRequest> {
        self.gate.reject(&self.pool, project_id, actor, request_id).await
    }

    pub async fn bypass_request(
        &self,
        actor: &ActorContext,
        project_id: &ProjectId,
        request_id: &ApprovalRequestId,
        reason: &str,
    ) -> Result<ApprovalRequest> {
        self.gate.bypass(&self.pool, project_id, actor, request_id, reason).await
    }

    pub async fn retry_request(&self, project_id: &ProjectId, request_id: &ApprovalRequestId) -> Result<ApprovalRequest> {
        self.gate.retry(&self.pool, project_id, request_id).await
    }

    pub async fn get_request(&self, project_id: &ProjectId, request_id: &ApprovalRequestId) -> Result<ApprovalRequest> {
        let mut conn = self.pool.acquire().await?;
        ApprovalRequestRepository::get_by_id(&mut conn, request_id)
            .await?
            .filter(|request| &request.project_id == project_id)
            .ok_or_else(|| VaultlineError::not_found("Approval request", request_id.as_str()))
    }

    pub async fn list_requests(
        &self,
        project_id: &ProjectId,
        filter: &ApprovalRequestFilter,
    ) -> Result<Vec<ApprovalRequest>> {
        let mut conn = self.pool.acquire().await?;
        ApprovalRequestRepository::list(&mut conn, project_id, filter).await
    }

    pub async fn count_requests(&self, project_id: &ProjectId, environment: Option<&str>) -> Result<RequestStatusCounts> {
        let mut conn = self.pool.acquire().await?;
        let environment_id = match environment {
            Some(slug) => Some(FolderService::environment(&mut conn, project_id, slug).await?.id),
            None => None,
        };
        ApprovalRequestRepository::count_by_status(&mut conn, project_id, environment_id.as_ref()).await
    }

    // ---- approval policies ----

    pub async fn create_policy(
        &self,
        project_id: &ProjectId,
        environment: &str,
        request: &CreateApprovalPolicyRequest,
    ) -> Result<ApprovalPolicy> {
        request.validate()?;
        compile_policy_path(&request.secret_path)?;

        let mut conn = self.pool.acquire().await?;
        let environment = FolderService::environment(&mut conn, project_id, environment).await?;
        let policy = ApprovalPolicyRepository::create(&mut conn, project_id, &environment.id, request).await?;
        self.gate.policies().invalidate(project_id, &environment.id).await;
        Ok(policy)
    }

    pub async fn update_policy(
        &self,
        project_id: &ProjectId,
        policy_id: &ApprovalPolicyId,
        request: &UpdateApprovalPolicyRequest,
    ) -> Result<ApprovalPolicy> {
        request.validate()?;
        if let Some(path) = &request.secret_path {
            compile_policy_path(path)?;
        }

        let mut conn = self.pool.acquire().await?;
        let mut policy = live_policy(&mut conn, project_id, policy_id).await?;
        if let Some(name) = &request.name {
            policy.name = name.clone();
        }
        if let Some(path) = &request.secret_path {
            policy.secret_path = path.clone();
        }
        if let Some(approvals) = request.approvals {
            policy.approvals = approvals;
        }
        if let Some(approvers) = &request.approvers {
            policy.approvers = approvers.clone();
        }
        if let Some(bypassers) = &request.bypassers {
            policy.bypassers = bypassers.clone();
        }
        if let Some(level) = request.enforcement_level {
            policy.enforcement_level = level;
        }
        if let Some(allow) = request.allow_self_approval {
            policy.allow_self_approval = allow;
        }
        if let Some(enabled) = request.enabled {
            policy.enabled = enabled;
        }

        ApprovalPolicyRepository::update(&mut conn, &policy).await?;
        self.gate.policies().invalidate(project_id, &policy.environment_id).await;
        live_policy(&mut conn, project_id, policy_id).await
    }

    pub async fn delete_policy(&self, project_id: &ProjectId, policy_id: &ApprovalPolicyId) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let policy = live_policy(&mut conn, project_id, policy_id).await?;
        ApprovalPolicyRepository::soft_delete(&mut conn, policy_id).await?;
        self.gate.policies().invalidate(project_id, &policy.environment_id).await;
        Ok(())
    }

    pub async fn list_policies(&self, project_id: &ProjectId, environment: &str) -> Result<Vec<ApprovalPolicy>> {
        let mut conn = self.pool.acquire().await?;
        let environment = FolderService::environment(&mut conn, project_id, environment).await?;
        ApprovalPolicyRepository::list_by_environment(&mut conn, project_id, &environment.id).await
    }

    // ---- imports ----

    pub async fn create_import(
        &self,
        target: &FolderTarget,
        source_environment: &str,
        source_path: &SecretPath,
        is_replication: bool,
    ) -> Result<SecretImport> {
        let mut tx = begin_transaction(&self.pool).await?;
        let context = FolderService::require(&mut tx, target).await?;
        let source = FolderService::environment(&mut tx, &target.project_id, source_environment).await?;
        let import = self.imports.create_import(&mut tx, &context, &source, source_path, is_replication).await?;
        commit_transaction(tx).await?;
        Ok(import)
    }

    pub async fn update_import_position(
        &self,
        target: &FolderTarget,
        import_id: &SecretImportId,
        position: i64,
    ) -> Result<SecretImport> {
        let mut tx = begin_transaction(&self.pool).await?;
        let context = FolderService::require(&mut tx, target).await?;
        let import = self.imports.update_position(&mut tx, &context, import_id, position).await?;
        commit_transaction(tx).await?;
        Ok(import)
    }

    pub async fn delete_import(&self, target: &FolderTarget, import_id: &SecretImportId) -> Result<SecretImport> {
        let mut tx = begin_transaction(&self.pool).await?;
        let context = FolderService::require(&mut tx, target).await?;
        let import = self.imports.delete_import(&mut tx, &context, import_id).await?;
        commit_transaction(tx).await?;
        Ok(import)
    }

    pub async fn list_imports(&self, target: &FolderTarget) -> Result<Vec<SecretImport>> {
        let mut conn = self.pool.acquire().await?;
        let context = FolderService::require(&mut conn, target).await?;
        self.imports.list_imports(&mut conn, &context).await
    }

    pub async fn get_folder_imported_by(&self, target: &FolderTarget) -> Result<Vec<ImportingFolder>> {
        let mut conn = self.pool.acquire().await?;
        let environment = FolderService::environment(&mut conn, &target.project_id, &target.environment).await?;
        self.imports.get_folder_imported_by(&mut conn, &environment, &target.path).await
    }

    /// Resync one replicated import. A failure is recorded on the import.
    pub async fn resync_replicated_import(
        &self,
        project_id: &ProjectId,
        import_id: &SecretImportId,
    ) -> Result<ReplicationSummary> {
        let span = crate::engine_span!("resync_replicated_import", import_id = %import_id);
        async move {
            let mut tx = begin_transaction(&self.pool).await?;
            owned_import(&mut tx, project_id, import_id).await?;
            match self.imports.resync_replicated_import(&mut tx, project_id, import_id).await {
                Ok(summary) => {
                    commit_transaction(tx).await?;
                    Ok(summary)
                }
                Err(e) => {
                    drop(tx);
                    let mut conn = self.pool.acquire().await?;
                    SecretImportRepository::record_replication(&mut conn, import_id, None, Some(&e.to_string()))
                        .await?;
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    pub async fn resync_all_replications(&self, project_id: &ProjectId) -> Result<Vec<Result<ReplicationSummary>>> {
        let span = crate::engine_span!("resync_all_replications", project_id = %project_id);
        self.imports.resync_all_replications(&self.pool, project_id).instrument(span).await
    }
}

async fn locate(store: &mut FolderStore<'_>, target: &FolderTarget) -> Result<FolderContext> {
    let environment = store
        .environment_by_slug(&target.environment)
        .await?
        .ok_or_else(|| VaultlineError::not_found("Environment", target.environment.as_str()))?;
    store
        .folder(&environment.id, &target.path)
        .await?
        .ok_or_else(|| VaultlineError::not_found("Folder", format!("{}:{}", target.environment, target.path)))
}

/// The secret `actor` sees under `key` in `context`, Personal overlay included.
async fn find_effective(
    source: &mut StoreSource<'_>,
    context: &FolderContext,
    actor: &ActorContext,
    key: &str,
) -> Result<EffectiveSecret> {
    let folders = source.imports.resolve(&mut source.store, context, actor.personal_owner(), false).await?;
    folders
        .into_iter()
        .flat_map(|folder| folder.secrets)
        .find(|secret| secret.record.key == key)
        .ok_or_else(|| {
            VaultlineError::not_found(
                "Secret",
                SecretLocator::new(context.environment.slug.clone(), context.folder.path.clone(), key).to_string(),
            )
        })
}

fn root_kind(secret: &EffectiveSecret) -> RootKind {
    match secret.record.secret_type {
        SecretType::Personal => RootKind::Personal,
        SecretType::Shared => RootKind::Shared,
    }
}

async fn seal_move(conn: &mut SqliteConnection, project_id: &ProjectId, moved: &MoveSecrets) -> Result<SealedMove> {
    if moved.secret_ids.is_empty() {
        return Err(VaultlineError::validation_field("A move needs at least one secret", "secret_ids"));
    }
    let destination = FolderService::environment(conn, project_id, &moved.destination_environment).await?;
    Ok(SealedMove {
        items: moved
            .secret_ids
            .iter()
            .map(|secret_id| MoveItem { secret_id: secret_id.clone(), expected_version: None })
            .collect(),
        destination_environment_id: destination.id,
        destination_path: moved.destination_path.clone(),
        should_overwrite: moved.should_overwrite,
    })
}

async fn live_policy(
    conn: &mut SqliteConnection,
    project_id: &ProjectId,
    policy_id: &ApprovalPolicyId,
) -> Result<ApprovalPolicy> {
    ApprovalPolicyRepository::get_by_id(conn, policy_id)
        .await?
        .filter(|policy| &policy.project_id == project_id && policy.deleted_at.is_none())
        .ok_or_else(|| VaultlineError::not_found("ApprovalPolicy", policy_id.as_str()))
}

async fn owned_import(conn: &mut SqliteConnection, project_id: &ProjectId, import_id: &SecretImportId) -> Result<()> {
    let replications = SecretImportRepository::list_replications(conn, project_id).await?;
    if replications.iter().any(|import| &import.id == import_id) {
        Ok(())
    } else {
        Err(VaultlineError::not_found("SecretImport", import_id.as_str()))
    }
}
