//! Versioned mutation applier
//!
//! Applies sealed operations to one folder. Every write is a compare-and-swap on
//! the secret's version, and every committed version is appended to history.
//!
//! The applier never opens or commits a transaction itself: callers pass the
//! transaction the whole batch runs in, so a failing operation rolls back every
//! operation before it.

use super::folder_service::FolderService;
use super::secret_encryption::EnvelopeCodec;
use crate::domain::reference::{extract_edges, rewrite_references};
use crate::domain::{
    EnvironmentId, Folder, FolderContext, FolderId, ProjectId, SealedCreate, SealedDelete,
    SealedMove, SealedUpdate, SecretId, SecretLocator, SecretOperation, SecretRecord, SecretType,
};
use crate::errors::{ConflictKind, Result, VaultlineError};
use crate::storage::{
    EnvironmentRepository, FolderRepository, SecretReferenceRepository, SecretRepository,
    SecretVersionRepository,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use std::sync::Arc;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppliedAction {
    Created,
    Updated,
    Deleted,
    Moved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedSecret {
    pub id: SecretId,
    pub key: String,
    pub secret_type: SecretType,
    pub version: i64,
    pub action: AppliedAction,
}

impl AppliedSecret {
    fn from_record(record: &SecretRecord, action: AppliedAction) -> Self {
        Self {
            id: record.id.clone(),
            key: record.key.clone(),
            secret_type: record.secret_type,
            version: record.version,
            action,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MoveReport {
    pub is_source_updated: bool,
    pub is_destination_updated: bool,
    pub moved: usize,
    pub rewritten_references: usize,
}

/// Everything one batch changed, in operation order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyResult {
    pub secrets: Vec<AppliedSecret>,
    pub moves: Vec<MoveReport>,
}

impl ApplyResult {
    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

enum MovePlan {
    /// Destination already holds the same value
    NoOp { source: SecretRecord },
    Overwrite { source: SecretRecord, destination: SecretRecord },
    Relocate { source: SecretRecord },
}

impl MovePlan {
    fn source(&self) -> &SecretRecord {
        match self {
            MovePlan::NoOp { source } => source,
            MovePlan::Overwrite { source, .. } => source,
            MovePlan::Relocate { source } => source,
        }
    }
}

#[derive(Clone)]
pub struct MutationApplier {
    codec: Arc<dyn EnvelopeCodec>,
}

impl MutationApplier {
    pub fn new(codec: Arc<dyn EnvelopeCodec>) -> Self {
        Self { codec }
    }

    /// Apply `operations` to `target` in order. The first failure aborts the batch;
    /// in a batch of more than one operation it is reported with its index.
    #[instrument(skip(self, conn, target, operations), fields(environment = %target.environment.slug, path = %target.folder.path, operations = operations.len()), name = "apply_mutations")]
    pub async fn apply(
        &self,
        conn: &mut SqliteConnection,
        target: &FolderContext,
        actor_id: Option<&str>,
        operations: &[SecretOperation],
    ) -> Result<ApplyResult> {
        let mut result = ApplyResult::default();

        for (index, operation) in operations.iter().enumerate() {
            let applied = match operation {
                SecretOperation::Create(op) => self.create(conn, target, actor_id, op).await,
                SecretOperation::Update(op) => self.update(conn, target, actor_id, op).await,
                SecretOperation::Delete(op) => self.delete(conn, target, op).await,
                SecretOperation::Move(op) => match self.move_secrets(conn, target, actor_id, op).await {
                    Ok((moved, report)) => {
                        result.moves.push(report);
                        Ok(moved)
                    }
                    Err(e) => Err(e),
                },
            };

            match applied {
                Ok(secrets) => result.secrets.extend(secrets),
                Err(e) if operations.len() > 1 => {
                    warn!(index, kind = operation.kind(), error = %e, "Batch operation failed");
                    return Err(VaultlineError::batch(index, e));
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            environment = %target.environment.slug,
            path = %target.folder.path,
            applied = result.secrets.len(),
            "Applied secret mutations"
        );
        Ok(result)
    }

    async fn create(
        &self,
        conn: &mut SqliteConnection,
        target: &FolderContext,
        actor_id: Option<&str>,
        op: &SealedCreate,
    ) -> Result<Vec<AppliedSecret>> {
        if SecretRepository::find_by_identity(conn, &target.folder.id, &op.identity).await?.is_some() {
            return Err(VaultlineError::conflict(
                ConflictKind::AlreadyExists,
                format!("Secret '{}' already exists at {}", op.identity, describe(target)),
            ));
        }

        let now = Utc::now();
        let record = SecretRecord {
            id: SecretId::new(),
            folder_id: target.folder.id.clone(),
            key: op.identity.key.clone(),
            key_blind_index: op.key_blind_index.clone(),
            secret_type: op.identity.secret_type,
            owner_actor_id: op.identity.owner_actor_id.clone(),
            version: 1,
            value: op.value.clone(),
            comment: op.comment.clone(),
            skip_multiline_encoding: op.skip_multiline_encoding,
            tags: op.tags.clone(),
            metadata: op.metadata.clone(),
            created_at: now,
            updated_at: now,
        };

        SecretRepository::insert(conn, &record).await?;
        SecretVersionRepository::record(conn, &record, actor_id).await?;
        SecretReferenceRepository::replace(conn, &record.id, &op.references).await?;

        Ok(vec![AppliedSecret::from_record(&record, AppliedAction::Created)])
    }

    async fn update(
        &self,
        conn: &mut SqliteConnection,
        target: &FolderContext,
        actor_id: Option<&str>,
        op: &SealedUpdate,
    ) -> Result<Vec<AppliedSecret>> {
        let current = SecretRepository::find_by_identity(conn, &target.folder.id, &op.identity)
            .await?
            .ok_or_else(|| VaultlineError::not_found("Secret", op.identity.to_string()))?;
        check_expected_version(&current, op.expected_version)?;

        let mut next = current.clone();
        if let Some(new_key) = op.new_key.as_deref().filter(|k| *k != current.key) {
            let mut renamed = op.identity.clone();
            renamed.key = new_key.to_string();
            if SecretRepository::find_by_identity(conn, &target.folder.id, &renamed).await?.is_some() {
                return Err(VaultlineError::conflict(
                    ConflictKind::AlreadyExists,
                    format!("Cannot rename '{}': '{}' already exists", current.key, new_key),
                ));
            }
            next.key = new_key.to_string();
            next.key_blind_index = op.new_key_blind_index.clone().ok_or_else(|| {
                VaultlineError::internal("Rename operation carries no blind index for the new key")
            })?;
        }
        if let Some(value) = &op.value {
            next.value = value.clone();
        }
        if let Some(comment) = &op.comment {
            next.comment = Some(comment.clone());
        }
        if let Some(skip) = op.skip_multiline_encoding {
            next.skip_multiline_encoding = skip;
        }
        if let Some(tags) = &op.tags {
            next.tags = tags.clone();
        }
        if let Some(metadata) = &op.metadata {
            next.metadata = metadata.clone();
        }

        self.commit_version(conn, &current, &mut next, actor_id).await?;
        if let Some(references) = &op.references {
            SecretReferenceRepository::replace(conn, &next.id, references).await?;
        }

        Ok(vec![AppliedSecret::from_record(&next, AppliedAction::Updated)])
    }

    async fn delete(
        &self,
        conn: &mut SqliteConnection,
        target: &FolderContext,
        op: &SealedDelete,
    ) -> Result<Vec<AppliedSecret>> {
        let current = SecretRepository::find_by_identity(conn, &target.folder.id, &op.identity)
            .await?
            .ok_or_else(|| VaultlineError::not_found("Secret", op.identity.to_string()))?;
        check_expected_version(&current, op.expected_version)?;

        if !SecretRepository::delete_if_version(conn, &current.id, current.version).await? {
            return Err(version_conflict(&current));
        }

        Ok(vec![AppliedSecret::from_record(&current, AppliedAction::Deleted)])
    }

    #[instrument(skip(self, conn, source, actor_id, op), fields(items = op.items.len(), destination = %op.destination_path), name = "move_secrets")]
    async fn move_secrets(
        &self,
        conn: &mut SqliteConnection,
        source: &FolderContext,
        actor_id: Option<&str>,
        op: &SealedMove,
    ) -> Result<(Vec<AppliedSecret>, MoveReport)> {
        if op.items.is_empty() {
            return Err(VaultlineError::validation_field("Move names no secrets", "secret_ids"));
        }

        let destination = self.destination(conn, source, &op.destination_environment_id, op).await?;
        let project_id = source.project_id().clone();

        let mut plans = Vec::with_capacity(op.items.len());
        let mut collisions = Vec::new();
        for item in &op.items {
            let secret = SecretRepository::get_by_id(conn, &item.secret_id)
                .await?
                .filter(|s| s.folder_id == source.folder.id)
                .ok_or_else(|| {
                    VaultlineError::not_found("Secret", format!("{} in {}", item.secret_id, describe(source)))
                })?;
            check_expected_version(&secret, item.expected_version)?;

            let plan =
                match SecretRepository::find_by_identity(conn, &destination.folder.id, &secret.identity()).await? {
                    None => MovePlan::Relocate { source: secret },
                    Some(existing) => {
                        let same = self.codec.open(&existing.value, &project_id)?
                            == self.codec.open(&secret.value, &project_id)?;
                        if same {
                            MovePlan::NoOp { source: secret }
                        } else {
                            collisions.push(secret.key.clone());
                            MovePlan::Overwrite { source: secret, destination: existing }
                        }
                    }
                };
            plans.push(plan);
        }

        if !collisions.is_empty() && !op.should_overwrite {
            return Err(VaultlineError::conflict(
                ConflictKind::KeyCollision,
                format!(
                    "Secrets with keys {} already exist in {}",
                    collisions.join(", "),
                    describe(&destination)
                ),
            ));
        }
        if plans.iter().all(|p| matches!(p, MovePlan::NoOp { .. })) {
            return Err(VaultlineError::conflict(
                ConflictKind::KeyCollision,
                format!("Every secret already exists in the destination {}", describe(&destination)),
            ));
        }

        let mut report = MoveReport::default();
        let mut applied = Vec::with_capacity(plans.len());
        let mut relocated = Vec::with_capacity(plans.len());

        for plan in plans {
            let moved = match &plan {
                MovePlan::NoOp { source: secret } => {
                    self.remove_source(conn, secret).await?;
                    None
                }
                MovePlan::Overwrite { source: secret, destination: existing } => {
                    let mut next = existing.clone();
                    next.value = secret.value.clone();
                    next.comment = secret.comment.clone();
                    next.skip_multiline_encoding = secret.skip_multiline_encoding;
                    next.tags = secret.tags.clone();
                    next.metadata = secret.metadata.clone();
                    self.commit_version(conn, existing, &mut next, actor_id).await?;

                    let edges = SecretReferenceRepository::list_for_secret(conn, &secret.id).await?;
                    SecretReferenceRepository::replace(conn, &next.id, &edges).await?;
                    self.remove_source(conn, secret).await?;
                    Some(next)
                }
                MovePlan::Relocate { source: secret } => {
                    let mut next = secret.clone();
                    next.folder_id = destination.folder.id.clone();
                    self.commit_version(conn, secret, &mut next, actor_id).await?;
                    Some(next)
                }
            };

            report.is_source_updated = true;
            if let Some(record) = moved {
                report.is_destination_updated = true;
                report.moved += 1;
                applied.push(AppliedSecret::from_record(&record, AppliedAction::Moved));
            }
            relocated.push(plan.source().key.clone());
        }

        for key in relocated {
            let from = SecretLocator::new(source.environment.slug.clone(), source.folder.path.clone(), key.clone());
            let to = SecretLocator::new(destination.environment.slug.clone(), destination.folder.path.clone(), key);
            report.rewritten_references +=
                self.rewrite_dependents(conn, source.project_id(), &source.folder.id, &from, &to, actor_id).await?;
        }

        info!(
            from = %describe(source),
            to = %describe(&destination),
            moved = report.moved,
            rewritten_references = report.rewritten_references,
            "Moved secrets"
        );
        Ok((applied, report))
    }

    async fn destination(
        &self,
        conn: &mut SqliteConnection,
        source: &FolderContext,
        environment_id: &EnvironmentId,
        op: &SealedMove,
    ) -> Result<FolderContext> {
        let environment = EnvironmentRepository::get_by_id(conn, environment_id)
            .await?
            .filter(|env| &env.project_id == source.project_id())
            .ok_or_else(|| VaultlineError::not_found("Environment", environment_id.as_str()))?;

        if environment.id == source.environment.id && op.destination_path == source.folder.path {
            return Err(VaultlineError::validation_field(
                "Cannot move secrets into the folder they are already in",
                "destination_path",
            ));
        }

        let folder: Folder = FolderService::ensure(conn, &environment, &op.destination_path).await?;
        Ok(FolderContext { environment, folder })
    }

    async fn remove_source(&self, conn: &mut SqliteConnection, secret: &SecretRecord) -> Result<()> {
        if !SecretRepository::delete_if_version(conn, &secret.id, secret.version).await? {
            return Err(version_conflict(secret));
        }
        Ok(())
    }

    /// Point every secret that references `from` at `to`. Returns how many were rewritten.
    async fn rewrite_dependents(
        &self,
        conn: &mut SqliteConnection,
        project_id: &ProjectId,
        source_folder: &FolderId,
        from: &SecretLocator,
        to: &SecretLocator,
        actor_id: Option<&str>,
    ) -> Result<usize> {
        let dependents = SecretReferenceRepository::find_dependents(conn, project_id, from, source_folder).await?;
        let mut rewritten = 0;

        for id in dependents {
            let Some(current) = SecretRepository::get_by_id(conn, &id).await? else {
                continue;
            };
            let folder = FolderRepository::get_by_id(conn, &current.folder_id)
                .await?
                .ok_or_else(|| VaultlineError::not_found("Folder", current.folder_id.as_str()))?;
            let environment = EnvironmentRepository::get_by_id(conn, &folder.environment_id)
                .await?
                .ok_or_else(|| VaultlineError::not_found("Environment", folder.environment_id.as_str()))?;

            let raw = self.codec.open_string(&current.value, project_id)?;
            let Some(updated) = rewrite_references(&raw, &environment.slug, &folder.path, from, to)? else {
                continue;
            };

            let mut next = current.clone();
            next.value = self.codec.seal_str(&updated, project_id)?;
            self.commit_version(conn, &current, &mut next, actor_id).await?;
            SecretReferenceRepository::replace(conn, &next.id, &extract_edges(&updated)?).await?;
            rewritten += 1;
        }

        Ok(rewritten)
    }

    /// Bump `next` one version past `current`, write it if `current` is still live,
    /// and append it to history.
    async fn commit_version(
        &self,
        conn: &mut SqliteConnection,
        current: &SecretRecord,
        next: &mut SecretRecord,
        actor_id: Option<&str>,
    ) -> Result<()> {
        next.version = current.version + 1;
        next.updated_at = Utc::now();

        if !SecretRepository::update_if_version(conn, next, current.version).await? {
            return Err(version_conflict(current));
        }
        SecretVersionRepository::record(conn, next, actor_id).await
    }
}

fn check_expected_version(current: &SecretRecord, expected: Option<i64>) -> Result<()> {
    match expected {
        Some(expected) if expected != current.version => Err(VaultlineError::conflict(
            ConflictKind::VersionConflict,
            format!(
                "Secret '{}' is at version {}, expected {}",
                current.key, current.version, expected
            ),
        )),
        _ => Ok(()),
    }
}

fn version_conflict(current: &SecretRecord) -> VaultlineError {
    VaultlineError::conflict(
        ConflictKind::VersionConflict,
        format!("Secret '{}' changed after version {} was read", current.key, current.version),
    )
}

fn describe(context: &FolderContext) -> String {
    format!("{}:{}", context.environment.slug, context.folder.path)
}
