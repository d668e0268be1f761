//! Approval gate
//!
//! Every shared mutation passes through the gate before it reaches the applier.
//! When an active policy covers the target, the sealed batch is captured in an
//! approval request instead of being applied, and is replayed verbatim once the
//! policy's threshold is met (or a bypasser merges it).
//!
//! A move also rewrites every secret that references a moved secret, so it is gated
//! by the policy of any folder holding such a dependent.
//!
//! Captured updates, deletes and moves are stamped with the version current at
//! capture time, so a request approved after someone else changed the same
//! secret fails with `StaleApproval` instead of overwriting that change.

use super::mutation_applier::{ApplyResult, MutationApplier};
use super::policy_cache::PolicyCache;
use crate::domain::{
    ActorContext, ApprovalPolicy, ApprovalRequest, ApprovalRequestHandle, ApprovalRequestId,
    CompiledPolicy, FolderContext, ProjectId, RequestStatus, ReviewStatus, SealedMove, SecretLocator,
    SecretOperation,
};
use crate::errors::{AuthErrorType, ConflictKind, Result, VaultlineError};
use crate::storage::{
    begin_transaction, commit_transaction, ApprovalPolicyRepository, ApprovalRequestRepository,
    DbPool, EnvironmentRepository, FolderRepository, NewApprovalRequest, SecretReferenceRepository,
    SecretRepository,
};
use serde::Serialize;
use sqlx::SqliteConnection;
use std::sync::Arc;
use tracing::{info, warn, Instrument};

/// What happened to a submitted batch.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MutationOutcome {
    Applied(ApplyResult),
    PendingApproval(ApprovalRequestHandle),
}

impl MutationOutcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, MutationOutcome::PendingApproval(_))
    }
}

#[derive(Clone)]
pub struct ApprovalGate {
    applier: MutationApplier,
    policies: Arc<PolicyCache>,
}

impl ApprovalGate {
    pub fn new(applier: MutationApplier, policies: Arc<PolicyCache>) -> Self {
        Self { applier, policies }
    }

    pub fn policies(&self) -> &PolicyCache {
        &self.policies
    }

    /// Apply `operations` to `target`, or capture them in an approval request when
    /// a policy covers the target. Runs inside the caller's transaction.
    pub async fn submit(
        &self,
        conn: &mut SqliteConnection,
        actor: &ActorContext,
        target: &FolderContext,
        mut operations: Vec<SecretOperation>,
    ) -> Result<MutationOutcome> {
        let Some(policy) = self.gating_policy(conn, target, &operations).await? else {
            let result = self.applier.apply(conn, target, Some(&actor.actor_id), &operations).await?;
            return Ok(MutationOutcome::Applied(result));
        };

        stamp_versions(conn, target, &mut operations).await?;

        let request = ApprovalRequestRepository::create(
            conn,
            &NewApprovalRequest {
                project_id: target.project_id().clone(),
                policy_id: policy.policy.id.clone(),
                folder_id: target.folder.id.clone(),
                environment_id: target.environment.id.clone(),
                secret_path: target.folder.path.clone(),
                committer_actor_id: actor.actor_id.clone(),
                operations,
            },
        )
        .await?;

        info!(
            request_id = %request.id,
            policy = %policy.policy.name,
            environment = %target.environment.slug,
            path = %target.folder.path,
            "Mutation captured for approval"
        );

        Ok(MutationOutcome::PendingApproval(ApprovalRequestHandle {
            request_id: request.id,
            policy_id: policy.policy.id,
            status: request.status,
            operation_count: request.operations.len(),
            required_approvals: policy.policy.approvals,
        }))
    }

    /// Policy gating `operations`, if any. A batch touching only the actor's own
    /// Personal secrets is never gated. Moves consult the destination first, then
    /// the folders of secrets whose references the move rewrites.
    async fn gating_policy(
        &self,
        conn: &mut SqliteConnection,
        target: &FolderContext,
        operations: &[SecretOperation],
    ) -> Result<Option<CompiledPolicy>> {
        if operations.iter().all(SecretOperation::is_personal) {
            return Ok(None);
        }

        for operation in operations {
            if let SecretOperation::Move(op) = operation {
                let destination = self
                    .policies
                    .find(conn, target.project_id(), &op.destination_environment_id, &op.destination_path)
                    .await?;
                if destination.is_some() {
                    return Ok(destination);
                }
                let dependents = self.dependent_policy(conn, target, op).await?;
                if dependents.is_some() {
                    return Ok(dependents);
                }
            }
        }

        self.policies.find(conn, target.project_id(), &target.environment.id, target.path()).await
    }

    /// First policy covering a folder that holds a secret referencing one of the moved secrets.
    async fn dependent_policy(
        &self,
        conn: &mut SqliteConnection,
        target: &FolderContext,
        op: &SealedMove,
    ) -> Result<Option<CompiledPolicy>> {
        for item in &op.items {
            let Some(secret) = SecretRepository::get_by_id(conn, &item.secret_id).await? else {
                continue;
            };
            let moved = SecretLocator::new(target.environment.slug.clone(), target.folder.path.clone(), secret.key);
            let dependents =
                SecretReferenceRepository::find_dependents(conn, target.project_id(), &moved, &target.folder.id)
                    .await?;

            for id in dependents {
                let Some(dependent) = SecretRepository::get_by_id(conn, &id).await? else {
                    continue;
                };
                if dependent.folder_id == target.folder.id {
                    continue;
                }
                let Some(folder) = FolderRepository::get_by_id(conn, &dependent.folder_id).await? else {
                    continue;
                };
                let policy =
                    self.policies.find(conn, target.project_id(), &folder.environment_id, &folder.path).await?;
                if policy.is_some() {
                    return Ok(policy);
                }
            }
        }
        Ok(None)
    }

    /// Record an approval. Reaching the threshold moves the request to
    /// `Approved` and applies it right away.
    pub async fn approve(
        &self,
        pool: &DbPool,
        project_id: &ProjectId,
        actor: &ActorContext,
        request_id: &ApprovalRequestId,
    ) -> Result<ApprovalRequest> {
        let span = crate::engine_span!("approve_request", request_id = %request_id, actor_id = %actor.actor_id);
        async move {
            let mut tx = begin_transaction(pool).await?;
            let request = load_request(&mut tx, project_id, request_id).await?;
            ensure_open(&request)?;
            let policy = load_policy(&mut tx, &request).await?;

            if !policy.may_approve(&actor.actor_id) {
                return Err(VaultlineError::auth(
                    format!("Actor '{}' is not an approver of policy '{}'", actor.actor_id, policy.name),
                    AuthErrorType::InsufficientPermissions,
                ));
            }
            if actor.actor_id == request.committer_actor_id && !policy.allow_self_approval {
                return Err(VaultlineError::auth(
                    "Committers cannot approve their own requests under this policy",
                    AuthErrorType::SelfApprovalNotAllowed,
                ));
            }

            ApprovalRequestRepository::upsert_review(&mut tx, request_id, &actor.actor_id, ReviewStatus::Approved)
                .await?;
            let request = load_request(&mut tx, project_id, request_id).await?;
            let approvals = request.counted_approvals(&policy);
            let threshold_met = approvals >= policy.approvals as usize;
            if threshold_met
                && !ApprovalRequestRepository::transition(&mut tx, request_id, RequestStatus::Open, RequestStatus::Approved)
                    .await?
            {
                return Err(closed(request_id));
            }
            commit_transaction(tx).await?;

            info!(approvals, required = policy.approvals, threshold_met, "Recorded approval");
            if threshold_met {
                self.apply_approved(pool, project_id, request_id).await
            } else {
                Ok(request)
            }
        }
        .instrument(span)
        .await
    }

    /// Close an open request. The committer or anyone allowed to approve may reject.
    pub async fn reject(
        &self,
        pool: &DbPool,
        project_id: &ProjectId,
        actor: &ActorContext,
        request_id: &ApprovalRequestId,
    ) -> Result<ApprovalRequest> {
        let span = crate::engine_span!("reject_request", request_id = %request_id, actor_id = %actor.actor_id);
        async move {
            let mut tx = begin_transaction(pool).await?;
            let request = load_request(&mut tx, project_id, request_id).await?;
            ensure_open(&request)?;
            let policy = load_policy(&mut tx, &request).await?;

            if actor.actor_id != request.committer_actor_id && !policy.may_approve(&actor.actor_id) {
                return Err(VaultlineError::auth(
                    format!("Actor '{}' may not reject this request", actor.actor_id),
                    AuthErrorType::InsufficientPermissions,
                ));
            }

            ApprovalRequestRepository::upsert_review(&mut tx, request_id, &actor.actor_id, ReviewStatus::Rejected)
                .await?;
            if !ApprovalRequestRepository::transition(&mut tx, request_id, RequestStatus::Open, RequestStatus::Rejected)
                .await?
            {
                return Err(closed(request_id));
            }
            let request = load_request(&mut tx, project_id, request_id).await?;
            commit_transaction(tx).await?;

            info!("Rejected approval request");
            Ok(request)
        }
        .instrument(span)
        .await
    }

    /// Apply an open request without the required approvals. Only a Soft policy
    /// allows this, and only for its bypassers.
    pub async fn bypass(
        &self,
        pool: &DbPool,
        project_id: &ProjectId,
        actor: &ActorContext,
        request_id: &ApprovalRequestId,
        reason: &str,
    ) -> Result<ApprovalRequest> {
        let span = crate::engine_span!("bypass_request", request_id = %request_id, actor_id = %actor.actor_id);
        async move {
            if reason.trim().is_empty() {
                return Err(VaultlineError::validation_field("A bypass needs a reason", "reason"));
            }

            let mut tx = begin_transaction(pool).await?;
            let request = load_request(&mut tx, project_id, request_id).await?;
            ensure_open(&request)?;
            let policy = load_policy(&mut tx, &request).await?;

            if !policy.may_bypass(&actor.actor_id) {
                return Err(VaultlineError::auth(
                    format!("Actor '{}' may not bypass policy '{}'", actor.actor_id, policy.name),
                    AuthErrorType::BypassNotAllowed,
                ));
            }

            let target = request_target(&mut tx, &request).await?;
            let applied = self
                .applier
                .apply(&mut tx, &target, Some(&request.committer_actor_id), &request.operations)
                .await;
            if let Err(e) = applied {
                drop(tx);
                return Err(record_failure(pool, request_id, e).await);
            }

            if !ApprovalRequestRepository::transition(&mut tx, request_id, RequestStatus::Open, RequestStatus::Applied)
                .await?
            {
                return Err(closed(request_id));
            }
            ApprovalRequestRepository::record_bypass(&mut tx, request_id, reason).await?;
            let request = load_request(&mut tx, project_id, request_id).await?;
            commit_transaction(tx).await?;

            warn!(reason, "Approval request merged by bypass");
            Ok(request)
        }
        .instrument(span)
        .await
    }

    /// Re-apply an approved request whose earlier application failed.
    pub async fn retry(
        &self,
        pool: &DbPool,
        project_id: &ProjectId,
        request_id: &ApprovalRequestId,
    ) -> Result<ApprovalRequest> {
        let span = crate::engine_span!("retry_request", request_id = %request_id);
        async move {
            let mut conn = pool.acquire().await?;
            let request = load_request(&mut conn, project_id, request_id).await?;
            drop(conn);

            if request.status != RequestStatus::Approved {
                return Err(VaultlineError::conflict(
                    ConflictKind::RequestClosed,
                    format!("Request '{}' is {} and cannot be retried", request_id, request.status),
                ));
            }
            self.apply_approved(pool, project_id, request_id).await
        }
        .instrument(span)
        .await
    }

    async fn apply_approved(
        &self,
        pool: &DbPool,
        project_id: &ProjectId,
        request_id: &ApprovalRequestId,
    ) -> Result<ApprovalRequest> {
        let mut tx = begin_transaction(pool).await?;
        let request = load_request(&mut tx, project_id, request_id).await?;

        let applied = match request_target(&mut tx, &request).await {
            Ok(target) => {
                self.applier
                    .apply(&mut tx, &target, Some(&request.committer_actor_id), &request.operations)
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = applied {
            drop(tx);
            return Err(record_failure(pool, request_id, e).await);
        }

        if !ApprovalRequestRepository::transition(&mut tx, request_id, RequestStatus::Approved, RequestStatus::Applied)
            .await?
        {
            return Err(closed(request_id));
        }
        let request = load_request(&mut tx, project_id, request_id).await?;
        commit_transaction(tx).await?;

        info!(request_id = %request_id, operations = request.operations.len(), "Applied approval request");
        Ok(request)
    }
}

/// Fill in the current version of everything an update, delete or move touches.
async fn stamp_versions(
    conn: &mut SqliteConnection,
    target: &FolderContext,
    operations: &mut [SecretOperation],
) -> Result<()> {
    for operation in operations.iter_mut() {
        match operation {
            SecretOperation::Update(op) if op.expected_version.is_none() => {
                op.expected_version = SecretRepository::find_by_identity(conn, &target.folder.id, &op.identity)
                    .await?
                    .map(|secret| secret.version);
            }
            SecretOperation::Delete(op) if op.expected_version.is_none() => {
                op.expected_version = SecretRepository::find_by_identity(conn, &target.folder.id, &op.identity)
                    .await?
                    .map(|secret| secret.version);
            }
            SecretOperation::Move(op) => {
                for item in op.items.iter_mut().filter(|item| item.expected_version.is_none()) {
                    item.expected_version =
                        SecretRepository::get_by_id(conn, &item.secret_id).await?.map(|secret| secret.version);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Store the failure on the request and translate conflicts into `StaleApproval`.
async fn record_failure(pool: &DbPool, request_id: &ApprovalRequestId, error: VaultlineError) -> VaultlineError {
    warn!(request_id = %request_id, error = %error, "Failed to apply approval request");

    let recorded = async {
        let mut conn = pool.acquire().await?;
        ApprovalRequestRepository::record_apply_error(&mut conn, request_id, &error.to_string()).await
    }
    .await;
    if let Err(e) = recorded {
        warn!(request_id = %request_id, error = %e, "Failed to record apply error");
    }

    match error.root_cause() {
        VaultlineError::Conflict { .. } | VaultlineError::NotFound { .. } => VaultlineError::conflict(
            ConflictKind::StaleApproval,
            format!("Request '{}' no longer applies to the current secrets: {}", request_id, error),
        ),
        _ => error,
    }
}

async fn load_request(
    conn: &mut SqliteConnection,
    project_id: &ProjectId,
    request_id: &ApprovalRequestId,
) -> Result<ApprovalRequest> {
    ApprovalRequestRepository::get_by_id(conn, request_id)
        .await?
        .filter(|request| &request.project_id == project_id)
        .ok_or_else(|| VaultlineError::not_found("Approval request", request_id.as_str()))
}

async fn load_policy(conn: &mut SqliteConnection, request: &ApprovalRequest) -> Result<ApprovalPolicy> {
    let policy = ApprovalPolicyRepository::get_by_id(conn, &request.policy_id)
        .await?
        .ok_or_else(|| VaultlineError::not_found("Approval policy", request.policy_id.as_str()))?;
    if policy.deleted_at.is_some() {
        return Err(VaultlineError::validation_field(
            "The policy associated with this approval request has been deleted",
            "policy_id",
        ));
    }
    Ok(policy)
}

async fn request_target(conn: &mut SqliteConnection, request: &ApprovalRequest) -> Result<FolderContext> {
    let environment = EnvironmentRepository::get_by_id(conn, &request.environment_id)
        .await?
        .ok_or_else(|| VaultlineError::not_found("Environment", request.environment_id.as_str()))?;
    let folder = FolderRepository::get_by_id(conn, &request.folder_id)
        .await?
        .ok_or_else(|| VaultlineError::not_found("Folder", request.secret_path.to_string()))?;
    Ok(FolderContext { environment, folder })
}

fn ensure_open(request: &ApprovalRequest) -> Result<()> {
    if request.status == RequestStatus::Open {
        Ok(())
    } else {
        Err(VaultlineError::conflict(
            ConflictKind::RequestClosed,
            format!("Request '{}' is already {}", request.id, request.status),
        ))
    }
}

fn closed(request_id: &ApprovalRequestId) -> VaultlineError {
    VaultlineError::conflict(ConflictKind::RequestClosed, format!("Request '{}' changed status concurrently", request_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::reference::extract_edges;
    use crate::domain::{EnforcementLevel, SealedCreate, SealedUpdate, SecretIdentity, SecretPath};
    use crate::services::folder_service::FolderService;
    use crate::services::secret_encryption::{EnvelopeCodec, SecretEncryption, SecretEncryptionConfig};
    use crate::storage::test_helpers::TestDatabase;
    use crate::storage::CreateApprovalPolicyRequest;
    use std::time::Duration;

    struct Fixture {
        db: TestDatabase,
        codec: Arc<dyn EnvelopeCodec>,
        gate: ApprovalGate,
        ctx: FolderContext,
    }

    async fn fixture(name: &str, policy: Option<CreateApprovalPolicyRequest>) -> Fixture {
        let db = TestDatabase::new(name).await;
        let codec: Arc<dyn EnvelopeCodec> =
            Arc::new(SecretEncryption::new(&SecretEncryptionConfig::for_testing()).unwrap());
        let gate = ApprovalGate::new(
            MutationApplier::new(codec.clone()),
            Arc::new(PolicyCache::new(Duration::from_secs(60))),
        );

        let mut conn = db.pool.acquire().await.unwrap();
        let environment = db.environment("prod").clone();
        let folder = FolderService::ensure(&mut conn, &environment, &SecretPath::parse("/app").unwrap())
            .await
            .unwrap();
        if let Some(policy) = policy {
            ApprovalPolicyRepository::create(&mut conn, &db.project.id, &environment.id, &policy)
                .await
                .unwrap();
        }
        drop(conn);

        Fixture { db, codec, gate, ctx: FolderContext { environment, folder } }
    }

    fn policy(approvals: u32, approvers: &[&str], level: EnforcementLevel) -> CreateApprovalPolicyRequest {
        CreateApprovalPolicyRequest {
            name: "prod app".into(),
            secret_path: "/app".into(),
            approvals,
            approvers: approvers.iter().map(|a| a.to_string()).collect(),
            bypassers: vec![],
            enforcement_level: level,
            allow_self_approval: false,
        }
    }

    fn create(f: &Fixture, key: &str, value: &str, identity: SecretIdentity) -> SecretOperation {
        let project = f.ctx.project_id();
        SecretOperation::Create(SealedCreate {
            identity,
            key_blind_index: f.codec.blind_index(key, project).unwrap(),
            value: f.codec.seal_str(value, project).unwrap(),
            comment: None,
            skip_multiline_encoding: false,
            tags: vec![],
            metadata: vec![],
            references: extract_edges(value).unwrap(),
        })
    }

    fn update(f: &Fixture, key: &str, value: &str) -> SecretOperation {
        SecretOperation::Update(SealedUpdate {
            identity: SecretIdentity::shared(key),
            expected_version: None,
            new_key: None,
            new_key_blind_index: None,
            value: Some(f.codec.seal_str(value, f.ctx.project_id()).unwrap()),
            comment: None,
            skip_multiline_encoding: None,
            tags: None,
            metadata: None,
            references: Some(vec![]),
        })
    }

    async fn submit(f: &Fixture, actor: &str, ops: Vec<SecretOperation>) -> MutationOutcome {
        let mut tx = f.db.pool.begin().await.unwrap();
        let outcome = f.gate.submit(&mut tx, &ActorContext::user(actor, "org"), &f.ctx, ops).await.unwrap();
        tx.commit().await.unwrap();
        outcome
    }

    async fn stored(f: &Fixture, key: &str) -> Option<String> {
        let mut conn = f.db.pool.acquire().await.unwrap();
        SecretRepository::find_by_identity(&mut conn, &f.ctx.folder.id, &SecretIdentity::shared(key))
            .await
            .unwrap()
            .map(|s| f.codec.open_string(&s.value, f.ctx.project_id()).unwrap())
    }

    fn request_id(outcome: MutationOutcome) -> ApprovalRequestId {
        match outcome {
            MutationOutcome::PendingApproval(handle) => handle.request_id,
            other => panic!("expected a pending request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ungated_target_applies_directly() {
        let f = fixture("gate_direct", None).await;
        let outcome = submit(&f, "alice", vec![create(&f, "K", "v", SecretIdentity::shared("K"))]).await;
        assert!(!outcome.is_pending());
        assert_eq!(stored(&f, "K").await.as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_personal_only_batch_is_not_gated() {
        let f = fixture("gate_personal", Some(policy(1, &[], EnforcementLevel::Hard))).await;
        let outcome =
            submit(&f, "alice", vec![create(&f, "K", "mine", SecretIdentity::personal("K", "alice"))]).await;
        assert!(!outcome.is_pending());
    }

    #[tokio::test]
    async fn test_two_approvals_then_applied() {
        let f = fixture("gate_threshold", Some(policy(2, &[], EnforcementLevel::Hard))).await;
        let project = f.db.project.id.clone();
        let id = request_id(submit(&f, "alice", vec![create(&f, "K", "v", SecretIdentity::shared("K"))]).await);
        assert_eq!(stored(&f, "K").await, None);

        let self_approval =
            f.gate.approve(&f.db.pool, &project, &ActorContext::user("alice", "org"), &id).await.unwrap_err();
        assert!(matches!(
            self_approval,
            VaultlineError::Auth { error_type: AuthErrorType::SelfApprovalNotAllowed, .. }
        ));

        let first = f.gate.approve(&f.db.pool, &project, &ActorContext::user("bob", "org"), &id).await.unwrap();
        assert_eq!(first.status, RequestStatus::Open);
        let second = f.gate.approve(&f.db.pool, &project, &ActorContext::user("carol", "org"), &id).await.unwrap();
        assert_eq!(second.status, RequestStatus::Applied);
        assert_eq!(stored(&f, "K").await.as_deref(), Some("v"));

        let late = f.gate.approve(&f.db.pool, &project, &ActorContext::user("dave", "org"), &id).await.unwrap_err();
        assert_eq!(late.conflict_kind(), Some(ConflictKind::RequestClosed));
    }

    #[tokio::test]
    async fn test_only_listed_approvers_count() {
        let f = fixture("gate_approvers", Some(policy(1, &["bob"], EnforcementLevel::Hard))).await;
        let project = f.db.project.id.clone();
        let id = request_id(submit(&f, "alice", vec![create(&f, "K", "v", SecretIdentity::shared("K"))]).await);

        let err = f.gate.approve(&f.db.pool, &project, &ActorContext::user("eve", "org"), &id).await.unwrap_err();
        assert!(matches!(err, VaultlineError::Auth { error_type: AuthErrorType::InsufficientPermissions, .. }));

        let request = f.gate.approve(&f.db.pool, &project, &ActorContext::user("bob", "org"), &id).await.unwrap();
        assert_eq!(request.status, RequestStatus::Applied);
    }

    #[tokio::test]
    async fn test_rejected_request_is_terminal() {
        let f = fixture("gate_reject", Some(policy(1, &["bob"], EnforcementLevel::Hard))).await;
        let project = f.db.project.id.clone();
        let id = request_id(submit(&f, "alice", vec![create(&f, "K", "v", SecretIdentity::shared("K"))]).await);

        let outsider = f.gate.reject(&f.db.pool, &project, &ActorContext::user("eve", "org"), &id).await;
        assert!(outsider.is_err());

        let request = f.gate.reject(&f.db.pool, &project, &ActorContext::user("alice", "org"), &id).await.unwrap();
        assert_eq!(request.status, RequestStatus::Rejected);
        let err = f.gate.approve(&f.db.pool, &project, &ActorContext::user("bob", "org"), &id).await.unwrap_err();
        assert_eq!(err.conflict_kind(), Some(ConflictKind::RequestClosed));
        assert_eq!(stored(&f, "K").await, None);
    }

    #[tokio::test]
    async fn test_stale_approval_leaves_request_approved() {
        let f = fixture("gate_stale", None).await;
        let project = f.db.project.id.clone();
        submit(&f, "alice", vec![create(&f, "K", "v1", SecretIdentity::shared("K"))]).await;

        let mut conn = f.db.pool.acquire().await.unwrap();
        ApprovalPolicyRepository::create(&mut conn, &project, &f.ctx.environment.id, &policy(1, &[], EnforcementLevel::Hard))
            .await
            .unwrap();
        drop(conn);
        f.gate.policies().invalidate_all().await;

        let first = request_id(submit(&f, "alice", vec![update(&f, "K", "from-first")]).await);
        let second = request_id(submit(&f, "alice", vec![update(&f, "K", "from-second")]).await);

        let applied = f.gate.approve(&f.db.pool, &project, &ActorContext::user("bob", "org"), &first).await.unwrap();
        assert_eq!(applied.status, RequestStatus::Applied);

        let err = f.gate.approve(&f.db.pool, &project, &ActorContext::user("bob", "org"), &second).await.unwrap_err();
        assert_eq!(err.conflict_kind(), Some(ConflictKind::StaleApproval));
        assert_eq!(stored(&f, "K").await.as_deref(), Some("from-first"));

        let mut conn = f.db.pool.acquire().await.unwrap();
        let request = load_request(&mut conn, &project, &second).await.unwrap();
        assert_eq!(request.status, RequestStatus::Approved);
        assert!(request.last_apply_error.is_some());
        drop(conn);

        let retry = f.gate.retry(&f.db.pool, &project, &second).await.unwrap_err();
        assert_eq!(retry.conflict_kind(), Some(ConflictKind::StaleApproval));
    }

    #[tokio::test]
    async fn test_bypass_requires_soft_policy() {
        let hard = fixture("gate_bypass_hard", Some(policy(2, &[], EnforcementLevel::Hard))).await;
        let project = hard.db.project.id.clone();
        let id = request_id(submit(&hard, "alice", vec![create(&hard, "K", "v", SecretIdentity::shared("K"))]).await);
        let err = hard
            .gate
            .bypass(&hard.db.pool, &project, &ActorContext::user("bob", "org"), &id, "hotfix")
            .await
            .unwrap_err();
        assert!(matches!(err, VaultlineError::Auth { error_type: AuthErrorType::BypassNotAllowed, .. }));

        let soft = fixture("gate_bypass_soft", Some(policy(2, &[], EnforcementLevel::Soft))).await;
        let project = soft.db.project.id.clone();
        let id = request_id(submit(&soft, "alice", vec![create(&soft, "K", "v", SecretIdentity::shared("K"))]).await);
        let request = soft
            .gate
            .bypass(&soft.db.pool, &project, &ActorContext::user("bob", "org"), &id, "hotfix")
            .await
            .unwrap();
        assert_eq!(request.status, RequestStatus::Applied);
        assert_eq!(request.bypass_reason.as_deref(), Some("hotfix"));
        assert_eq!(stored(&soft, "K").await.as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_deleted_policy_refuses_reviews() {
        let f = fixture("gate_deleted_policy", Some(policy(1, &[], EnforcementLevel::Hard))).await;
        let project = f.db.project.id.clone();
        let outcome = submit(&f, "alice", vec![create(&f, "K", "v", SecretIdentity::shared("K"))]).await;
        let MutationOutcome::PendingApproval(handle) = outcome else { panic!("expected pending") };

        let mut conn = f.db.pool.acquire().await.unwrap();
        ApprovalPolicyRepository::soft_delete(&mut conn, &handle.policy_id).await.unwrap();
        drop(conn);

        let err = f
            .gate
            .approve(&f.db.pool, &project, &ActorContext::user("bob", "org"), &handle.request_id)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultlineError::Validation { .. }));
    }
}
