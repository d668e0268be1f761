//! Integration tests for the approval workflow driven through the engine.

mod common;

use common::{create, path, seed, user, TestEngine};
use vaultline::domain::{
    ApprovalRequestHandle, EnforcementLevel, MoveSecrets, RequestStatus, SecretMutation, UpdateSecret,
};
use vaultline::errors::{AuthErrorType, ConflictKind};
use vaultline::services::{MutationOutcome, SecretReadOptions};
use vaultline::storage::{ApprovalRequestFilter, CreateApprovalPolicyRequest, UpdateApprovalPolicyRequest};
use vaultline::VaultlineError;

fn policy(path: &str, approvals: u32, level: EnforcementLevel) -> CreateApprovalPolicyRequest {
    CreateApprovalPolicyRequest {
        name: format!("guard {}", path),
        secret_path: path.to_string(),
        approvals,
        approvers: vec![],
        bypassers: vec![],
        enforcement_level: level,
        allow_self_approval: false,
    }
}

fn pending(outcome: MutationOutcome) -> ApprovalRequestHandle {
    match outcome {
        MutationOutcome::PendingApproval(handle) => handle,
        MutationOutcome::Applied(_) => panic!("expected the mutation to be gated"),
    }
}

async fn value(t: &TestEngine, env: &str, path: &str, key: &str) -> Option<String> {
    t.engine
        .get_secret_by_key(&user("reader"), &t.target(env, path), key, None, SecretReadOptions::default())
        .await
        .ok()
        .map(|v| v.value)
}

#[tokio::test]
async fn test_gated_write_applies_after_threshold() {
    let t = TestEngine::new("approval_threshold").await;
    let app = t.target("prod", "/app");
    seed(&t.engine, &app, &[("K", "v1")]).await;
    t.engine.create_policy(t.project_id(), "prod", &policy("/app", 2, EnforcementLevel::Hard)).await.unwrap();

    let handle = pending(
        t.engine
            .mutate(&user("alice"), &app, vec![SecretMutation::Update(UpdateSecret::value("K", "v2"))])
            .await
            .unwrap(),
    );
    assert_eq!(handle.required_approvals, 2);
    assert_eq!(value(&t, "prod", "/app", "K").await.as_deref(), Some("v1"));

    let err = t.engine.approve_request(&user("alice"), t.project_id(), &handle.request_id).await.unwrap_err();
    assert!(matches!(
        err,
        VaultlineError::Auth { error_type: AuthErrorType::SelfApprovalNotAllowed, .. }
    ));

    let after_one = t.engine.approve_request(&user("bob"), t.project_id(), &handle.request_id).await.unwrap();
    assert_eq!(after_one.status, RequestStatus::Open);

    let done = t.engine.approve_request(&user("carol"), t.project_id(), &handle.request_id).await.unwrap();
    assert_eq!(done.status, RequestStatus::Applied);
    assert!(done.applied_at.is_some());
    assert_eq!(value(&t, "prod", "/app", "K").await.as_deref(), Some("v2"));

    let err = t.engine.approve_request(&user("dave"), t.project_id(), &handle.request_id).await.unwrap_err();
    assert_eq!(err.conflict_kind(), Some(ConflictKind::RequestClosed));
}

#[tokio::test]
async fn test_gated_batch_is_one_request_applied_whole() {
    let t = TestEngine::new("approval_batch").await;
    let app = t.target("prod", "/app");
    t.engine.create_policy(t.project_id(), "prod", &policy("/app", 1, EnforcementLevel::Hard)).await.unwrap();

    let keys = ["K1", "K2", "K3", "K4", "K5"];
    let batch = keys.iter().map(|k| create(k, &format!("{}-value", k))).collect();
    let handle = pending(t.engine.mutate(&user("alice"), &app, batch).await.unwrap());
    assert_eq!(handle.operation_count, 5);

    let requests = t.engine.list_requests(t.project_id(), &ApprovalRequestFilter::default()).await.unwrap();
    assert_eq!(requests.len(), 1);
    for key in keys {
        assert_eq!(value(&t, "prod", "/app", key).await, None);
    }

    let done = t.engine.approve_request(&user("bob"), t.project_id(), &handle.request_id).await.unwrap();
    assert_eq!(done.status, RequestStatus::Applied);
    for key in keys {
        assert_eq!(value(&t, "prod", "/app", key).await, Some(format!("{}-value", key)));
    }
}

#[tokio::test]
async fn test_move_is_gated_by_folders_whose_references_it_rewrites() {
    let t = TestEngine::new("approval_move_dependents").await;
    let legacy = t.target("prod", "/legacy");
    let app = t.target("prod", "/app");
    seed(&t.engine, &legacy, &[("HOST", "db-1")]).await;
    seed(&t.engine, &app, &[("DSN", "pg://${prod.legacy.HOST}")]).await;
    t.engine.create_policy(t.project_id(), "prod", &policy("/app", 1, EnforcementLevel::Hard)).await.unwrap();

    let host = t
        .engine
        .get_secret_by_key(&user("alice"), &legacy, "HOST", None, SecretReadOptions::default())
        .await
        .unwrap();
    let handle = pending(
        t.engine
            .mutate(
                &user("alice"),
                &legacy,
                vec![SecretMutation::Move(MoveSecrets {
                    secret_ids: vec![host.id.clone()],
                    destination_environment: "prod".into(),
                    destination_path: path("/db"),
                    should_overwrite: false,
                })],
            )
            .await
            .unwrap(),
    );

    // Nothing moves and nothing in the gated folder is rewritten until approval.
    let dsn = t.engine.get_secret_by_key(&user("alice"), &app, "DSN", None, SecretReadOptions::default()).await.unwrap();
    assert_eq!((dsn.value.as_str(), dsn.version), ("pg://${prod.legacy.HOST}", 1));
    assert_eq!(value(&t, "prod", "/legacy", "HOST").await.as_deref(), Some("db-1"));

    t.engine.approve_request(&user("bob"), t.project_id(), &handle.request_id).await.unwrap();
    let dsn = t.engine.get_secret_by_key(&user("alice"), &app, "DSN", None, SecretReadOptions::default()).await.unwrap();
    assert_eq!((dsn.value.as_str(), dsn.version), ("pg://${prod.db.HOST}", 2));
    assert_eq!(value(&t, "prod", "/db", "HOST").await.as_deref(), Some("db-1"));
}

#[tokio::test]
async fn test_glob_policy_gates_creates_in_new_folders() {
    let t = TestEngine::new("approval_glob").await;
    t.engine.create_policy(t.project_id(), "prod", &policy("/services/*", 1, EnforcementLevel::Hard)).await.unwrap();

    let handle = pending(
        t.engine.mutate(&user("alice"), &t.target("prod", "/services/api"), vec![create("TOKEN", "t")]).await.unwrap(),
    );
    assert_eq!(value(&t, "prod", "/services/api", "TOKEN").await, None);

    // Paths outside the glob are not gated.
    let direct = t.engine.mutate(&user("alice"), &t.target("prod", "/other"), vec![create("TOKEN", "t")]).await.unwrap();
    assert!(!direct.is_pending());

    t.engine.approve_request(&user("bob"), t.project_id(), &handle.request_id).await.unwrap();
    assert_eq!(value(&t, "prod", "/services/api", "TOKEN").await.as_deref(), Some("t"));
}

#[tokio::test]
async fn test_rejection_is_final() {
    let t = TestEngine::new("approval_reject").await;
    let app = t.target("prod", "/app");
    t.engine.create_policy(t.project_id(), "prod", &policy("/app", 1, EnforcementLevel::Hard)).await.unwrap();
    let handle = pending(t.engine.mutate(&user("alice"), &app, vec![create("K", "v")]).await.unwrap());

    let rejected = t.engine.reject_request(&user("bob"), t.project_id(), &handle.request_id).await.unwrap();
    assert_eq!(rejected.status, RequestStatus::Rejected);

    let err = t.engine.approve_request(&user("carol"), t.project_id(), &handle.request_id).await.unwrap_err();
    assert_eq!(err.conflict_kind(), Some(ConflictKind::RequestClosed));
    assert_eq!(value(&t, "prod", "/app", "K").await, None);
}

#[tokio::test]
async fn test_stale_approval_is_recorded_and_retryable_state_kept() {
    let t = TestEngine::new("approval_stale").await;
    let app = t.target("prod", "/app");
    seed(&t.engine, &app, &[("K", "v1")]).await;
    let created = t
        .engine
        .create_policy(t.project_id(), "prod", &policy("/app", 1, EnforcementLevel::Hard))
        .await
        .unwrap();

    let handle = pending(
        t.engine
            .mutate(&user("alice"), &app, vec![SecretMutation::Update(UpdateSecret::value("K", "from-request"))])
            .await
            .unwrap(),
    );

    // Change the secret behind the request's back while the policy is off.
    t.engine
        .update_policy(t.project_id(), &created.id, &UpdateApprovalPolicyRequest { enabled: Some(false), ..Default::default() })
        .await
        .unwrap();
    t.engine
        .mutate(&user("bob"), &app, vec![SecretMutation::Update(UpdateSecret::value("K", "direct"))])
        .await
        .unwrap();
    t.engine
        .update_policy(t.project_id(), &created.id, &UpdateApprovalPolicyRequest { enabled: Some(true), ..Default::default() })
        .await
        .unwrap();

    let err = t.engine.approve_request(&user("carol"), t.project_id(), &handle.request_id).await.unwrap_err();
    assert_eq!(err.conflict_kind(), Some(ConflictKind::StaleApproval));
    assert_eq!(value(&t, "prod", "/app", "K").await.as_deref(), Some("direct"));

    let request = t.engine.get_request(t.project_id(), &handle.request_id).await.unwrap();
    assert_eq!(request.status, RequestStatus::Approved);
    assert!(request.last_apply_error.is_some());

    let err = t.engine.retry_request(t.project_id(), &handle.request_id).await.unwrap_err();
    assert_eq!(err.conflict_kind(), Some(ConflictKind::StaleApproval));
}

#[tokio::test]
async fn test_soft_policy_bypass() {
    let t = TestEngine::new("approval_bypass").await;
    let app = t.target("prod", "/app");
    let mut soft = policy("/app", 3, EnforcementLevel::Soft);
    soft.bypassers = vec!["oncall".to_string()];
    t.engine.create_policy(t.project_id(), "prod", &soft).await.unwrap();

    let handle = pending(t.engine.mutate(&user("alice"), &app, vec![create("HOTFIX", "1")]).await.unwrap());

    let err = t
        .engine
        .bypass_request(&user("alice"), t.project_id(), &handle.request_id, "urgent")
        .await
        .unwrap_err();
    assert!(matches!(err, VaultlineError::Auth { error_type: AuthErrorType::BypassNotAllowed, .. }));

    assert!(t.engine.bypass_request(&user("oncall"), t.project_id(), &handle.request_id, "  ").await.is_err());

    let merged = t
        .engine
        .bypass_request(&user("oncall"), t.project_id(), &handle.request_id, "incident 42")
        .await
        .unwrap();
    assert_eq!(merged.status, RequestStatus::Applied);
    assert_eq!(merged.bypass_reason.as_deref(), Some("incident 42"));
    assert_eq!(value(&t, "prod", "/app", "HOTFIX").await.as_deref(), Some("1"));
}

#[tokio::test]
async fn test_request_queries_and_policy_lifecycle() {
    let t = TestEngine::new("approval_queries").await;
    let created = t
        .engine
        .create_policy(t.project_id(), "prod", &policy("/app", 1, EnforcementLevel::Hard))
        .await
        .unwrap();
    let app = t.target("prod", "/app");

    let first = pending(t.engine.mutate(&user("alice"), &app, vec![create("A", "1")]).await.unwrap());
    pending(t.engine.mutate(&user("bob"), &app, vec![create("B", "2")]).await.unwrap());
    t.engine.reject_request(&user("alice"), t.project_id(), &first.request_id).await.unwrap();

    let counts = t.engine.count_requests(t.project_id(), Some("prod")).await.unwrap();
    assert_eq!((counts.open, counts.rejected), (1, 1));

    let open = t
        .engine
        .list_requests(t.project_id(), &ApprovalRequestFilter { status: Some(RequestStatus::Open), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].committer_actor_id, "bob");

    assert!(t
        .engine
        .create_policy(t.project_id(), "prod", &policy("relative/path", 1, EnforcementLevel::Hard))
        .await
        .is_err());

    t.engine.delete_policy(t.project_id(), &created.id).await.unwrap();
    assert!(t.engine.list_policies(t.project_id(), "prod").await.unwrap().is_empty());
    let direct = t.engine.mutate(&user("alice"), &app, vec![create("C", "3")]).await.unwrap();
    assert!(!direct.is_pending());

    // Reviews on requests whose policy is gone are refused.
    let err = t.engine.approve_request(&user("carol"), t.project_id(), &open[0].id).await.unwrap_err();
    assert!(matches!(err, VaultlineError::Validation { .. }));
}
