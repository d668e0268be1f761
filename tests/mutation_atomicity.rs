//! Integration tests for batch atomicity, optimistic versioning and moves.

mod common;

use common::{create, path, seed, user, TestEngine};
use vaultline::domain::{DeleteSecret, MoveSecrets, SecretMutation, UpdateSecret};
use vaultline::errors::ConflictKind;
use vaultline::services::{MutationOutcome, SecretReadOptions};
use vaultline::VaultlineError;

#[tokio::test]
async fn test_failed_batch_leaves_no_partial_writes() {
    let t = TestEngine::new("atomic_batch").await;
    let dev = t.target("dev", "/");
    seed(&t.engine, &dev, &[("EXISTING", "1")]).await;

    let err = t
        .engine
        .mutate(
            &user("alice"),
            &dev,
            vec![
                create("NEW_ONE", "a"),
                SecretMutation::Update(UpdateSecret::value("EXISTING", "2")),
                create("EXISTING", "dup"),
            ],
        )
        .await
        .unwrap_err();

    match &err {
        VaultlineError::BatchOperation { index, .. } => assert_eq!(*index, 2),
        other => panic!("expected batch error, got {:?}", other),
    }
    assert_eq!(err.conflict_kind(), Some(ConflictKind::AlreadyExists));

    let views = t.engine.get_effective_secrets(&user("alice"), &dev, SecretReadOptions::default()).await.unwrap();
    assert_eq!(views.len(), 1);
    assert_eq!((views[0].value.as_str(), views[0].version), ("1", 1));
}

#[tokio::test]
async fn test_version_conflict_mid_batch_rolls_back_every_update() {
    let t = TestEngine::new("atomic_mid_conflict").await;
    let dev = t.target("dev", "/");
    seed(&t.engine, &dev, &[("A", "a1"), ("B", "b1"), ("C", "c1"), ("D", "d1")]).await;
    t.engine
        .mutate(&user("bob"), &dev, vec![SecretMutation::Update(UpdateSecret::value("B", "b2"))])
        .await
        .unwrap();

    let err = t
        .engine
        .mutate(
            &user("alice"),
            &dev,
            vec![
                SecretMutation::Update(UpdateSecret::value("A", "a-new").expecting(1)),
                SecretMutation::Update(UpdateSecret::value("B", "b-new").expecting(1)),
                SecretMutation::Update(UpdateSecret::value("C", "c-new").expecting(1)),
                SecretMutation::Update(UpdateSecret::value("D", "d-new").expecting(1)),
            ],
        )
        .await
        .unwrap_err();

    assert!(matches!(err, VaultlineError::BatchOperation { index: 1, .. }));
    assert_eq!(err.conflict_kind(), Some(ConflictKind::VersionConflict));

    let views = t.engine.get_effective_secrets(&user("alice"), &dev, SecretReadOptions::default()).await.unwrap();
    let state: Vec<_> = views.iter().map(|v| (v.key.as_str(), v.value.as_str(), v.version)).collect();
    assert_eq!(state, vec![("A", "a1", 1), ("B", "b2", 2), ("C", "c1", 1), ("D", "d1", 1)]);
}

#[tokio::test]
async fn test_sealing_errors_carry_batch_index() {
    let t = TestEngine::new("atomic_sealing").await;
    let err = t
        .engine
        .mutate(&user("alice"), &t.target("dev", "/"), vec![create("OK", "1"), create("not a key", "2")])
        .await
        .unwrap_err();
    assert!(matches!(err, VaultlineError::BatchOperation { index: 1, .. }));
    assert!(matches!(err.root_cause(), VaultlineError::Validation { .. }));
}

#[tokio::test]
async fn test_expected_version_guards_updates_and_deletes() {
    let t = TestEngine::new("atomic_versions").await;
    let dev = t.target("dev", "/");
    seed(&t.engine, &dev, &[("K", "v1")]).await;

    t.engine
        .mutate(&user("alice"), &dev, vec![SecretMutation::Update(UpdateSecret::value("K", "v2").expecting(1))])
        .await
        .unwrap();

    let err = t
        .engine
        .mutate(&user("bob"), &dev, vec![SecretMutation::Update(UpdateSecret::value("K", "lost").expecting(1))])
        .await
        .unwrap_err();
    assert_eq!(err.conflict_kind(), Some(ConflictKind::VersionConflict));

    let mut delete = DeleteSecret::new("K");
    delete.expected_version = Some(1);
    let err = t.engine.mutate(&user("bob"), &dev, vec![SecretMutation::Delete(delete)]).await.unwrap_err();
    assert_eq!(err.conflict_kind(), Some(ConflictKind::VersionConflict));

    let view = t.engine.get_secret_by_key(&user("alice"), &dev, "K", None, SecretReadOptions::default()).await.unwrap();
    assert_eq!((view.value.as_str(), view.version), ("v2", 2));
}

#[tokio::test]
async fn test_concurrent_writers_with_same_version_one_wins() {
    let t = TestEngine::new("atomic_concurrent").await;
    let dev = t.target("dev", "/");
    seed(&t.engine, &dev, &[("COUNTER", "0")]).await;

    let mut handles = Vec::new();
    for writer in 0..4 {
        let engine = t.engine.clone();
        let dev = dev.clone();
        handles.push(tokio::spawn(async move {
            engine
                .mutate(
                    &user(&format!("writer-{}", writer)),
                    &dev,
                    vec![SecretMutation::Update(UpdateSecret::value("COUNTER", writer.to_string()).expecting(1))],
                )
                .await
        }));
    }

    let mut applied = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(MutationOutcome::Applied(_)) => applied += 1,
            Ok(MutationOutcome::PendingApproval(_)) => panic!("no policy covers this folder"),
            // A writer whose snapshot went stale may also see SQLite's busy error.
            Err(e) => assert!(
                e.conflict_kind() == Some(ConflictKind::VersionConflict) || e.is_retryable(),
                "unexpected error: {:?}",
                e
            ),
        }
    }
    assert_eq!(applied, 1);

    let view = t.engine.get_secret_by_key(&user("a"), &dev, "COUNTER", None, SecretReadOptions::default()).await.unwrap();
    assert_eq!(view.version, 2);
}

#[tokio::test]
async fn test_move_relocates_and_rewrites_references() {
    let t = TestEngine::new("atomic_move").await;
    let old = t.target("prod", "/legacy");
    seed(&t.engine, &old, &[("HOST", "db-1")]).await;
    seed(&t.engine, &t.target("prod", "/app"), &[("DSN", "pg://${prod.legacy.HOST}")]).await;

    let host = t.engine.get_secret_by_key(&user("alice"), &old, "HOST", None, SecretReadOptions::default()).await.unwrap();

    let outcome = t
        .engine
        .mutate(
            &user("alice"),
            &old,
            vec![SecretMutation::Move(MoveSecrets {
                secret_ids: vec![host.id.clone()],
                destination_environment: "prod".into(),
                destination_path: path("/db"),
                should_overwrite: false,
            })],
        )
        .await
        .unwrap();
    let MutationOutcome::Applied(result) = outcome else { panic!("move should apply directly") };
    assert_eq!(result.moves[0].rewritten_references, 1);

    let moved = t
        .engine
        .get_secret_by_key(&user("alice"), &t.target("prod", "/db"), "HOST", None, SecretReadOptions::default())
        .await
        .unwrap();
    assert_eq!(moved.value, "db-1");
    assert!(t
        .engine
        .get_secret_by_key(&user("alice"), &old, "HOST", None, SecretReadOptions::default())
        .await
        .is_err());

    let dsn = t
        .engine
        .get_secret_by_key(&user("alice"), &t.target("prod", "/app"), "DSN", None, SecretReadOptions::expanded())
        .await
        .unwrap();
    assert_eq!(dsn.value, "pg://db-1");
}

#[tokio::test]
async fn test_move_collision_without_overwrite() {
    let t = TestEngine::new("atomic_move_collision").await;
    let src = t.target("dev", "/src");
    seed(&t.engine, &src, &[("K", "new")]).await;
    seed(&t.engine, &t.target("dev", "/dst"), &[("K", "old")]).await;
    let k = t.engine.get_secret_by_key(&user("alice"), &src, "K", None, SecretReadOptions::default()).await.unwrap();

    let move_k = |overwrite| {
        vec![SecretMutation::Move(MoveSecrets {
            secret_ids: vec![k.id.clone()],
            destination_environment: "dev".into(),
            destination_path: path("/dst"),
            should_overwrite: overwrite,
        })]
    };

    let err = t.engine.mutate(&user("alice"), &src, move_k(false)).await.unwrap_err();
    assert_eq!(err.conflict_kind(), Some(ConflictKind::KeyCollision));

    t.engine.mutate(&user("alice"), &src, move_k(true)).await.unwrap();
    let dst = t
        .engine
        .get_secret_by_key(&user("alice"), &t.target("dev", "/dst"), "K", None, SecretReadOptions::default())
        .await
        .unwrap();
    assert_eq!(dst.value, "new");
}

#[tokio::test]
async fn test_history_outlives_deleted_folder() {
    let t = TestEngine::new("atomic_history").await;
    let tmp = t.target("dev", "/tmp");
    seed(&t.engine, &tmp, &[("K", "one")]).await;
    t.engine
        .mutate(&user("alice"), &tmp, vec![SecretMutation::Update(UpdateSecret::value("K", "two"))])
        .await
        .unwrap();
    let k = t.engine.get_secret_by_key(&user("alice"), &tmp, "K", None, SecretReadOptions::default()).await.unwrap();

    t.engine.delete_folder(&tmp).await.unwrap();
    assert!(t.engine.list_folders(&t.target("dev", "/")).await.unwrap().iter().all(|f| f.name != "tmp"));

    let history = t.engine.get_secret_versions(&user("alice"), t.project_id(), &k.id, true).await.unwrap();
    let values: Vec<_> = history.iter().map(|v| (v.version, v.value.as_str())).collect();
    assert_eq!(values, vec![(2, "two"), (1, "one")]);
}
