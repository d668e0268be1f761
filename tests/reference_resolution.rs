//! Integration tests for `${...}` reference expansion through the engine.

mod common;

use common::{create, seed, user, TestEngine};
use vaultline::config::EngineConfig;
use vaultline::domain::{CreateSecret, SecretMutation};
use vaultline::errors::GraphErrorKind;
use vaultline::services::SecretReadOptions;

#[tokio::test]
async fn test_local_and_nested_path_references() {
    let t = TestEngine::new("refs_nested").await;
    seed(&t.engine, &t.target("prod", "/app/db"), &[("HOST", "db.internal"), ("PORT", "5432")]).await;
    seed(&t.engine, &t.target("prod", "/app/db"), &[("ADDR", "${HOST}:${PORT}")]).await;
    seed(&t.engine, &t.target("dev", "/"), &[("DSN", "pg://${prod.app.db.ADDR}/main")]).await;

    let view = t
        .engine
        .get_secret_by_key(&user("alice"), &t.target("dev", "/"), "DSN", None, SecretReadOptions::expanded())
        .await
        .unwrap();

    // ADDR's local references resolve relative to /app/db in prod, not to the reader.
    assert_eq!(view.value, "pg://db.internal:5432/main");
}

#[tokio::test]
async fn test_slash_form_and_memoized_siblings() {
    let t = TestEngine::new("refs_slash").await;
    seed(&t.engine, &t.target("staging", "/shared"), &[("REGION", "eu-west-1")]).await;
    seed(
        &t.engine,
        &t.target("staging", "/"),
        &[("A", "${staging./shared.REGION}"), ("B", "${staging.shared.REGION}-b")],
    )
    .await;

    let views = t
        .engine
        .get_effective_secrets(&user("alice"), &t.target("staging", "/"), SecretReadOptions::expanded())
        .await
        .unwrap();
    let values: Vec<_> = views.iter().map(|v| (v.key.as_str(), v.value.as_str())).collect();
    assert_eq!(values, vec![("A", "eu-west-1"), ("B", "eu-west-1-b")]);
}

#[tokio::test]
async fn test_missing_reference_expands_empty_but_tree_fails() {
    let t = TestEngine::new("refs_missing").await;
    seed(&t.engine, &t.target("dev", "/"), &[("URL", "https://${NOPE}/x")]).await;

    let view = t
        .engine
        .get_secret_by_key(&user("alice"), &t.target("dev", "/"), "URL", None, SecretReadOptions::expanded())
        .await
        .unwrap();
    assert_eq!(view.value, "https:///x");

    let err = t.engine.get_reference_tree(&user("alice"), &t.target("dev", "/"), "URL", true).await.unwrap_err();
    assert_eq!(err.graph_kind(), Some(GraphErrorKind::UnresolvedReference));
}

#[tokio::test]
async fn test_cycle_is_reported_with_chain() {
    let t = TestEngine::new("refs_cycle").await;
    seed(&t.engine, &t.target("dev", "/"), &[("A", "${B}"), ("B", "${C}"), ("C", "${A}")]).await;

    let err = t
        .engine
        .get_secret_by_key(&user("alice"), &t.target("dev", "/"), "A", None, SecretReadOptions::expanded())
        .await
        .unwrap_err();
    assert_eq!(err.graph_kind(), Some(GraphErrorKind::CycleDetected));
    match err {
        vaultline::VaultlineError::Graph { chain, .. } => {
            assert_eq!(chain.first(), chain.last());
            assert_eq!(chain.len(), 4);
        }
        other => panic!("expected graph error, got {:?}", other),
    }

    // Raw reads never follow references.
    let raw = t
        .engine
        .get_secret_by_key(&user("alice"), &t.target("dev", "/"), "A", None, SecretReadOptions::default())
        .await
        .unwrap();
    assert_eq!(raw.value, "${B}");
}

#[tokio::test]
async fn test_depth_bound_applies_to_acyclic_chains() {
    let settings = EngineConfig { max_reference_depth: 3, ..EngineConfig::default() };
    let t = TestEngine::with_settings("refs_depth", settings).await;
    let dev = t.target("dev", "/");
    seed(&t.engine, &dev, &[("K4", "end"), ("K3", "${K4}"), ("K2", "${K3}"), ("K1", "${K2}"), ("K0", "${K1}")]).await;

    let ok = t
        .engine
        .get_secret_by_key(&user("alice"), &dev, "K1", None, SecretReadOptions::expanded())
        .await
        .unwrap();
    assert_eq!(ok.value, "end");

    let err = t
        .engine
        .get_secret_by_key(&user("alice"), &dev, "K0", None, SecretReadOptions::expanded())
        .await
        .unwrap_err();
    assert_eq!(err.graph_kind(), Some(GraphErrorKind::DepthExceeded));
}

#[tokio::test]
async fn test_reference_tree_shape_and_masking() {
    let t = TestEngine::new("refs_tree").await;
    seed(&t.engine, &t.target("prod", "/net"), &[("HOST", "10.1.0.1"), ("PORT", "443")]).await;
    seed(&t.engine, &t.target("prod", "/"), &[("URL", "https://${prod.net.HOST}:${prod.net.PORT}")]).await;

    let tree = t.engine.get_reference_tree(&user("alice"), &t.target("prod", "/"), "URL", true).await.unwrap();
    assert_eq!(tree.root_node().value, "https://10.1.0.1:443");
    let children: Vec<_> = tree.children(tree.root).map(|n| n.key.as_str()).collect();
    assert_eq!(children, vec!["HOST", "PORT"]);

    let masked = t.engine.get_reference_tree(&user("alice"), &t.target("prod", "/"), "URL", false).await.unwrap();
    assert!(masked.nodes.iter().all(|n| n.value == vaultline::domain::HIDDEN_SECRET_VALUE));
    assert_eq!(masked.nodes.len(), tree.nodes.len());
}

#[tokio::test]
async fn test_personal_secret_can_extend_its_shared_twin() {
    let t = TestEngine::new("refs_personal").await;
    let dev = t.target("dev", "/");
    seed(&t.engine, &dev, &[("TOKEN", "team-token")]).await;
    t.engine
        .mutate(&user("alice"), &dev, vec![SecretMutation::Create(CreateSecret::new("TOKEN", "${TOKEN}+alice").personal())])
        .await
        .unwrap();

    let mine = t
        .engine
        .get_secret_by_key(&user("alice"), &dev, "TOKEN", None, SecretReadOptions::expanded())
        .await
        .unwrap();
    assert_eq!(mine.value, "team-token+alice");

    let tree = t.engine.get_reference_tree(&user("alice"), &dev, "TOKEN", true).await.unwrap();
    assert_eq!(tree.root_node().value, "team-token+alice");
    assert_eq!(tree.children(tree.root).next().unwrap().value, "team-token");

    let theirs = t
        .engine
        .get_secret_by_key(&user("bob"), &dev, "TOKEN", None, SecretReadOptions::expanded())
        .await
        .unwrap();
    assert_eq!(theirs.value, "team-token");
}

#[tokio::test]
async fn test_invalid_reference_syntax_rejected_on_write() {
    let t = TestEngine::new("refs_invalid").await;
    let err = t
        .engine
        .mutate(&user("alice"), &t.target("dev", "/"), vec![create("BAD", "${.KEY}")])
        .await
        .unwrap_err();
    assert!(matches!(err.root_cause(), vaultline::VaultlineError::Validation { .. }));
}
