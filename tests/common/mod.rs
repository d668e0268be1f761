//! Common test utilities for all integration tests.
//!
//! Provides shared test database setup, cleanup, and helper functions.

#![allow(dead_code)]
#![allow(clippy::duplicate_mod)]

pub mod test_db;

pub use test_db::{TestDatabase, TestEngine};

use vaultline::domain::{ActorContext, CreateSecret, FolderTarget, SecretMutation, SecretPath};
use vaultline::services::{MutationOutcome, SecretEngine};

pub fn user(id: &str) -> ActorContext {
    ActorContext::user(id, "acme")
}

pub fn create(key: &str, value: &str) -> SecretMutation {
    SecretMutation::Create(CreateSecret::new(key, value))
}

pub fn path(raw: &str) -> SecretPath {
    SecretPath::parse(raw).expect("test path should be valid")
}

/// Create shared secrets in `target` and assert they were applied directly.
pub async fn seed(engine: &SecretEngine, target: &FolderTarget, pairs: &[(&str, &str)]) {
    let mutations = pairs.iter().map(|(key, value)| create(key, value)).collect();
    let outcome = engine.mutate(&user("seeder"), target, mutations).await.expect("seed secrets");
    assert!(matches!(outcome, MutationOutcome::Applied(_)), "seeding should not be gated");
}
