//! Business logic services
//!
//! This module contains the engine components that sit between callers and
//! storage: resolution of imports and references, sealing, mutation
//! application, and the approval workflow.

pub mod approval_gate;
pub mod folder_service;
pub mod import_resolver;
pub mod import_service;
pub mod mutation_applier;
pub mod policy_cache;
pub mod reference_resolver;
pub mod sealer;
pub mod secret_encryption;
pub mod secret_engine;
pub mod store_source;

pub use approval_gate::{ApprovalGate, MutationOutcome};
pub use folder_service::FolderService;
pub use import_resolver::{
    EffectiveSecret, EffectiveSet, ImportGraphSource, ImportResolver, ResolvedFolder,
};
pub use import_service::{ImportService, ImportingFolder};
pub use mutation_applier::{AppliedAction, AppliedSecret, ApplyResult, MoveReport, MutationApplier};
pub use policy_cache::PolicyCache;
pub use reference_resolver::{
    ReferenceNode, ReferenceResolver, ReferenceSource, ReferenceTree, ResolveOptions, RootKind,
    UnresolvedPolicy, DEFAULT_MAX_REFERENCE_DEPTH,
};
pub use sealer::Sealer;
pub use secret_encryption::{EnvelopeCodec, SecretEncryption, SecretEncryptionConfig};
pub use secret_engine::{SecretDependent, SecretEngine, SecretReadOptions, SecretVersionView};
pub use store_source::{FolderStore, StoreSource};
