//! Repository modules for data access
//!
//! Each repository handles persistence for one resource type. Repositories are
//! stateless: every function takes the connection or transaction to run on, so a
//! caller can compose several of them inside one transaction.

pub mod approval_policy;
pub mod approval_request;
pub mod environment;
pub mod folder;
pub mod project;
pub mod secret;
pub mod secret_import;
pub mod secret_reference;
pub mod secret_version;

pub use approval_policy::{
    ApprovalPolicyRepository, CreateApprovalPolicyRequest, UpdateApprovalPolicyRequest,
};
pub use approval_request::{ApprovalRequestFilter, ApprovalRequestRepository, NewApprovalRequest};
pub use environment::EnvironmentRepository;
pub use folder::FolderRepository;
pub use project::ProjectRepository;
pub use secret::SecretRepository;
pub use secret_import::{NewSecretImport, SecretImportRepository};
pub use secret_reference::SecretReferenceRepository;
pub use secret_version::SecretVersionRepository;

/// Whether a write failed on a UNIQUE constraint.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error().map(|db_err| db_err.is_unique_violation()).unwrap_or(false)
}
