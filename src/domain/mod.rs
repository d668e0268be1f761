//! Domain layer
//!
//! Pure domain types for the secret store: identifiers, paths, secrets, imports,
//! reference syntax, mutation intents and approval workflow state. Nothing here
//! touches the database or the envelope codec.
//!
//! ## Module Organization
//!
//! - `id`: Type-safe identifiers with the NewType pattern
//! - `path`: Normalized folder paths
//! - `folder`: Projects, environments and folders
//! - `secret`: Stored secret records and caller-facing views
//! - `envelope`: Sealed value container
//! - `reference`: `${...}` reference token syntax
//! - `import`: Folder imports
//! - `operation`: Plaintext mutations and their sealed form
//! - `approval`: Approval policies, requests and policy matching
//! - `actor`: Acting principal

pub mod actor;
pub mod approval;
pub mod envelope;
pub mod folder;
pub mod id;
pub mod import;
pub mod operation;
pub mod path;
pub mod reference;
pub mod secret;

pub use actor::{ActorContext, ActorKind};
pub use approval::{
    most_specific_policy, ApprovalPolicy, ApprovalRequest, ApprovalRequestHandle, ApprovalReview,
    CompiledPolicy, EnforcementLevel, RequestStatus, RequestStatusCounts, ReviewStatus,
};
pub use envelope::Envelope;
pub use folder::{
    reserved_replication_folder_name, Environment, Folder, FolderContext, FolderTarget, Project,
};
pub use id::{
    ApprovalPolicyId, ApprovalRequestId, EnvironmentId, FolderId, ProjectId, SecretId,
    SecretImportId, SecretVersionId,
};
pub use import::{ReplicationSummary, SecretImport};
pub use operation::{
    CreateSecret, DeleteSecret, MoveItem, MoveSecrets, SealedCreate, SealedDelete, SealedMove,
    SealedUpdate, SecretMutation, SecretOperation, UpdateSecret,
};
pub use path::SecretPath;
pub use reference::{ReferenceEdge, SecretLocator, SecretReference};
pub use secret::{
    ImportProvenance, SecretIdentity, SecretMetadataEntry, SecretRecord, SecretType,
    SecretVersionRecord, SecretView, StoredMetadataEntry, HIDDEN_SECRET_VALUE,
};
