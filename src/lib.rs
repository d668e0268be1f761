//! # Vaultline
//!
//! Secret resolution and mutation engine for a multi-tenant encrypted secret store.
//!
//! ## Architecture
//!
//! ```text
//! caller → SecretEngine ─┬─ reads:  ImportResolver → EnvelopeCodec::open → ReferenceResolver
//!                        └─ writes: Sealer → ApprovalGate ─┬─ MutationApplier → storage
//!                                                          └─ ApprovalRequest (pending)
//! ```
//!
//! ## Core Components
//!
//! - **Reference Resolver**: expands `${env.path.KEY}` tokens with cycle and depth bounds
//! - **Import Resolver**: layers imported folders under local secrets in position order
//! - **Approval Gate**: parks writes covered by an approval policy until reviewed
//! - **Mutation Applier**: applies a batch atomically with optimistic version checks
//! - **Persistence Layer**: SQLx with SQLite
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use vaultline::config::load_config;
//! use vaultline::domain::{ActorContext, FolderTarget, ProjectId, SecretPath};
//! use vaultline::services::{SecretEngine, SecretReadOptions};
//!
//! # async fn run() -> vaultline::Result<()> {
//! let config = load_config(Some("vaultline.yaml"))?;
//! let engine = SecretEngine::from_config(&config).await?;
//!
//! let target = FolderTarget::new(ProjectId::new(), "prod", SecretPath::parse("/app")?);
//! let actor = ActorContext::user("alice", "acme");
//! let secrets = engine.get_effective_secrets(&actor, &target, SecretReadOptions::expanded()).await?;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod domain;
pub mod errors;
pub mod observability;
pub mod services;
pub mod storage;

// Re-export commonly used types and traits
pub use config::{load_config, AppConfig};
pub use errors::{Result, VaultlineError};
pub use services::{MutationOutcome, SecretEngine, SecretReadOptions};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
