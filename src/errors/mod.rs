//! # Error Handling
//!
//! Error handling for the Vaultline engine.

pub mod types;

pub use types::{AuthErrorType, ConflictKind, GraphErrorKind, Result, VaultlineError};
