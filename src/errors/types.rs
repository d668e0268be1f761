//! # Error Types
//!
//! Error taxonomy for the Vaultline engine using `thiserror`.
//!
//! Graph and conflict errors are always surfaced to the immediate caller; the engine
//! never retries them internally. A mutation parked for approval is not an error at all
//! (see [`crate::services::MutationOutcome`]).

use std::fmt;

/// Custom result type for Vaultline operations
pub type Result<T> = std::result::Result<T, VaultlineError>;

/// Main error type for the Vaultline engine
#[derive(thiserror::Error, Debug)]
pub enum VaultlineError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Database and storage errors
    #[error("Database error: {context}")]
    Database {
        #[source]
        source: sqlx::Error,
        context: String,
    },

    /// I/O errors with additional context
    #[error("I/O error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {context}")]
    Serialization {
        #[source]
        source: serde_json::Error,
        context: String,
    },

    /// Malformed path, key, reference syntax or request payload
    #[error("Validation error: {message}")]
    Validation { message: String, field: Option<String> },

    /// The actor may not perform this action on an approval request
    #[error("Authorization error: {message}")]
    Auth { message: String, error_type: AuthErrorType },

    /// Resource not found errors
    #[error("Resource not found: {resource_type} with ID '{id}'")]
    NotFound { resource_type: String, id: String },

    /// Version, existence and approval conflicts
    #[error("Conflict ({kind}): {message}")]
    Conflict { kind: ConflictKind, message: String },

    /// Reference or import graph failures
    #[error("Graph error ({kind}): {message}")]
    Graph { kind: GraphErrorKind, message: String, chain: Vec<String> },

    /// A batch failed; `index` is the zero-based position of the first failing operation
    #[error("Operation {index} failed: {source}")]
    BatchOperation {
        index: usize,
        #[source]
        source: Box<VaultlineError>,
    },

    /// Envelope sealing or opening failed
    #[error("Encryption error: {message}")]
    Encryption { message: String },

    /// Internal errors
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Timeout errors
    #[error("Operation timed out: {operation} after {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },
}

/// Authorization error subtypes
#[derive(Debug, Clone, PartialEq)]
pub enum AuthErrorType {
    InsufficientPermissions,
    SelfApprovalNotAllowed,
    BypassNotAllowed,
}

impl fmt::Display for AuthErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthErrorType::InsufficientPermissions => write!(f, "insufficient_permissions"),
            AuthErrorType::SelfApprovalNotAllowed => write!(f, "self_approval_not_allowed"),
            AuthErrorType::BypassNotAllowed => write!(f, "bypass_not_allowed"),
        }
    }
}

/// Conflict subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// Expected version did not match the stored version
    VersionConflict,
    /// Create targeted an identity that already exists
    AlreadyExists,
    /// Move hit existing destination keys without `should_overwrite`
    KeyCollision,
    /// An approved request could not be applied to the current state
    StaleApproval,
    /// The approval request is no longer open
    RequestClosed,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictKind::VersionConflict => write!(f, "VERSION_CONFLICT"),
            ConflictKind::AlreadyExists => write!(f, "ALREADY_EXISTS"),
            ConflictKind::KeyCollision => write!(f, "KEY_COLLISION"),
            ConflictKind::StaleApproval => write!(f, "STALE_APPROVAL"),
            ConflictKind::RequestClosed => write!(f, "REQUEST_CLOSED"),
        }
    }
}

/// Graph error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphErrorKind {
    CycleDetected,
    ImportCycle,
    DepthExceeded,
    UnresolvedReference,
}

impl fmt::Display for GraphErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphErrorKind::CycleDetected => write!(f, "CYCLE_DETECTED"),
            GraphErrorKind::ImportCycle => write!(f, "IMPORT_CYCLE"),
            GraphErrorKind::DepthExceeded => write!(f, "DEPTH_EXCEEDED"),
            GraphErrorKind::UnresolvedReference => write!(f, "UNRESOLVED_REFERENCE"),
        }
    }
}

impl VaultlineError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into(), source: None }
    }

    /// Create a configuration error with source
    pub fn config_with_source<S: Into<String>>(
        message: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Config { message: message.into(), source: Some(source) }
    }

    /// Create a database error with context
    pub fn database<S: Into<String>>(source: sqlx::Error, context: S) -> Self {
        Self::Database { source, context: context.into() }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation { message: message.into(), field: None }
    }

    /// Create a validation error with field information
    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation { message: message.into(), field: Some(field.into()) }
    }

    /// Create an authorization error
    pub fn auth<S: Into<String>>(message: S, error_type: AuthErrorType) -> Self {
        Self::Auth { message: message.into(), error_type }
    }

    /// Create a not found error
    pub fn not_found<R: Into<String>, I: Into<String>>(resource_type: R, id: I) -> Self {
        Self::NotFound { resource_type: resource_type.into(), id: id.into() }
    }

    /// Create a conflict error
    pub fn conflict<M: Into<String>>(kind: ConflictKind, message: M) -> Self {
        Self::Conflict { kind, message: message.into() }
    }

    /// Create a graph error carrying the offending chain
    pub fn graph<M: Into<String>>(kind: GraphErrorKind, message: M, chain: Vec<String>) -> Self {
        Self::Graph { kind, message: message.into(), chain }
    }

    /// Wrap an error with the index of the batch operation that produced it
    pub fn batch(index: usize, source: VaultlineError) -> Self {
        Self::BatchOperation { index, source: Box::new(source) }
    }

    /// Create an encryption error
    pub fn encryption<S: Into<String>>(message: S) -> Self {
        Self::Encryption { message: message.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, duration_ms: u64) -> Self {
        Self::Timeout { operation: operation.into(), duration_ms }
    }

    /// The error with any batch wrapping removed
    pub fn root_cause(&self) -> &VaultlineError {
        let mut current = self;
        while let VaultlineError::BatchOperation { source, .. } = current {
            current = source;
        }
        current
    }

    /// Conflict kind of the root cause, if it is a conflict
    pub fn conflict_kind(&self) -> Option<ConflictKind> {
        match self.root_cause() {
            VaultlineError::Conflict { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Graph error kind of the root cause, if it is a graph error
    pub fn graph_kind(&self) -> Option<GraphErrorKind> {
        match self.root_cause() {
            VaultlineError::Graph { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Get the HTTP status code an API layer should return for this error
    pub fn status_code(&self) -> u16 {
        match self {
            VaultlineError::Config { .. } => 500,
            VaultlineError::Database { .. } => 500,
            VaultlineError::Io { .. } => 500,
            VaultlineError::Serialization { .. } => 400,
            VaultlineError::Validation { .. } => 400,
            VaultlineError::Auth { .. } => 403,
            VaultlineError::NotFound { .. } => 404,
            VaultlineError::Conflict { .. } => 409,
            VaultlineError::Graph { kind: GraphErrorKind::UnresolvedReference, .. } => 404,
            VaultlineError::Graph { .. } => 422,
            VaultlineError::BatchOperation { source, .. } => source.status_code(),
            VaultlineError::Encryption { .. } => 500,
            VaultlineError::Internal { .. } => 500,
            VaultlineError::Timeout { .. } => 408,
        }
    }

    /// Check if this error is transient. Graph and conflict errors never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            VaultlineError::Database { .. } => true,
            VaultlineError::Io { .. } => true,
            VaultlineError::Timeout { .. } => true,
            VaultlineError::BatchOperation { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

impl From<sqlx::Error> for VaultlineError {
    fn from(error: sqlx::Error) -> Self {
        Self::Database { source: error, context: "Database operation failed".to_string() }
    }
}

impl From<std::io::Error> for VaultlineError {
    fn from(error: std::io::Error) -> Self {
        Self::Io { source: error, context: "I/O operation failed".to_string() }
    }
}

impl From<serde_json::Error> for VaultlineError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization { source: error, context: "JSON serialization failed".to_string() }
    }
}

impl From<config::ConfigError> for VaultlineError {
    fn from(error: config::ConfigError) -> Self {
        Self::config_with_source("Configuration loading failed", Box::new(error))
    }
}

impl From<validator::ValidationErrors> for VaultlineError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let message = errors
            .field_errors()
            .iter()
            .map(|(field, field_errors)| {
                let error_messages: Vec<String> = field_errors
                    .iter()
                    .map(|e| {
                        e.message.as_ref().map_or("Invalid value".to_string(), |m| m.to_string())
                    })
                    .collect();
                format!("{}: {}", field, error_messages.join(", "))
            })
            .collect::<Vec<_>>()
            .join("; ");

        Self::validation(format!("Validation failed: {}", message))
    }
}
