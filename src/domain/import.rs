//! Folder imports.

use super::id::{EnvironmentId, FolderId, SecretImportId};
use super::path::SecretPath;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pulls another folder's effective secrets into `folder_id`.
///
/// Higher `position` wins on key collisions between imports; local secrets of the
/// importing folder always win. Replicated imports are resolved through the reserved
/// live import created alongside them, never directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretImport {
    pub id: SecretImportId,
    pub folder_id: FolderId,
    pub position: i64,
    pub import_environment_id: EnvironmentId,
    pub import_environment_slug: String,
    pub import_path: SecretPath,
    pub is_replication: bool,
    /// Hidden live import of a replication's reserved folder
    pub is_reserved: bool,
    pub reserved_for_import_id: Option<SecretImportId>,
    pub last_replicated_at: Option<DateTime<Utc>>,
    pub replication_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SecretImport {
    /// Whether this import participates in live resolution.
    pub fn is_live(&self) -> bool {
        !self.is_replication
    }
}

/// Outcome of materializing a replicated import.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicationSummary {
    pub import_id: Option<SecretImportId>,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl ReplicationSummary {
    pub fn changed(&self) -> bool {
        self.created + self.updated + self.deleted > 0
    }
}
