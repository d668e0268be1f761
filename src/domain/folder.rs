//! Projects, environments and folders.

use super::id::{EnvironmentId, FolderId, ProjectId};
use super::path::SecretPath;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix of the hidden folder that holds a replicated import's materialized copy.
pub const RESERVED_REPLICATION_PREFIX: &str = "__reserve_replication_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub id: EnvironmentId,
    pub project_id: ProjectId,
    /// Short name used in reference tokens, unique per project
    pub slug: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Folder {
    pub id: FolderId,
    pub environment_id: EnvironmentId,
    pub parent_id: Option<FolderId>,
    pub name: String,
    pub path: SecretPath,
    pub is_reserved: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A folder together with the environment it belongs to.
#[derive(Debug, Clone)]
pub struct FolderContext {
    pub environment: Environment,
    pub folder: Folder,
}

impl FolderContext {
    pub fn project_id(&self) -> &ProjectId {
        &self.environment.project_id
    }

    pub fn slug(&self) -> &str {
        &self.environment.slug
    }

    pub fn path(&self) -> &SecretPath {
        &self.folder.path
    }
}

/// Caller-facing address of a folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderTarget {
    pub project_id: ProjectId,
    pub environment: String,
    pub path: SecretPath,
}

impl FolderTarget {
    pub fn new(project_id: ProjectId, environment: impl Into<String>, path: SecretPath) -> Self {
        Self { project_id, environment: environment.into(), path }
    }
}

pub fn reserved_replication_folder_name(import_id: &str) -> String {
    format!("{}{}", RESERVED_REPLICATION_PREFIX, import_id)
}
