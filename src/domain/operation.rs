//! Mutation intents.
//!
//! Callers submit plaintext [`SecretMutation`]s. The engine seals them into
//! [`SecretOperation`]s before anything else sees them, so the approval gate and the
//! pending-request store only ever handle envelopes.

use super::envelope::Envelope;
use super::id::{EnvironmentId, SecretId};
use super::path::SecretPath;
use super::reference::ReferenceEdge;
use super::secret::{SecretIdentity, SecretMetadataEntry, SecretType, StoredMetadataEntry};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSecret {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub secret_type: SecretType,
    #[serde(default)]
    pub skip_multiline_encoding: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Vec<SecretMetadataEntry>,
}

impl CreateSecret {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), value: value.into(), ..Default::default() }
    }

    pub fn personal(mut self) -> Self {
        self.secret_type = SecretType::Personal;
        self
    }
}

/// Partial update. `None` fields are left unchanged; `new_key` renames.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSecret {
    pub key: String,
    #[serde(default)]
    pub secret_type: SecretType,
    #[serde(default)]
    pub expected_version: Option<i64>,
    #[serde(default)]
    pub new_key: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub skip_multiline_encoding: Option<bool>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub metadata: Option<Vec<SecretMetadataEntry>>,
}

impl UpdateSecret {
    pub fn value(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), value: Some(value.into()), ..Default::default() }
    }

    pub fn expecting(mut self, version: i64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteSecret {
    pub key: String,
    #[serde(default)]
    pub secret_type: SecretType,
    #[serde(default)]
    pub expected_version: Option<i64>,
}

impl DeleteSecret {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into(), ..Default::default() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveSecrets {
    pub secret_ids: Vec<SecretId>,
    pub destination_environment: String,
    pub destination_path: SecretPath,
    #[serde(default)]
    pub should_overwrite: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SecretMutation {
    Create(CreateSecret),
    Update(UpdateSecret),
    Delete(DeleteSecret),
    Move(MoveSecrets),
}

impl SecretMutation {
    pub fn secret_type(&self) -> Option<SecretType> {
        match self {
            SecretMutation::Create(create) => Some(create.secret_type),
            SecretMutation::Update(update) => Some(update.secret_type),
            SecretMutation::Delete(delete) => Some(delete.secret_type),
            SecretMutation::Move(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedCreate {
    pub identity: SecretIdentity,
    pub key_blind_index: String,
    pub value: Envelope,
    pub comment: Option<Envelope>,
    pub skip_multiline_encoding: bool,
    pub tags: Vec<String>,
    pub metadata: Vec<StoredMetadataEntry>,
    pub references: Vec<ReferenceEdge>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedUpdate {
    pub identity: SecretIdentity,
    pub expected_version: Option<i64>,
    pub new_key: Option<String>,
    pub new_key_blind_index: Option<String>,
    pub value: Option<Envelope>,
    pub comment: Option<Envelope>,
    pub skip_multiline_encoding: Option<bool>,
    pub tags: Option<Vec<String>>,
    pub metadata: Option<Vec<StoredMetadataEntry>>,
    /// Recomputed edges, present whenever `value` is
    pub references: Option<Vec<ReferenceEdge>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedDelete {
    pub identity: SecretIdentity,
    pub expected_version: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveItem {
    pub secret_id: SecretId,
    pub expected_version: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedMove {
    pub items: Vec<MoveItem>,
    pub destination_environment_id: EnvironmentId,
    pub destination_path: SecretPath,
    pub should_overwrite: bool,
}

/// Sealed operation as applied by the mutation applier and captured by approval requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SecretOperation {
    Create(SealedCreate),
    Update(SealedUpdate),
    Delete(SealedDelete),
    Move(SealedMove),
}

impl SecretOperation {
    pub fn kind(&self) -> &'static str {
        match self {
            SecretOperation::Create(_) => "create",
            SecretOperation::Update(_) => "update",
            SecretOperation::Delete(_) => "delete",
            SecretOperation::Move(_) => "move",
        }
    }

    /// Personal operations only ever touch the actor's own secrets.
    pub fn is_personal(&self) -> bool {
        let identity = match self {
            SecretOperation::Create(op) => &op.identity,
            SecretOperation::Update(op) => &op.identity,
            SecretOperation::Delete(op) => &op.identity,
            SecretOperation::Move(_) => return false,
        };
        identity.secret_type == SecretType::Personal
    }

    /// Key the operation addresses, if it addresses exactly one.
    pub fn key(&self) -> Option<&str> {
        match self {
            SecretOperation::Create(op) => Some(&op.identity.key),
            SecretOperation::Update(op) => Some(&op.identity.key),
            SecretOperation::Delete(op) => Some(&op.identity.key),
            SecretOperation::Move(_) => None,
        }
    }
}
