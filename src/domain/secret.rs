//! Secret records as stored, and secret views as returned to callers.

use super::envelope::Envelope;
use super::id::{FolderId, SecretId, SecretVersionId};
use super::path::SecretPath;
use crate::errors::{Result, VaultlineError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Mask returned in place of a value the caller may not view.
pub const HIDDEN_SECRET_VALUE: &str = "<hidden-by-vaultline>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecretType {
    #[default]
    Shared,
    /// Visible only to its owner; overrides a Shared secret with the same key for that owner
    Personal,
}

impl SecretType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretType::Shared => "shared",
            SecretType::Personal => "personal",
        }
    }
}

impl fmt::Display for SecretType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecretType {
    type Err = VaultlineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "shared" => Ok(SecretType::Shared),
            "personal" => Ok(SecretType::Personal),
            other => Err(VaultlineError::validation_field(
                format!("Unknown secret type '{}'", other),
                "secret_type",
            )),
        }
    }
}

/// Plaintext metadata entry supplied by or returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretMetadataEntry {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub is_encrypted: bool,
}

impl SecretMetadataEntry {
    pub fn plain(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), value: value.into(), is_encrypted: false }
    }

    pub fn encrypted(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), value: value.into(), is_encrypted: true }
    }
}

/// Metadata entry as persisted: exactly one of `value` and `encrypted_value` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMetadataEntry {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_value: Option<Envelope>,
}

/// Identity of a live secret within a folder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretIdentity {
    pub key: String,
    pub secret_type: SecretType,
    pub owner_actor_id: Option<String>,
}

impl SecretIdentity {
    pub fn shared(key: impl Into<String>) -> Self {
        Self { key: key.into(), secret_type: SecretType::Shared, owner_actor_id: None }
    }

    pub fn personal(key: impl Into<String>, owner: impl Into<String>) -> Self {
        Self { key: key.into(), secret_type: SecretType::Personal, owner_actor_id: Some(owner.into()) }
    }
}

impl fmt::Display for SecretIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.owner_actor_id {
            Some(owner) => write!(f, "{} ({} of {})", self.key, self.secret_type, owner),
            None => write!(f, "{}", self.key),
        }
    }
}

/// A live secret row.
#[derive(Debug, Clone)]
pub struct SecretRecord {
    pub id: SecretId,
    pub folder_id: FolderId,
    pub key: String,
    pub key_blind_index: String,
    pub secret_type: SecretType,
    pub owner_actor_id: Option<String>,
    pub version: i64,
    pub value: Envelope,
    pub comment: Option<Envelope>,
    pub skip_multiline_encoding: bool,
    pub tags: Vec<String>,
    pub metadata: Vec<StoredMetadataEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SecretRecord {
    pub fn identity(&self) -> SecretIdentity {
        SecretIdentity {
            key: self.key.clone(),
            secret_type: self.secret_type,
            owner_actor_id: self.owner_actor_id.clone(),
        }
    }
}

/// One entry of a secret's version history. Retained after the live secret is deleted.
#[derive(Debug, Clone)]
pub struct SecretVersionRecord {
    pub id: SecretVersionId,
    pub secret_id: SecretId,
    pub folder_id: FolderId,
    pub key: String,
    pub secret_type: SecretType,
    pub owner_actor_id: Option<String>,
    pub version: i64,
    pub value: Envelope,
    pub comment: Option<Envelope>,
    pub skip_multiline_encoding: bool,
    pub tags: Vec<String>,
    pub metadata: Vec<StoredMetadataEntry>,
    pub actor_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Where an effective secret actually lives when it came in through an import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportProvenance {
    pub environment: String,
    pub secret_path: SecretPath,
}

/// Decrypted secret as returned to the API layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretView {
    pub id: SecretId,
    pub key: String,
    pub version: i64,
    pub secret_type: SecretType,
    pub value: String,
    pub secret_value_hidden: bool,
    pub comment: Option<String>,
    pub tags: Vec<String>,
    pub metadata: Vec<SecretMetadataEntry>,
    pub skip_multiline_encoding: bool,
    pub environment: String,
    pub secret_path: SecretPath,
    /// Set when the secret was inherited through an import
    pub imported_from: Option<ImportProvenance>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Render a value for output, escaping newlines when the secret asks for single-line form.
pub fn format_multiline(value: &str, skip_multiline_encoding: bool) -> String {
    if skip_multiline_encoding && value.contains('\n') {
        format!("\"{}\"", value.replace('\n', "\\n"))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_type_round_trip() {
        assert_eq!("personal".parse::<SecretType>().unwrap(), SecretType::Personal);
        assert_eq!(SecretType::Shared.to_string(), "shared");
        assert!("team".parse::<SecretType>().is_err());
    }

    #[test]
    fn test_format_multiline() {
        assert_eq!(format_multiline("a\nb", true), "\"a\\nb\"");
        assert_eq!(format_multiline("a\nb", false), "a\nb");
        assert_eq!(format_multiline("single", true), "single");
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(SecretIdentity::shared("KEY").to_string(), "KEY");
        assert_eq!(SecretIdentity::personal("KEY", "u1").to_string(), "KEY (personal of u1)");
    }
}
