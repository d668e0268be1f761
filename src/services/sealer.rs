//! Plaintext mutations to sealed operations, and back for views.
//!
//! Everything that crosses into the gate or the applier is sealed here first:
//! values, comments and encrypted metadata become envelopes bound to the project,
//! keys get their blind index, and reference edges are extracted from the
//! plaintext while it is still at hand.

use super::secret_encryption::EnvelopeCodec;
use crate::domain::reference::{extract_edges, validate_secret_key};
use crate::domain::{
    ActorContext, CreateSecret, DeleteSecret, Envelope, ProjectId, SealedCreate, SealedDelete,
    SealedUpdate, SecretIdentity, SecretMetadataEntry, SecretType, StoredMetadataEntry, UpdateSecret,
};
use crate::errors::{Result, VaultlineError};
use std::collections::HashSet;

pub struct Sealer<'a> {
    codec: &'a dyn EnvelopeCodec,
    project_id: &'a ProjectId,
}

impl<'a> Sealer<'a> {
    pub fn new(codec: &'a dyn EnvelopeCodec, project_id: &'a ProjectId) -> Self {
        Self { codec, project_id }
    }

    /// Identity of `key` for `actor`. Personal secrets belong to the acting user or identity.
    pub fn identity(&self, actor: &ActorContext, key: &str, secret_type: SecretType) -> Result<SecretIdentity> {
        validate_secret_key(key)?;
        match secret_type {
            SecretType::Shared => Ok(SecretIdentity::shared(key)),
            SecretType::Personal => actor
                .personal_owner()
                .map(|owner| SecretIdentity::personal(key, owner))
                .ok_or_else(|| {
                    VaultlineError::validation_field(
                        format!("A {} actor cannot own personal secrets", actor.kind),
                        "secret_type",
                    )
                }),
        }
    }

    pub fn create(&self, actor: &ActorContext, create: &CreateSecret) -> Result<SealedCreate> {
        let identity = self.identity(actor, &create.key, create.secret_type)?;
        Ok(SealedCreate {
            key_blind_index: self.codec.blind_index(&identity.key, self.project_id)?,
            identity,
            references: extract_edges(&create.value)?,
            value: self.codec.seal_str(&create.value, self.project_id)?,
            comment: self.seal_comment(create.comment.as_deref())?,
            skip_multiline_encoding: create.skip_multiline_encoding,
            tags: normalize_tags(&create.tags),
            metadata: self.seal_metadata(&create.metadata)?,
        })
    }

    pub fn update(&self, actor: &ActorContext, update: &UpdateSecret) -> Result<SealedUpdate> {
        let identity = self.identity(actor, &update.key, update.secret_type)?;

        let new_key = update.new_key.as_ref().filter(|new_key| **new_key != update.key);
        let new_key_blind_index = match new_key {
            Some(new_key) => {
                validate_secret_key(new_key)?;
                Some(self.codec.blind_index(new_key, self.project_id)?)
            }
            None => None,
        };

        let (value, references) = match &update.value {
            Some(value) => (Some(self.codec.seal_str(value, self.project_id)?), Some(extract_edges(value)?)),
            None => (None, None),
        };

        Ok(SealedUpdate {
            identity,
            expected_version: update.expected_version,
            new_key: new_key.cloned(),
            new_key_blind_index,
            value,
            comment: self.seal_comment(update.comment.as_deref())?,
            skip_multiline_encoding: update.skip_multiline_encoding,
            tags: update.tags.as_deref().map(normalize_tags),
            metadata: update.metadata.as_deref().map(|m| self.seal_metadata(m)).transpose()?,
            references,
        })
    }

    pub fn delete(&self, actor: &ActorContext, delete: &DeleteSecret) -> Result<SealedDelete> {
        Ok(SealedDelete {
            identity: self.identity(actor, &delete.key, delete.secret_type)?,
            expected_version: delete.expected_version,
        })
    }

    fn seal_comment(&self, comment: Option<&str>) -> Result<Option<Envelope>> {
        comment.map(|c| self.codec.seal_str(c, self.project_id)).transpose()
    }

    pub fn seal_metadata(&self, entries: &[SecretMetadataEntry]) -> Result<Vec<StoredMetadataEntry>> {
        let mut seen = HashSet::new();
        entries
            .iter()
            .map(|entry| {
                if entry.key.trim().is_empty() {
                    return Err(VaultlineError::validation_field("Metadata keys cannot be empty", "metadata"));
                }
                if !seen.insert(entry.key.as_str()) {
                    return Err(VaultlineError::validation_field(
                        format!("Duplicate metadata key '{}'", entry.key),
                        "metadata",
                    ));
                }
                Ok(if entry.is_encrypted {
                    StoredMetadataEntry {
                        key: entry.key.clone(),
                        value: None,
                        encrypted_value: Some(self.codec.seal_str(&entry.value, self.project_id)?),
                    }
                } else {
                    StoredMetadataEntry { key: entry.key.clone(), value: Some(entry.value.clone()), encrypted_value: None }
                })
            })
            .collect()
    }

    pub fn open_metadata(&self, entries: &[StoredMetadataEntry]) -> Result<Vec<SecretMetadataEntry>> {
        entries
            .iter()
            .map(|entry| match (&entry.encrypted_value, &entry.value) {
                (Some(envelope), _) => Ok(SecretMetadataEntry::encrypted(
                    entry.key.clone(),
                    self.codec.open_string(envelope, self.project_id)?,
                )),
                (None, value) => {
                    Ok(SecretMetadataEntry::plain(entry.key.clone(), value.clone().unwrap_or_default()))
                }
            })
            .collect()
    }

    pub fn open_comment(&self, comment: Option<&Envelope>) -> Result<Option<String>> {
        comment.map(|c| self.codec.open_string(c, self.project_id)).transpose()
    }

    pub fn open_value(&self, value: &Envelope) -> Result<String> {
        self.codec.open_string(value, self.project_id)
    }
}

fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    tags.iter().filter(|tag| seen.insert(tag.as_str())).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ActorKind;
    use crate::services::secret_encryption::{SecretEncryption, SecretEncryptionConfig};

    fn codec() -> SecretEncryption {
        SecretEncryption::new(&SecretEncryptionConfig::for_testing()).unwrap()
    }

    #[test]
    fn test_create_extracts_edges_and_seals() {
        let codec = codec();
        let project = ProjectId::new();
        let sealer = Sealer::new(&codec, &project);
        let actor = ActorContext::user("u1", "org");

        let mut create = CreateSecret::new("DSN", "pg://${prod.db.HOST}:${PORT}");
        create.tags = vec!["a".into(), "b".into(), "a".into()];
        create.metadata = vec![SecretMetadataEntry::plain("team", "core"), SecretMetadataEntry::encrypted("owner", "x")];
        let sealed = sealer.create(&actor, &create).unwrap();

        assert_eq!(sealed.references.len(), 2);
        assert_eq!(sealed.tags, vec!["a", "b"]);
        assert_eq!(sealer.open_value(&sealed.value).unwrap(), "pg://${prod.db.HOST}:${PORT}");
        assert_eq!(sealed.key_blind_index, codec.blind_index("DSN", &project).unwrap());
        assert_eq!(sealer.open_metadata(&sealed.metadata).unwrap(), create.metadata);
        assert!(sealed.metadata[1].value.is_none());
    }

    #[test]
    fn test_personal_needs_owner_capable_actor() {
        let codec = codec();
        let project = ProjectId::new();
        let sealer = Sealer::new(&codec, &project);

        let user = ActorContext::user("u1", "org");
        let sealed = sealer.create(&user, &CreateSecret::new("K", "v").personal()).unwrap();
        assert_eq!(sealed.identity.owner_actor_id.as_deref(), Some("u1"));

        let service = ActorContext::new(ActorKind::Service, "svc", "org");
        assert!(sealer.create(&service, &CreateSecret::new("K", "v").personal()).is_err());
    }

    #[test]
    fn test_invalid_key_and_reference_rejected() {
        let codec = codec();
        let project = ProjectId::new();
        let sealer = Sealer::new(&codec, &project);
        let actor = ActorContext::user("u1", "org");

        assert!(sealer.create(&actor, &CreateSecret::new("bad key", "v")).is_err());
        assert!(sealer.create(&actor, &CreateSecret::new("K", "${.KEY}")).is_err());

        let mut update = UpdateSecret::value("K", "v");
        update.new_key = Some("K".into());
        assert!(sealer.update(&actor, &update).unwrap().new_key.is_none());
    }

    #[test]
    fn test_duplicate_metadata_keys_rejected() {
        let codec = codec();
        let project = ProjectId::new();
        let sealer = Sealer::new(&codec, &project);
        let entries = vec![SecretMetadataEntry::plain("a", "1"), SecretMetadataEntry::plain("a", "2")];
        assert!(sealer.seal_metadata(&entries).is_err());
    }
}
