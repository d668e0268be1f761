//! Secret repository
//!
//! Stores live secret rows. Values, comments and encrypted metadata entries arrive
//! already sealed; this layer never sees plaintext. Every update and delete is a
//! compare-and-swap on `version` so a concurrent writer surfaces as a conflict
//! rather than a lost update.

use crate::domain::{
    Envelope, FolderId, SecretId, SecretIdentity, SecretRecord, SecretType, StoredMetadataEntry,
};
use crate::errors::{ConflictKind, Result, VaultlineError};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqliteConnection};
use std::str::FromStr;
use tracing::instrument;

const SECRET_COLUMNS: &str = "id, folder_id, key, key_blind_index, secret_type, owner_actor_id, version, \
     encrypted_value, encrypted_comment, skip_multiline_encoding, tags, metadata, created_at, updated_at";

#[derive(Debug, Clone, FromRow)]
struct SecretRow {
    pub id: String,
    pub folder_id: String,
    pub key: String,
    pub key_blind_index: String,
    pub secret_type: String,
    pub owner_actor_id: Option<String>,
    pub version: i64,
    pub encrypted_value: Vec<u8>,
    pub encrypted_comment: Option<Vec<u8>>,
    pub skip_multiline_encoding: bool,
    pub tags: String, // JSON array
    pub metadata: String, // JSON array
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<SecretRow> for SecretRecord {
    type Error = VaultlineError;

    fn try_from(row: SecretRow) -> Result<Self> {
        Ok(SecretRecord {
            id: SecretId::from_string(row.id),
            folder_id: FolderId::from_string(row.folder_id),
            key: row.key,
            key_blind_index: row.key_blind_index,
            secret_type: SecretType::from_str(&row.secret_type)?,
            owner_actor_id: row.owner_actor_id,
            version: row.version,
            value: Envelope::from_bytes(&row.encrypted_value)?,
            comment: row.encrypted_comment.as_deref().map(Envelope::from_bytes).transpose()?,
            skip_multiline_encoding: row.skip_multiline_encoding,
            tags: serde_json::from_str(&row.tags).map_err(|e| {
                VaultlineError::internal(format!("Invalid stored tags JSON: {}", e))
            })?,
            metadata: serde_json::from_str(&row.metadata).map_err(|e| {
                VaultlineError::internal(format!("Invalid stored metadata JSON: {}", e))
            })?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_records(rows: Vec<SecretRow>) -> Result<Vec<SecretRecord>> {
    rows.into_iter().map(SecretRecord::try_from).collect()
}

pub(crate) fn encode_tags(tags: &[String]) -> Result<String> {
    Ok(serde_json::to_string(tags)?)
}

pub(crate) fn encode_metadata(metadata: &[StoredMetadataEntry]) -> Result<String> {
    Ok(serde_json::to_string(metadata)?)
}

pub struct SecretRepository;

impl SecretRepository {
    /// Insert a new live secret exactly as given.
    #[instrument(skip(conn, record), fields(secret_id = %record.id, folder_id = %record.folder_id), name = "db_insert_secret")]
    pub async fn insert(conn: &mut SqliteConnection, record: &SecretRecord) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO secrets ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            SECRET_COLUMNS
        ))
        .bind(record.id.as_str())
        .bind(record.folder_id.as_str())
        .bind(&record.key)
        .bind(&record.key_blind_index)
        .bind(record.secret_type.as_str())
        .bind(&record.owner_actor_id)
        .bind(record.version)
        .bind(record.value.to_bytes())
        .bind(record.comment.as_ref().map(Envelope::to_bytes))
        .bind(record.skip_multiline_encoding)
        .bind(encode_tags(&record.tags)?)
        .bind(encode_metadata(&record.metadata)?)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            if super::is_unique_violation(&e) {
                return VaultlineError::conflict(
                    ConflictKind::AlreadyExists,
                    format!("Secret '{}' already exists in this folder", record.identity()),
                );
            }
            tracing::error!(error = %e, secret_id = %record.id, "Failed to insert secret");
            VaultlineError::Database {
                source: e,
                context: format!("Failed to insert secret '{}'", record.key),
            }
        })?;

        Ok(())
    }

    #[instrument(skip(conn), fields(secret_id = %id), name = "db_get_secret")]
    pub async fn get_by_id(conn: &mut SqliteConnection, id: &SecretId) -> Result<Option<SecretRecord>> {
        let row = sqlx::query_as::<_, SecretRow>(&format!(
            "SELECT {} FROM secrets WHERE id = ?",
            SECRET_COLUMNS
        ))
        .bind(id.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, secret_id = %id, "Failed to get secret");
            VaultlineError::Database { source: e, context: format!("Failed to get secret '{}'", id) }
        })?;

        row.map(SecretRecord::try_from).transpose()
    }

    #[instrument(skip(conn, identity), fields(folder_id = %folder_id, key = %identity.key), name = "db_find_secret")]
    pub async fn find_by_identity(
        conn: &mut SqliteConnection,
        folder_id: &FolderId,
        identity: &SecretIdentity,
    ) -> Result<Option<SecretRecord>> {
        let row = sqlx::query_as::<_, SecretRow>(&format!(
            "SELECT {} FROM secrets \
             WHERE folder_id = ? AND key = ? AND secret_type = ? AND COALESCE(owner_actor_id, '') = ?",
            SECRET_COLUMNS
        ))
        .bind(folder_id.as_str())
        .bind(&identity.key)
        .bind(identity.secret_type.as_str())
        .bind(identity.owner_actor_id.as_deref().unwrap_or(""))
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, folder_id = %folder_id, key = %identity.key, "Failed to find secret");
            VaultlineError::Database {
                source: e,
                context: format!("Failed to find secret '{}'", identity),
            }
        })?;

        row.map(SecretRecord::try_from).transpose()
    }

    /// Shared secrets of a folder, ordered by key.
    #[instrument(skip(conn), fields(folder_id = %folder_id), name = "db_list_shared_secrets")]
    pub async fn list_shared(
        conn: &mut SqliteConnection,
        folder_id: &FolderId,
    ) -> Result<Vec<SecretRecord>> {
        let rows = sqlx::query_as::<_, SecretRow>(&format!(
            "SELECT {} FROM secrets WHERE folder_id = ? AND secret_type = 'shared' ORDER BY key",
            SECRET_COLUMNS
        ))
        .bind(folder_id.as_str())
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, folder_id = %folder_id, "Failed to list shared secrets");
            VaultlineError::Database {
                source: e,
                context: format!("Failed to list secrets of folder '{}'", folder_id),
            }
        })?;

        into_records(rows)
    }

    /// Personal secrets `owner` holds in a folder, ordered by key.
    #[instrument(skip(conn), fields(folder_id = %folder_id), name = "db_list_personal_secrets")]
    pub async fn list_personal(
        conn: &mut SqliteConnection,
        folder_id: &FolderId,
        owner: &str,
    ) -> Result<Vec<SecretRecord>> {
        let rows = sqlx::query_as::<_, SecretRow>(&format!(
            "SELECT {} FROM secrets \
             WHERE folder_id = ? AND secret_type = 'personal' AND owner_actor_id = ? ORDER BY key",
            SECRET_COLUMNS
        ))
        .bind(folder_id.as_str())
        .bind(owner)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, folder_id = %folder_id, "Failed to list personal secrets");
            VaultlineError::Database {
                source: e,
                context: format!("Failed to list personal secrets of folder '{}'", folder_id),
            }
        })?;

        into_records(rows)
    }

    /// Overwrite a live row if it is still at `expected_version`. Returns false when
    /// another writer got there first.
    #[instrument(skip(conn, record), fields(secret_id = %record.id, expected_version), name = "db_update_secret")]
    pub async fn update_if_version(
        conn: &mut SqliteConnection,
        record: &SecretRecord,
        expected_version: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE secrets SET folder_id = ?, key = ?, key_blind_index = ?, version = ?, encrypted_value = ?, \
             encrypted_comment = ?, skip_multiline_encoding = ?, tags = ?, metadata = ?, updated_at = ? \
             WHERE id = ? AND version = ?",
        )
        .bind(record.folder_id.as_str())
        .bind(&record.key)
        .bind(&record.key_blind_index)
        .bind(record.version)
        .bind(record.value.to_bytes())
        .bind(record.comment.as_ref().map(Envelope::to_bytes))
        .bind(record.skip_multiline_encoding)
        .bind(encode_tags(&record.tags)?)
        .bind(encode_metadata(&record.metadata)?)
        .bind(record.updated_at)
        .bind(record.id.as_str())
        .bind(expected_version)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, secret_id = %record.id, "Failed to update secret");
            VaultlineError::Database {
                source: e,
                context: format!("Failed to update secret '{}'", record.key),
            }
        })?;

        Ok(result.rows_affected() == 1)
    }

    /// Delete a live row if it is still at `expected_version`.
    #[instrument(skip(conn), fields(secret_id = %id), name = "db_delete_secret")]
    pub async fn delete_if_version(
        conn: &mut SqliteConnection,
        id: &SecretId,
        expected_version: i64,
    ) -> Result<bool> {
        let result = sqlx::query("DELETE FROM secrets WHERE id = ? AND version = ?")
            .bind(id.as_str())
            .bind(expected_version)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, secret_id = %id, "Failed to delete secret");
                VaultlineError::Database {
                    source: e,
                    context: format!("Failed to delete secret '{}'", id),
                }
            })?;

        Ok(result.rows_affected() == 1)
    }
}
