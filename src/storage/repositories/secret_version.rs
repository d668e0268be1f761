//! Secret version history
//!
//! One row per committed version of a secret. History is append-only and is kept
//! after the live secret is deleted.

use super::secret::{encode_metadata, encode_tags};
use crate::domain::{
    Envelope, FolderId, SecretId, SecretRecord, SecretType, SecretVersionId, SecretVersionRecord,
};
use crate::errors::{Result, VaultlineError};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqliteConnection};
use std::str::FromStr;
use tracing::instrument;

const VERSION_COLUMNS: &str = "id, secret_id, folder_id, key, secret_type, owner_actor_id, version, \
     encrypted_value, encrypted_comment, skip_multiline_encoding, tags, metadata, actor_id, created_at";

#[derive(Debug, Clone, FromRow)]
struct SecretVersionRow {
    pub id: String,
    pub secret_id: String,
    pub folder_id: String,
    pub key: String,
    pub secret_type: String,
    pub owner_actor_id: Option<String>,
    pub version: i64,
    pub encrypted_value: Vec<u8>,
    pub encrypted_comment: Option<Vec<u8>>,
    pub skip_multiline_encoding: bool,
    pub tags: String,
    pub metadata: String,
    pub actor_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<SecretVersionRow> for SecretVersionRecord {
    type Error = VaultlineError;

    fn try_from(row: SecretVersionRow) -> Result<Self> {
        Ok(SecretVersionRecord {
            id: SecretVersionId::from_string(row.id),
            secret_id: SecretId::from_string(row.secret_id),
            folder_id: FolderId::from_string(row.folder_id),
            key: row.key,
            secret_type: SecretType::from_str(&row.secret_type)?,
            owner_actor_id: row.owner_actor_id,
            version: row.version,
            value: Envelope::from_bytes(&row.encrypted_value)?,
            comment: row.encrypted_comment.as_deref().map(Envelope::from_bytes).transpose()?,
            skip_multiline_encoding: row.skip_multiline_encoding,
            tags: serde_json::from_str(&row.tags)?,
            metadata: serde_json::from_str(&row.metadata)?,
            actor_id: row.actor_id,
            created_at: row.created_at,
        })
    }
}

pub struct SecretVersionRepository;

impl SecretVersionRepository {
    /// Snapshot the live record as its current version.
    #[instrument(skip(conn, record), fields(secret_id = %record.id, version = record.version), name = "db_insert_secret_version")]
    pub async fn record(
        conn: &mut SqliteConnection,
        record: &SecretRecord,
        actor_id: Option<&str>,
    ) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO secret_versions ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            VERSION_COLUMNS
        ))
        .bind(SecretVersionId::new().as_str())
        .bind(record.id.as_str())
        .bind(record.folder_id.as_str())
        .bind(&record.key)
        .bind(record.secret_type.as_str())
        .bind(&record.owner_actor_id)
        .bind(record.version)
        .bind(record.value.to_bytes())
        .bind(record.comment.as_ref().map(Envelope::to_bytes))
        .bind(record.skip_multiline_encoding)
        .bind(encode_tags(&record.tags)?)
        .bind(encode_metadata(&record.metadata)?)
        .bind(actor_id)
        .bind(record.updated_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, secret_id = %record.id, version = record.version, "Failed to record secret version");
            VaultlineError::Database {
                source: e,
                context: format!("Failed to record version {} of secret '{}'", record.version, record.key),
            }
        })?;

        Ok(())
    }

    /// All versions of a secret, newest first.
    #[instrument(skip(conn), fields(secret_id = %secret_id), name = "db_list_secret_versions")]
    pub async fn list_by_secret(
        conn: &mut SqliteConnection,
        secret_id: &SecretId,
    ) -> Result<Vec<SecretVersionRecord>> {
        let rows = sqlx::query_as::<_, SecretVersionRow>(&format!(
            "SELECT {} FROM secret_versions WHERE secret_id = ? ORDER BY version DESC",
            VERSION_COLUMNS
        ))
        .bind(secret_id.as_str())
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, secret_id = %secret_id, "Failed to list secret versions");
            VaultlineError::Database {
                source: e,
                context: format!("Failed to list versions of secret '{}'", secret_id),
            }
        })?;

        rows.into_iter().map(SecretVersionRecord::try_from).collect()
    }

    #[instrument(skip(conn), fields(secret_id = %secret_id, version), name = "db_get_secret_version")]
    pub async fn get(
        conn: &mut SqliteConnection,
        secret_id: &SecretId,
        version: i64,
    ) -> Result<Option<SecretVersionRecord>> {
        let row = sqlx::query_as::<_, SecretVersionRow>(&format!(
            "SELECT {} FROM secret_versions WHERE secret_id = ? AND version = ?",
            VERSION_COLUMNS
        ))
        .bind(secret_id.as_str())
        .bind(version)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, secret_id = %secret_id, version, "Failed to get secret version");
            VaultlineError::Database {
                source: e,
                context: format!("Failed to get version {} of secret '{}'", version, secret_id),
            }
        })?;

        row.map(SecretVersionRecord::try_from).transpose()
    }
}
