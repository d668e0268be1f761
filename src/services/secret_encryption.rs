//! Envelope codec using AES-256-GCM
//!
//! Secret values, comments and encrypted metadata are sealed into [`Envelope`]s before
//! they reach storage or an approval request. Each seal uses a fresh random nonce and
//! binds the owning project id as additional authenticated data, so an envelope copied
//! into another project fails to open.
//!
//! ## Configuration
//!
//! The master key is loaded from the environment variable:
//! `VAULTLINE_SECRET_ENCRYPTION_KEY` - Base64-encoded 32-byte key
//!
//! ## Blind index
//!
//! Secret keys are also indexed with HMAC-SHA256 under a key derived from the master
//! key. The index is deterministic per project and is never reversed; it only supports
//! exact-match lookup without decrypting.

use crate::domain::envelope::{Envelope, ENVELOPE_NONCE_SIZE};
use crate::domain::ProjectId;
use crate::errors::{Result, VaultlineError};
use base64::Engine;
use hmac::{Hmac, Mac};
use ring::aead::{self, Aad, BoundKey, Nonce, NonceSequence, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{debug, error, instrument};
use validator::Validate;
use zeroize::Zeroizing;

/// Size of AES-256-GCM tag in bytes
const TAG_SIZE: usize = 16;

const BLIND_INDEX_KEY_LABEL: &[u8] = b"vaultline/blind-index/v1";

type HmacSha256 = Hmac<Sha256>;

/// Collaborator contract for sealing and opening secret material.
pub trait EnvelopeCodec: Send + Sync {
    /// Seal plaintext, binding it to `project_id`.
    fn seal(&self, plaintext: &[u8], project_id: &ProjectId) -> Result<Envelope>;

    /// Open an envelope sealed for `project_id`.
    fn open(&self, envelope: &Envelope, project_id: &ProjectId) -> Result<Vec<u8>>;

    /// Deterministic, non-reversible token for exact-match lookup.
    fn blind_index(&self, plaintext: &str, project_id: &ProjectId) -> Result<String>;

    fn seal_str(&self, plaintext: &str, project_id: &ProjectId) -> Result<Envelope> {
        self.seal(plaintext.as_bytes(), project_id)
    }

    fn open_string(&self, envelope: &Envelope, project_id: &ProjectId) -> Result<String> {
        let bytes = self.open(envelope, project_id)?;
        String::from_utf8(bytes)
            .map_err(|_| VaultlineError::encryption("Decrypted secret value is not valid UTF-8"))
    }
}

/// Configuration for the secret encryption service
#[derive(Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SecretEncryptionConfig {
    /// Base64-encoded 32-byte master encryption key
    pub master_key_base64: String,
    /// Key version recorded in every envelope
    #[validate(length(min = 1, max = 255, message = "Key version must be 1-255 characters"))]
    pub key_version: String,
}

impl Default for SecretEncryptionConfig {
    fn default() -> Self {
        Self { master_key_base64: String::new(), key_version: "default".to_string() }
    }
}

impl std::fmt::Debug for SecretEncryptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretEncryptionConfig")
            .field("master_key_base64", &"[REDACTED]")
            .field("key_version", &self.key_version)
            .finish()
    }
}

impl SecretEncryptionConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let master_key_base64 = std::env::var("VAULTLINE_SECRET_ENCRYPTION_KEY").map_err(|_| {
            VaultlineError::config(
                "VAULTLINE_SECRET_ENCRYPTION_KEY environment variable not set. \
                 Generate a key with: openssl rand -base64 32",
            )
        })?;

        let key_version =
            std::env::var("VAULTLINE_SECRET_KEY_VERSION").unwrap_or_else(|_| "default".to_string());

        Ok(Self { master_key_base64, key_version })
    }

    /// Deterministic configuration for tests. Never use outside tests.
    pub fn for_testing() -> Self {
        let test_key = [0x42u8; 32];
        Self {
            master_key_base64: base64::engine::general_purpose::STANDARD.encode(test_key),
            key_version: "test".to_string(),
        }
    }
}

/// Single-use nonce sequence for AES-GCM
struct SingleNonce {
    nonce: Option<[u8; ENVELOPE_NONCE_SIZE]>,
}

impl SingleNonce {
    fn new(nonce_bytes: [u8; ENVELOPE_NONCE_SIZE]) -> Self {
        Self { nonce: Some(nonce_bytes) }
    }
}

impl NonceSequence for SingleNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        self.nonce.take().map(Nonce::assume_unique_for_key).ok_or(ring::error::Unspecified)
    }
}

/// AES-256-GCM envelope codec
#[derive(Clone)]
pub struct SecretEncryption {
    key_bytes: Arc<Zeroizing<[u8; 32]>>,
    blind_index_key: Arc<Zeroizing<Vec<u8>>>,
    key_version: String,
    rng: Arc<SystemRandom>,
}

impl SecretEncryption {
    /// Create a new encryption service from configuration
    pub fn new(config: &SecretEncryptionConfig) -> Result<Self> {
        if config.master_key_base64.is_empty() {
            return Err(VaultlineError::config(
                "Secret encryption key is not configured. \
                 Generate a key with: openssl rand -base64 32",
            ));
        }

        let key_bytes = Zeroizing::new(
            base64::engine::general_purpose::STANDARD.decode(&config.master_key_base64).map_err(
                |e| VaultlineError::config(format!("Invalid base64 in secret encryption key: {}", e)),
            )?,
        );

        if key_bytes.len() != 32 {
            return Err(VaultlineError::config(format!(
                "Secret encryption key must be 32 bytes (256 bits), got {} bytes",
                key_bytes.len()
            )));
        }

        if config.key_version.is_empty() || config.key_version.len() > u8::MAX as usize {
            return Err(VaultlineError::config("Key version must be 1-255 bytes"));
        }

        let mut key_array = Zeroizing::new([0u8; 32]);
        key_array.copy_from_slice(&key_bytes);

        let mut derive = HmacSha256::new_from_slice(&key_array[..])
            .map_err(|_| VaultlineError::internal("Failed to derive blind index key"))?;
        derive.update(BLIND_INDEX_KEY_LABEL);
        let blind_index_key = Zeroizing::new(derive.finalize().into_bytes().to_vec());

        debug!(key_version = %config.key_version, "Secret encryption service initialized");

        Ok(Self {
            key_bytes: Arc::new(key_array),
            blind_index_key: Arc::new(blind_index_key),
            key_version: config.key_version.clone(),
            rng: Arc::new(SystemRandom::new()),
        })
    }

    /// Get the current key version
    pub fn key_version(&self) -> &str {
        &self.key_version
    }

    fn unbound_key(&self) -> Result<UnboundKey> {
        UnboundKey::new(&AES_256_GCM, &self.key_bytes[..]).map_err(|_| {
            error!("Failed to create encryption key");
            VaultlineError::encryption("Failed to create encryption key")
        })
    }
}

impl EnvelopeCodec for SecretEncryption {
    #[instrument(skip(self, plaintext, project_id), fields(plaintext_len = plaintext.len(), project_id = %project_id))]
    fn seal(&self, plaintext: &[u8], project_id: &ProjectId) -> Result<Envelope> {
        let mut nonce_bytes = [0u8; ENVELOPE_NONCE_SIZE];
        self.rng.fill(&mut nonce_bytes).map_err(|_| {
            error!("Failed to generate random nonce");
            VaultlineError::encryption("Failed to generate random nonce for encryption")
        })?;

        let mut sealing_key =
            aead::SealingKey::new(self.unbound_key()?, SingleNonce::new(nonce_bytes));

        let mut ciphertext = Vec::with_capacity(plaintext.len() + TAG_SIZE);
        ciphertext.extend_from_slice(plaintext);

        sealing_key
            .seal_in_place_append_tag(Aad::from(project_id.as_str().as_bytes()), &mut ciphertext)
            .map_err(|_| {
                error!("Encryption failed");
                VaultlineError::encryption("Failed to encrypt secret data")
            })?;

        Ok(Envelope { key_version: self.key_version.clone(), nonce: nonce_bytes, ciphertext })
    }

    #[instrument(skip(self, envelope, project_id), fields(ciphertext_len = envelope.ciphertext.len(), project_id = %project_id))]
    fn open(&self, envelope: &Envelope, project_id: &ProjectId) -> Result<Vec<u8>> {
        if envelope.key_version != self.key_version {
            return Err(VaultlineError::encryption(format!(
                "Envelope sealed with unknown key version '{}'",
                envelope.key_version
            )));
        }

        if envelope.ciphertext.len() < TAG_SIZE {
            return Err(VaultlineError::encryption(
                "Ciphertext too short (missing authentication tag)",
            ));
        }

        let mut opening_key =
            aead::OpeningKey::new(self.unbound_key()?, SingleNonce::new(envelope.nonce));

        let mut buffer = envelope.ciphertext.clone();
        let plaintext = opening_key
            .open_in_place(Aad::from(project_id.as_str().as_bytes()), &mut buffer)
            .map_err(|_| {
                error!("Decryption failed - possible tampering, wrong key or wrong project");
                VaultlineError::encryption("Failed to decrypt secret data - authentication failed")
            })?;

        Ok(plaintext.to_vec())
    }

    fn blind_index(&self, plaintext: &str, project_id: &ProjectId) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(&self.blind_index_key)
            .map_err(|_| VaultlineError::internal("Invalid blind index key"))?;
        mac.update(project_id.as_str().as_bytes());
        mac.update(&[0u8]);
        mac.update(plaintext.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

impl std::fmt::Debug for SecretEncryption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretEncryption")
            .field("key_version", &self.key_version)
            .field("key_bytes", &"[REDACTED]")
            .finish()
    }
}
