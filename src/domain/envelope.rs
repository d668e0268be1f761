//! Sealed value container.
//!
//! An [`Envelope`] is the only form in which secret values, comments and encrypted
//! metadata are stored or captured in approval requests. Its binary layout is:
//!
//! ```text
//! [format: u8][key_version_len: u8][key_version bytes][nonce: 12 bytes][ciphertext + tag]
//! ```

use crate::errors::{Result, VaultlineError};
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const ENVELOPE_FORMAT_V1: u8 = 1;
pub const ENVELOPE_NONCE_SIZE: usize = 12;

#[derive(Clone, PartialEq, Eq)]
pub struct Envelope {
    pub key_version: String,
    pub nonce: [u8; ENVELOPE_NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    pub fn to_bytes(&self) -> Vec<u8> {
        let version = self.key_version.as_bytes();
        let mut out = Vec::with_capacity(2 + version.len() + ENVELOPE_NONCE_SIZE + self.ciphertext.len());
        out.push(ENVELOPE_FORMAT_V1);
        out.push(version.len() as u8);
        out.extend_from_slice(version);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (&format, rest) =
            bytes.split_first().ok_or_else(|| VaultlineError::encryption("Envelope is empty"))?;
        if format != ENVELOPE_FORMAT_V1 {
            return Err(VaultlineError::encryption(format!(
                "Unsupported envelope format {}",
                format
            )));
        }
        let (&version_len, rest) = rest
            .split_first()
            .ok_or_else(|| VaultlineError::encryption("Envelope header truncated"))?;
        let version_len = version_len as usize;
        if rest.len() < version_len + ENVELOPE_NONCE_SIZE {
            return Err(VaultlineError::encryption("Envelope header truncated"));
        }
        let (version, rest) = rest.split_at(version_len);
        let (nonce, ciphertext) = rest.split_at(ENVELOPE_NONCE_SIZE);

        let key_version = String::from_utf8(version.to_vec())
            .map_err(|_| VaultlineError::encryption("Envelope key version is not UTF-8"))?;
        let mut nonce_bytes = [0u8; ENVELOPE_NONCE_SIZE];
        nonce_bytes.copy_from_slice(nonce);

        Ok(Self { key_version, nonce: nonce_bytes, ciphertext: ciphertext.to_vec() })
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("key_version", &self.key_version)
            .field("ciphertext_len", &self.ciphertext.len())
            .finish()
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(self.to_bytes()))
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)?;
        Envelope::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}
