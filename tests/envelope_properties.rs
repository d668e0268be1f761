//! Property tests for the default envelope codec.

use proptest::prelude::*;
use vaultline::domain::{Envelope, ProjectId};
use vaultline::services::{EnvelopeCodec, SecretEncryption, SecretEncryptionConfig};

fn codec() -> SecretEncryption {
    SecretEncryption::new(&SecretEncryptionConfig::for_testing()).expect("test codec")
}

proptest! {
    #[test]
    fn sealed_values_open_only_for_their_project(value in ".{0,256}") {
        let codec = codec();
        let project = ProjectId::new();
        let other = ProjectId::new();

        let envelope = codec.seal_str(&value, &project).unwrap();
        prop_assert_eq!(codec.open_string(&envelope, &project).unwrap(), value);
        prop_assert!(codec.open(&envelope, &other).is_err());
    }

    #[test]
    fn binary_form_survives_storage(value in proptest::collection::vec(any::<u8>(), 0..512)) {
        let codec = codec();
        let project = ProjectId::new();

        let envelope = codec.seal(&value, &project).unwrap();
        let restored = Envelope::from_bytes(&envelope.to_bytes()).unwrap();
        prop_assert!(restored == envelope);
        prop_assert_eq!(codec.open(&restored, &project).unwrap(), value);
    }

    #[test]
    fn blind_index_is_deterministic_per_project(key in "[A-Z_][A-Z0-9_]{0,32}") {
        let codec = codec();
        let project = ProjectId::new();
        let other = ProjectId::new();

        let first = codec.blind_index(&key, &project).unwrap();
        prop_assert_eq!(&first, &codec.blind_index(&key, &project).unwrap());
        prop_assert_ne!(&first, &codec.blind_index(&key, &other).unwrap());
        prop_assert!(!first.contains(&key));
    }
}

#[test]
fn test_sealing_twice_uses_fresh_nonces() {
    let codec = codec();
    let project = ProjectId::new();
    let a = codec.seal_str("same", &project).unwrap();
    let b = codec.seal_str("same", &project).unwrap();
    assert!(a != b);
}

#[test]
fn test_tampered_ciphertext_is_rejected() {
    let codec = codec();
    let project = ProjectId::new();
    let mut envelope = codec.seal_str("payload", &project).unwrap();
    if let Some(byte) = envelope.ciphertext.first_mut() {
        *byte ^= 0x01;
    }
    assert!(codec.open(&envelope, &project).is_err());
}
