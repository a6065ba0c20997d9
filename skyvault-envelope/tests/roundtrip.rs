use serde_json::json;
use skyvault_envelope::{
    decrypt_payload, encrypt_payload, encrypt_payload_with, verify_file, DeviceIdentity,
    EnvelopeError, ALGORITHM, DEFAULT_ITERATIONS, KDF, MIN_ITERATIONS,
};

fn device() -> DeviceIdentity {
    DeviceIdentity {
        id: "0011223344556677".into(),
        name: "test-laptop".into(),
        app_version: "2.3.1".into(),
    }
}

// Tests derive with the floor count; the default-count path is covered once
// below, since 600k iterations is deliberately slow.
fn seal(payload: &serde_json::Value, password: &str, prior: u64) -> skyvault_envelope::SyncedFile {
    encrypt_payload_with(payload, password, MIN_ITERATIONS, &device(), prior, 1_700_000_000_000)
        .unwrap()
}

#[test]
fn roundtrip_basic() {
    let payload = json!({
        "hosts": [{"id": "h1"}],
        "keys": [],
        "snippets": [],
        "customGroups": ["A/B"],
        "syncedAt": 1_700_000_000_000i64
    });
    let file = seal(&payload, "correct horse battery staple", 3);
    assert_eq!(file.meta.version, 4);
    assert_eq!(file.meta.updated_at, 1_700_000_000_000);
    assert_eq!(file.meta.algorithm, ALGORITHM);
    assert_eq!(file.meta.kdf, KDF);

    let restored: serde_json::Value =
        decrypt_payload(&file, "correct horse battery staple").unwrap();
    assert_eq!(restored, payload);
}

#[test]
fn roundtrip_preserves_sequence_order() {
    let payload = json!({
        "hosts": [{"id": "z"}, {"id": "a"}, {"id": "m"}],
        "customGroups": ["z", "a", "m"],
        "syncedAt": 1i64
    });
    let file = seal(&payload, "pw", 0);
    let restored: serde_json::Value = decrypt_payload(&file, "pw").unwrap();
    assert_eq!(restored["hosts"], payload["hosts"]);
    assert_eq!(restored["customGroups"], payload["customGroups"]);
}

#[test]
fn roundtrip_survives_json_reserialization() {
    let payload = json!({"snippets": [], "syncedAt": 2i64});
    let file = seal(&payload, "pw", 0);
    let parsed = skyvault_envelope::SyncedFile::from_json(&file.to_json()).unwrap();
    assert_eq!(parsed, file);
    let restored: serde_json::Value = decrypt_payload(&parsed, "pw").unwrap();
    assert_eq!(restored, payload);
}

#[test]
fn wrong_password_is_uniform() {
    let file = seal(&json!({"syncedAt": 0i64}), "right", 0);
    let err = decrypt_payload::<serde_json::Value>(&file, "wrong").unwrap_err();
    assert_eq!(err, EnvelopeError::WrongPassword);
}

#[test]
fn verify_file_discards_plaintext() {
    let file = seal(&json!({"syncedAt": 0i64}), "right", 0);
    assert!(verify_file(&file, "right").unwrap());
    assert!(!verify_file(&file, "wrong").unwrap());
}

#[test]
fn fresh_iv_and_salt_per_encryption() {
    let payload = json!({"syncedAt": 0i64});
    let a = seal(&payload, "pw", 0);
    let b = seal(&payload, "pw", 0);
    assert_ne!(a.meta.iv, b.meta.iv);
    assert_ne!(a.meta.salt, b.meta.salt);
    // Same plaintext, same password: ciphertext still differs.
    assert_ne!(a.payload, b.payload);
}

#[test]
fn version_increments_from_prior() {
    let payload = json!({"syncedAt": 0i64});
    assert_eq!(seal(&payload, "pw", 0).meta.version, 1);
    assert_eq!(seal(&payload, "pw", 41).meta.version, 42);
}

#[test]
fn default_iteration_count_is_stamped() {
    let file = encrypt_payload(&json!({"syncedAt": 0i64}), "pw", &device(), 0, 5).unwrap();
    assert_eq!(file.meta.kdf_iterations, DEFAULT_ITERATIONS);
    let restored: serde_json::Value = decrypt_payload(&file, "pw").unwrap();
    assert_eq!(restored["syncedAt"], 0);
}

#[test]
fn weak_iteration_count_is_rejected_on_both_paths() {
    let err = encrypt_payload_with(&json!({}), "pw", 50_000, &device(), 0, 0).unwrap_err();
    assert_eq!(err, EnvelopeError::WeakKdfParams { iterations: 50_000 });

    let mut file = seal(&json!({"syncedAt": 0i64}), "pw", 0);
    file.meta.kdf_iterations = 1_000;
    let err = decrypt_payload::<serde_json::Value>(&file, "pw").unwrap_err();
    assert_eq!(err, EnvelopeError::WeakKdfParams { iterations: 1_000 });
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        // Each case pays two full derives; keep the count low.
        #![proptest_config(ProptestConfig::with_cases(4))]

        #[test]
        fn arbitrary_payloads_round_trip(
            hosts in proptest::collection::vec("[a-z0-9]{1,12}", 0..5),
            synced_at in 0i64..4_000_000_000_000i64,
        ) {
            let payload = json!({"hosts": hosts, "syncedAt": synced_at});
            let file = seal(&payload, "prop-pw", 0);
            let restored: serde_json::Value = decrypt_payload(&file, "prop-pw").unwrap();
            prop_assert_eq!(restored, payload);
        }
    }
}
