//! Tampering with any part of a synced file must fail closed.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::json;
use skyvault_envelope::{
    decrypt_payload, encrypt_payload_with, DeviceIdentity, EnvelopeError, SyncedFile,
    MIN_ITERATIONS,
};

fn sealed() -> SyncedFile {
    let device = DeviceIdentity {
        id: "dev".into(),
        name: "box".into(),
        app_version: "1.0".into(),
    };
    encrypt_payload_with(
        &json!({"hosts": [{"id": "h1"}], "syncedAt": 1i64}),
        "pw",
        MIN_ITERATIONS,
        &device,
        0,
        1_000,
    )
    .unwrap()
}

fn flip_byte(b64_field: &str, index: usize) -> String {
    let mut bytes = STANDARD.decode(b64_field).unwrap();
    bytes[index] ^= 0x01;
    STANDARD.encode(bytes)
}

#[test]
fn flipped_payload_byte_fails_authentication() {
    let mut file = sealed();
    let len = STANDARD.decode(&file.payload).unwrap().len();
    for index in [0, len / 2, len - 1] {
        let original = file.payload.clone();
        file.payload = flip_byte(&original, index);
        let err = decrypt_payload::<serde_json::Value>(&file, "pw").unwrap_err();
        assert_eq!(err, EnvelopeError::WrongPassword, "byte {}", index);
        file.payload = original;
    }
}

#[test]
fn flipped_iv_byte_fails_authentication() {
    let mut file = sealed();
    file.meta.iv = flip_byte(&file.meta.iv, 0);
    let err = decrypt_payload::<serde_json::Value>(&file, "pw").unwrap_err();
    assert_eq!(err, EnvelopeError::WrongPassword);
}

#[test]
fn flipped_salt_byte_fails_authentication() {
    let mut file = sealed();
    file.meta.salt = flip_byte(&file.meta.salt, 16);
    let err = decrypt_payload::<serde_json::Value>(&file, "pw").unwrap_err();
    assert_eq!(err, EnvelopeError::WrongPassword);
}

#[test]
fn unknown_algorithm_is_rejected_not_downgraded() {
    let mut file = sealed();
    file.meta.algorithm = "AES-128-CBC".into();
    let err = decrypt_payload::<serde_json::Value>(&file, "pw").unwrap_err();
    assert!(matches!(err, EnvelopeError::Malformed(_)));
}

#[test]
fn unknown_kdf_is_rejected() {
    let mut file = sealed();
    file.meta.kdf = "argon2id".into();
    let err = decrypt_payload::<serde_json::Value>(&file, "pw").unwrap_err();
    assert!(matches!(err, EnvelopeError::Malformed(_)));
}

#[test]
fn wrong_length_iv_is_malformed() {
    let mut file = sealed();
    file.meta.iv = STANDARD.encode([0u8; 16]);
    let err = decrypt_payload::<serde_json::Value>(&file, "pw").unwrap_err();
    assert!(matches!(err, EnvelopeError::Malformed(_)));
}

#[test]
fn non_alphabet_base64_is_malformed() {
    let mut file = sealed();
    file.payload = format!("!!{}", file.payload);
    let err = decrypt_payload::<serde_json::Value>(&file, "pw").unwrap_err();
    assert!(matches!(err, EnvelopeError::Malformed(_)));
}

#[test]
fn truncated_ciphertext_fails() {
    let mut file = sealed();
    let mut bytes = STANDARD.decode(&file.payload).unwrap();
    bytes.truncate(4);
    file.payload = STANDARD.encode(bytes);
    let err = decrypt_payload::<serde_json::Value>(&file, "pw").unwrap_err();
    assert_eq!(err, EnvelopeError::WrongPassword);
}

#[test]
fn garbage_json_is_malformed() {
    let err = SyncedFile::from_json("not json at all").unwrap_err();
    assert!(matches!(err, EnvelopeError::Malformed(_)));
    let err = SyncedFile::from_json(r#"{"meta": 3}"#).unwrap_err();
    assert!(matches!(err, EnvelopeError::Malformed(_)));
}
