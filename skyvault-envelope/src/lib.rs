//! # Skyvault Envelope
//!
//! Password-sealed envelope format for end-to-end encrypted vault sync.
//!
//! A [`SyncedFile`] is the single artifact a cloud provider ever sees:
//! plaintext metadata (version, device, KDF parameters) plus an
//! AES-256-GCM-sealed payload. The symmetric key is derived from the user's
//! master password with PBKDF2-HMAC-SHA256 over a fresh 256-bit salt, so the
//! provider holds nothing that helps recover the plaintext.
//!
//! ## Quick Start
//!
//! ```no_run
//! use skyvault_envelope::{decrypt_payload, encrypt_payload, DeviceIdentity};
//!
//! let device = DeviceIdentity {
//!     id: "a1b2".into(),
//!     name: "laptop".into(),
//!     app_version: "1.0.0".into(),
//! };
//!
//! let payload = serde_json::json!({ "hosts": [], "syncedAt": 1_700_000_000_000i64 });
//! let file = encrypt_payload(&payload, "correct horse", &device, 0, 1_700_000_000_000).unwrap();
//! assert_eq!(file.meta.version, 1);
//!
//! let restored: serde_json::Value = decrypt_payload(&file, "correct horse").unwrap();
//! assert_eq!(restored, payload);
//! ```
//!
//! ## Security Properties
//!
//! - **Authenticated encryption**: a single flipped byte anywhere fails the tag
//! - **Fresh randomness**: new IV and new salt on every encryption
//! - **Reserved suites**: unknown `algorithm`/`kdf` strings are rejected,
//!   never downgraded
//! - **Uniform open errors**: wrong password and tampered data are
//!   indistinguishable
//!
//! ## What's NOT Provided
//!
//! - Key or token storage
//! - Provider I/O
//! - Version/conflict arbitration (the engine crate owns that)

#![deny(unsafe_code)]

mod aead;
mod b64;
mod envelope;
mod error;
mod kdf;

pub use aead::{fresh_iv, fresh_salt, open, seal, IV_BYTES, TAG_BYTES};
pub use b64::{decode as base64_decode, encode as base64_encode};
pub use envelope::{
    decrypt_payload, encrypt_payload, encrypt_payload_with, verify_file, DeviceIdentity, FileMeta,
    SyncedFile, ALGORITHM, KDF,
};
pub use error::{EnvelopeError, MacMismatch, SealError};
pub use kdf::{
    derive_key, sha256, DerivedKey, DEFAULT_ITERATIONS, KEY_BYTES, MIN_ITERATIONS, SALT_BYTES,
};
