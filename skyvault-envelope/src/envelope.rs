//! The on-wire synced file: versioned metadata plus password-sealed payload.
//!
//! ```text
//! {
//!   "meta": { version, updatedAt, deviceId, deviceName, appVersion,
//!             iv, salt, algorithm, kdf, kdfIterations },
//!   "payload": base64(AES-256-GCM ciphertext || 16-byte tag)
//! }
//! ```
//!
//! `algorithm` and `kdf` are reserved strings; parsing rejects any other
//! value rather than attempting a different primitive.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::aead::{self, IV_BYTES};
use crate::b64;
use crate::error::EnvelopeError;
use crate::kdf::{self, DEFAULT_ITERATIONS, SALT_BYTES};

/// The only cipher this format writes or reads.
pub const ALGORITHM: &str = "AES-256-GCM";

/// The only KDF this format writes or reads.
pub const KDF: &str = "PBKDF2";

// ---------------------------------------------------------------------------
// Wire structs
// ---------------------------------------------------------------------------

/// Identity of the writing device, stamped into every file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub id: String,
    pub name: String,
    pub app_version: String,
}

/// Plaintext metadata attached to the ciphertext.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub version: u64,
    pub updated_at: i64,
    pub device_id: String,
    pub device_name: String,
    pub app_version: String,
    /// base64, 12 bytes.
    pub iv: String,
    /// base64, 32 bytes. Fresh per encryption, never the master-key salt.
    pub salt: String,
    pub algorithm: String,
    pub kdf: String,
    pub kdf_iterations: u32,
}

/// The complete provider-opaque artifact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncedFile {
    pub meta: FileMeta,
    /// base64 of ciphertext plus tag.
    pub payload: String,
}

impl SyncedFile {
    /// UTF-8 JSON form, as uploaded to providers.
    pub fn to_json(&self) -> String {
        // Serialization of these plain structs cannot fail.
        serde_json::to_string(self).expect("synced file serializes")
    }

    /// Parse and structurally validate a downloaded file.
    pub fn from_json(data: &str) -> Result<Self, EnvelopeError> {
        let file: SyncedFile = serde_json::from_str(data)
            .map_err(|e| EnvelopeError::Malformed(format!("json: {}", e)))?;
        file.validate()?;
        Ok(file)
    }

    /// Reject unknown reserved strings and malformed binary fields.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.meta.algorithm != ALGORITHM {
            return Err(EnvelopeError::Malformed(format!(
                "unsupported algorithm: {}",
                self.meta.algorithm
            )));
        }
        if self.meta.kdf != KDF {
            return Err(EnvelopeError::Malformed(format!(
                "unsupported kdf: {}",
                self.meta.kdf
            )));
        }
        b64::decode_exact::<IV_BYTES>("iv", &self.meta.iv)?;
        b64::decode_exact::<SALT_BYTES>("salt", &self.meta.salt)?;
        b64::decode("payload", &self.payload)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Encrypt / decrypt
// ---------------------------------------------------------------------------

/// Seal `payload` under `password` with the default iteration count.
///
/// `prior_version` is the caller's current version marker; the emitted file
/// carries `prior_version + 1`. `now_ms` becomes `meta.updatedAt`.
pub fn encrypt_payload<T: Serialize>(
    payload: &T,
    password: &str,
    device: &DeviceIdentity,
    prior_version: u64,
    now_ms: i64,
) -> Result<SyncedFile, EnvelopeError> {
    encrypt_payload_with(payload, password, DEFAULT_ITERATIONS, device, prior_version, now_ms)
}

/// Seal with an explicit iteration count (still subject to the floor).
pub fn encrypt_payload_with<T: Serialize>(
    payload: &T,
    password: &str,
    iterations: u32,
    device: &DeviceIdentity,
    prior_version: u64,
    now_ms: i64,
) -> Result<SyncedFile, EnvelopeError> {
    let salt = aead::fresh_salt()?;
    let iv = aead::fresh_iv()?;
    let key = kdf::derive_key(password, &salt, iterations)?;

    let plaintext = serde_json::to_vec(payload)
        .map_err(|e| EnvelopeError::Malformed(format!("payload: {}", e)))?;
    let ciphertext = aead::seal(&key, &iv, &plaintext)?;

    Ok(SyncedFile {
        meta: FileMeta {
            version: prior_version + 1,
            updated_at: now_ms,
            device_id: device.id.clone(),
            device_name: device.name.clone(),
            app_version: device.app_version.clone(),
            iv: b64::encode(&iv),
            salt: b64::encode(&salt),
            algorithm: ALGORITHM.into(),
            kdf: KDF.into(),
            kdf_iterations: iterations,
        },
        payload: b64::encode(&ciphertext),
    })
}

/// Open a file and parse its plaintext.
///
/// The key is re-derived from `meta.salt` and `meta.kdfIterations`, so files
/// written with a different (still acceptable) iteration count remain
/// readable. A tag failure surfaces as [`EnvelopeError::WrongPassword`];
/// structural problems as [`EnvelopeError::Malformed`].
pub fn decrypt_payload<T: DeserializeOwned>(
    file: &SyncedFile,
    password: &str,
) -> Result<T, EnvelopeError> {
    file.validate()?;
    let salt = b64::decode_exact::<SALT_BYTES>("salt", &file.meta.salt)?;
    let iv = b64::decode_exact::<IV_BYTES>("iv", &file.meta.iv)?;
    let ciphertext = b64::decode("payload", &file.payload)?;

    let key = kdf::derive_key(password, &salt, file.meta.kdf_iterations)?;
    let plaintext = aead::open(&key, &iv, &ciphertext)?;

    serde_json::from_slice(&plaintext)
        .map_err(|e| EnvelopeError::Malformed(format!("plaintext: {}", e)))
}

/// Check whether `password` opens `file`, discarding the plaintext.
///
/// Structural errors still propagate; only an authentication failure maps to
/// `Ok(false)`.
pub fn verify_file(file: &SyncedFile, password: &str) -> Result<bool, EnvelopeError> {
    match decrypt_payload::<serde_json::Value>(file, password) {
        Ok(_) => Ok(true),
        Err(EnvelopeError::WrongPassword) => Ok(false),
        Err(e) => Err(e),
    }
}
