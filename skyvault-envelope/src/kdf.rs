//! Password-based key derivation.
//!
//! key = PBKDF2-HMAC-SHA256(password, salt, iterations, 32)
//!
//! The iteration floor is enforced here so no caller can accidentally write a
//! file the rest of the fleet would refuse to create.

use pbkdf2::pbkdf2_hmac;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::EnvelopeError;

/// Derived key length (AES-256).
pub const KEY_BYTES: usize = 32;

/// Salt length: 256 bits, freshly generated per encryption.
pub const SALT_BYTES: usize = 32;

/// Lowest iteration count this format will derive with.
pub const MIN_ITERATIONS: u32 = 100_000;

/// Default iteration count for newly written files.
pub const DEFAULT_ITERATIONS: u32 = 600_000;

// ---------------------------------------------------------------------------
// Derived key
// ---------------------------------------------------------------------------

/// A 256-bit symmetric key derived from a password. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey([u8; KEY_BYTES]);

impl DerivedKey {
    pub fn as_bytes(&self) -> &[u8; KEY_BYTES] {
        &self.0
    }

    /// SHA-256 over the key bytes. Safe to persist: it confirms password
    /// correctness without revealing the key.
    pub fn verification_hash(&self) -> [u8; 32] {
        sha256(&self.0)
    }

    /// Constant-time comparison against a stored verification hash.
    pub fn matches_verification_hash(&self, expected: &[u8]) -> bool {
        let actual = self.verification_hash();
        if expected.len() != actual.len() {
            return false;
        }
        actual.ct_eq(expected).into()
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKey(..)")
    }
}

/// Derive a 256-bit key from `password` and `salt`.
///
/// Rejects iteration counts below [`MIN_ITERATIONS`].
pub fn derive_key(
    password: &str,
    salt: &[u8; SALT_BYTES],
    iterations: u32,
) -> Result<DerivedKey, EnvelopeError> {
    if iterations < MIN_ITERATIONS {
        return Err(EnvelopeError::WeakKdfParams { iterations });
    }
    let mut out = [0u8; KEY_BYTES];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut out);
    Ok(DerivedKey(out))
}

/// Plain SHA-256.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
