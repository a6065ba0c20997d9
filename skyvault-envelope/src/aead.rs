//! AEAD: AES-256-GCM with a 96-bit IV and 128-bit tag, empty associated data.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use getrandom::getrandom;

use crate::error::{MacMismatch, SealError};
use crate::kdf::{DerivedKey, SALT_BYTES};

/// GCM IV length.
pub const IV_BYTES: usize = 12;

/// GCM authentication tag length, appended to the ciphertext.
pub const TAG_BYTES: usize = 16;

/// Generate a fresh random 96-bit IV. Encryption path only.
pub fn fresh_iv() -> Result<[u8; IV_BYTES], SealError> {
    let mut iv = [0u8; IV_BYTES];
    getrandom(&mut iv).map_err(|_| SealError)?;
    Ok(iv)
}

/// Generate a fresh random 256-bit KDF salt. Encryption path only.
pub fn fresh_salt() -> Result<[u8; SALT_BYTES], SealError> {
    let mut salt = [0u8; SALT_BYTES];
    getrandom(&mut salt).map_err(|_| SealError)?;
    Ok(salt)
}

/// Seal `plaintext`, returning ciphertext with the tag appended.
pub fn seal(key: &DerivedKey, iv: &[u8; IV_BYTES], plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| SealError)?;
    cipher
        .encrypt(Nonce::from_slice(iv), plaintext)
        .map_err(|_| SealError)
}

/// Open `ciphertext_with_tag`. Any failure is a [`MacMismatch`].
pub fn open(
    key: &DerivedKey,
    iv: &[u8; IV_BYTES],
    ciphertext_with_tag: &[u8],
) -> Result<Vec<u8>, MacMismatch> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| MacMismatch)?;
    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext_with_tag)
        .map_err(|_| MacMismatch)
}
