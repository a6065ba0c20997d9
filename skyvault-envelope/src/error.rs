//! Error types for the envelope layer.

use std::fmt;

/// Encryption-side failure. Deliberately carries no detail beyond the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SealError;

impl fmt::Display for SealError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seal failed")
    }
}

impl std::error::Error for SealError {}

/// Decryption-side failure: the GCM tag did not verify.
///
/// All open failures collapse into this one value so callers cannot
/// distinguish a wrong key from tampered ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacMismatch;

impl fmt::Display for MacMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "authentication tag mismatch")
    }
}

impl std::error::Error for MacMismatch {}

// ---------------------------------------------------------------------------
// Envelope-level error
// ---------------------------------------------------------------------------

/// Failure while composing or opening a [`SyncedFile`](crate::SyncedFile).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Key derivation was requested with too few iterations.
    WeakKdfParams { iterations: u32 },
    /// The file is structurally invalid: bad JSON, bad base64, wrong field
    /// lengths, or a reserved string field carrying an unknown value.
    Malformed(String),
    /// Ciphertext failed authentication. Surfaced from `decrypt_payload` as
    /// the password being wrong, which is what it means for this format.
    WrongPassword,
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WeakKdfParams { iterations } => {
                write!(f, "kdf iteration count too low: {}", iterations)
            }
            Self::Malformed(detail) => write!(f, "malformed file: {}", detail),
            Self::WrongPassword => write!(f, "wrong password"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

impl From<SealError> for EnvelopeError {
    fn from(_: SealError) -> Self {
        // Seal can only fail on an invalid key length, which derive_key rules out.
        EnvelopeError::Malformed("seal failed".into())
    }
}

impl From<MacMismatch> for EnvelopeError {
    fn from(_: MacMismatch) -> Self {
        EnvelopeError::WrongPassword
    }
}
