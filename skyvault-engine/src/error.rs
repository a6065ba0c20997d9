//! Error types for the sync engine.
//!
//! One matchable enum for the whole command surface. Display strings carry a
//! provider identifier and a short reason; secrets never appear in them.

use std::fmt;

use crate::types::Provider;
use skyvault_envelope::EnvelopeError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    // Security axis
    NoMasterKey,
    AlreadyInitialized,
    VaultLocked,
    WrongPassword,

    // Envelope layer
    WeakKdfParams { iterations: u32 },
    MalformedFile(String),
    MacMismatch,

    // Provider layer
    ProviderNotConnected(Provider),
    ReauthRequired(Provider),
    ProviderRateLimited { provider: Provider, retry_after_secs: Option<u64> },
    ProviderTransient { provider: Provider, detail: String },
    ProviderBadRequest { provider: Provider, detail: String },
    NotFound(Provider),

    // Command scheduling
    Busy,
    NoConflictPending,
    CancelledByCaller,
    Timeout,

    // Storage
    StorageUnavailable(String),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMasterKey => write!(f, "no master key configured"),
            Self::AlreadyInitialized => write!(f, "master key already configured"),
            Self::VaultLocked => write!(f, "vault is locked"),
            Self::WrongPassword => write!(f, "wrong password"),
            Self::WeakKdfParams { iterations } => {
                write!(f, "kdf iteration count too low: {}", iterations)
            }
            Self::MalformedFile(detail) => write!(f, "malformed synced file: {}", detail),
            Self::MacMismatch => write!(f, "authentication tag mismatch"),
            Self::ProviderNotConnected(p) => write!(f, "{}: not connected", p),
            Self::ReauthRequired(p) => write!(f, "{}: re-authentication required", p),
            Self::ProviderRateLimited { provider, retry_after_secs } => match retry_after_secs {
                Some(secs) => write!(f, "{}: rate limited, retry after {}s", provider, secs),
                None => write!(f, "{}: rate limited", provider),
            },
            Self::ProviderTransient { provider, detail } => {
                write!(f, "{}: transient failure: {}", provider, detail)
            }
            Self::ProviderBadRequest { provider, detail } => {
                write!(f, "{}: rejected request: {}", provider, detail)
            }
            Self::NotFound(p) => write!(f, "{}: container not found", p),
            Self::Busy => write!(f, "another sync command is in flight"),
            Self::NoConflictPending => write!(f, "no conflict pending resolution"),
            Self::CancelledByCaller => write!(f, "cancelled by caller"),
            Self::Timeout => write!(f, "request timed out"),
            Self::StorageUnavailable(detail) => write!(f, "secret storage unavailable: {}", detail),
        }
    }
}

impl std::error::Error for SyncError {}

impl SyncError {
    /// Whether the bounded retry policy applies.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProviderTransient { .. } | Self::ProviderRateLimited { .. }
        )
    }

    /// Short stable tag for history entries and log fields.
    pub fn reason_tag(&self) -> &'static str {
        match self {
            Self::NoMasterKey => "no_master_key",
            Self::AlreadyInitialized => "already_initialized",
            Self::VaultLocked => "vault_locked",
            Self::WrongPassword => "wrong_password",
            Self::WeakKdfParams { .. } => "weak_kdf_params",
            Self::MalformedFile(_) => "malformed_file",
            Self::MacMismatch => "mac_mismatch",
            Self::ProviderNotConnected(_) => "not_connected",
            Self::ReauthRequired(_) => "reauth_required",
            Self::ProviderRateLimited { .. } => "rate_limited",
            Self::ProviderTransient { .. } => "transient",
            Self::ProviderBadRequest { .. } => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::Busy => "busy",
            Self::NoConflictPending => "no_conflict",
            Self::CancelledByCaller => "cancelled",
            Self::Timeout => "timeout",
            Self::StorageUnavailable(_) => "storage_unavailable",
        }
    }
}

impl From<EnvelopeError> for SyncError {
    fn from(e: EnvelopeError) -> Self {
        match e {
            EnvelopeError::WeakKdfParams { iterations } => SyncError::WeakKdfParams { iterations },
            EnvelopeError::Malformed(detail) => SyncError::MalformedFile(detail),
            EnvelopeError::WrongPassword => SyncError::WrongPassword,
        }
    }
}
