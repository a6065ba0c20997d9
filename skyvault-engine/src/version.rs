//! Version markers and last-writer conflict arbitration.
//!
//! Every successful upload bumps a per-provider monotonic counter; the
//! `(version, updatedAt)` pair recorded on both sides is what detects a
//! remote writer getting there first.

use serde::{Deserialize, Serialize};

use crate::types::Provider;
use skyvault_envelope::FileMeta;

// ---------------------------------------------------------------------------
// Markers
// ---------------------------------------------------------------------------

/// The `(version, updatedAt)` pair recorded locally per provider.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionMarker {
    pub version: u64,
    /// Milliseconds since epoch of the last write we know about.
    pub updated_at: i64,
}

impl VersionMarker {
    pub fn from_meta(meta: &FileMeta) -> Self {
        Self {
            version: meta.version,
            updated_at: meta.updated_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Conflict descriptor
// ---------------------------------------------------------------------------

/// One side of a detected conflict.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictSide {
    pub version: u64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
}

/// Surfaced when a remote writer is ahead of the local markers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInfo {
    pub provider: Provider,
    pub local: ConflictSide,
    pub remote: ConflictSide,
}

impl ConflictInfo {
    pub fn new(provider: Provider, local: &VersionMarker, remote: &FileMeta) -> Self {
        Self {
            provider,
            local: ConflictSide {
                version: local.version,
                updated_at: local.updated_at,
                device_name: None,
            },
            remote: ConflictSide {
                version: remote.version,
                updated_at: remote.updated_at,
                device_name: Some(remote.device_name.clone()),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Upload arbitration
// ---------------------------------------------------------------------------

/// What an upload attempt should do given the remote metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadDecision {
    /// No remote, or local is at least as recent: encrypt and upload.
    Proceed,
    /// The remote writer is ahead; block and surface a conflict.
    RemoteAhead,
    /// Markers are identical on both sides; nothing to do.
    InSync,
}

/// Decide whether an upload may proceed.
///
/// `updatedAt` is the primary ordering. On an exact timestamp tie the higher
/// version wins; a full tie means both sides already hold the same write.
pub fn check_upload(local: &VersionMarker, remote: Option<&FileMeta>) -> UploadDecision {
    let Some(remote) = remote else {
        return UploadDecision::Proceed;
    };
    if remote.updated_at > local.updated_at {
        return UploadDecision::RemoteAhead;
    }
    if remote.updated_at < local.updated_at {
        return UploadDecision::Proceed;
    }
    if remote.version > local.version {
        UploadDecision::RemoteAhead
    } else if remote.version < local.version {
        UploadDecision::Proceed
    } else {
        UploadDecision::InSync
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(version: u64, updated_at: i64) -> FileMeta {
        FileMeta {
            version,
            updated_at,
            device_id: "remote-dev".into(),
            device_name: "other-laptop".into(),
            app_version: "1.0".into(),
            iv: String::new(),
            salt: String::new(),
            algorithm: "AES-256-GCM".into(),
            kdf: "PBKDF2".into(),
            kdf_iterations: 600_000,
        }
    }

    fn marker(version: u64, updated_at: i64) -> VersionMarker {
        VersionMarker { version, updated_at }
    }

    #[test]
    fn absent_remote_proceeds() {
        assert_eq!(check_upload(&marker(5, 1000), None), UploadDecision::Proceed);
    }

    #[test]
    fn newer_remote_blocks() {
        assert_eq!(
            check_upload(&marker(5, 1000), Some(&meta(6, 1500))),
            UploadDecision::RemoteAhead
        );
    }

    #[test]
    fn older_remote_proceeds() {
        assert_eq!(
            check_upload(&marker(5, 2000), Some(&meta(4, 1500))),
            UploadDecision::Proceed
        );
    }

    #[test]
    fn timestamp_tie_higher_version_wins() {
        assert_eq!(
            check_upload(&marker(5, 1000), Some(&meta(6, 1000))),
            UploadDecision::RemoteAhead
        );
        assert_eq!(
            check_upload(&marker(7, 1000), Some(&meta(6, 1000))),
            UploadDecision::Proceed
        );
    }

    #[test]
    fn full_tie_is_in_sync() {
        assert_eq!(
            check_upload(&marker(6, 1000), Some(&meta(6, 1000))),
            UploadDecision::InSync
        );
    }

    #[test]
    fn conflict_info_captures_both_sides() {
        let info = ConflictInfo::new(Provider::Gist, &marker(5, 1000), &meta(6, 1500));
        assert_eq!(info.local.version, 5);
        assert_eq!(info.remote.version, 6);
        assert_eq!(info.remote.device_name.as_deref(), Some("other-laptop"));
    }
}
