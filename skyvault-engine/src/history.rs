//! Sync history: every upload/download attempt leaves a structured entry.
//!
//! Entries are plaintext metadata only — no tokens, no payload content.

use serde::{Deserialize, Serialize};

use crate::storage::{self, keys, SecretStore};
use crate::types::{Provider, SyncAction};

/// Most recent entries kept; older ones fall off the ring.
pub const HISTORY_CAP: usize = 50;

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncHistoryEntry {
    pub id: String,
    /// Milliseconds since epoch.
    pub timestamp: i64,
    pub provider: Provider,
    pub action: SyncAction,
    pub success: bool,
    pub local_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncHistoryEntry {
    pub fn new(
        timestamp: i64,
        provider: Provider,
        action: SyncAction,
        local_version: u64,
    ) -> Self {
        let mut id = [0u8; 8];
        // Best-effort uniqueness; a zeroed id on RNG failure is still valid.
        let _ = getrandom::getrandom(&mut id);
        Self {
            id: hex::encode(id),
            timestamp,
            provider,
            action,
            success: true,
            local_version,
            remote_version: None,
            device_name: None,
            error: None,
        }
    }

    pub fn with_remote_version(mut self, version: u64) -> Self {
        self.remote_version = Some(version);
        self
    }

    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = Some(name.into());
        self
    }

    pub fn with_failure(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Ring-buffered log
// ---------------------------------------------------------------------------

/// In-memory history backed by the `sync_history` storage key. Newest first.
#[derive(Clone, Debug, Default)]
pub struct HistoryLog {
    entries: Vec<SyncHistoryEntry>,
}

impl HistoryLog {
    pub fn load(store: &dyn SecretStore) -> Self {
        let mut entries: Vec<SyncHistoryEntry> =
            storage::read_json(store, keys::SYNC_HISTORY).unwrap_or_default();
        entries.truncate(HISTORY_CAP);
        Self { entries }
    }

    /// Record an entry and persist the ring.
    pub fn record(&mut self, store: &dyn SecretStore, entry: SyncHistoryEntry) {
        self.entries.insert(0, entry);
        self.entries.truncate(HISTORY_CAP);
        if let Err(e) = storage::write_json(store, keys::SYNC_HISTORY, &self.entries, false) {
            tracing::warn!(error = %e, "failed to persist sync history");
        }
    }

    /// Replace the in-memory ring from storage (another process wrote it).
    pub fn reload(&mut self, store: &dyn SecretStore) {
        *self = Self::load(store);
    }

    pub fn entries(&self) -> &[SyncHistoryEntry] {
        &self.entries
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
