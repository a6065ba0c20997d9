//! Core types: providers, connection records, the two state axes, payloads,
//! and the event vocabulary.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::history::SyncHistoryEntry;
use crate::version::{ConflictInfo, VersionMarker};
use skyvault_envelope::DeviceIdentity;

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// The cloud backends a vault can be reconciled against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Provider {
    #[serde(rename = "gist")]
    Gist,
    #[serde(rename = "driveA")]
    DriveA,
    #[serde(rename = "driveB")]
    DriveB,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Gist => "gist",
            Provider::DriveA => "driveA",
            Provider::DriveB => "driveB",
        }
    }

    /// Secret-storage key this provider's connection persists under.
    pub fn storage_key(&self) -> &'static str {
        match self {
            Provider::Gist => "provider.gist",
            Provider::DriveA => "provider.driveA",
            Provider::DriveB => "provider.driveB",
        }
    }

    pub fn all() -> [Provider; 3] {
        [Provider::Gist, Provider::DriveA, Provider::DriveB]
    }

    pub fn from_storage_key(key: &str) -> Option<Provider> {
        Provider::all().into_iter().find(|p| p.storage_key() == key)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// State axes
// ---------------------------------------------------------------------------

/// Security axis: whether a master key exists and is unlocked.
///
/// ```text
/// NO_KEY → LOCKED ↔ UNLOCKED
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityState {
    NoKey,
    Locked,
    Unlocked,
}

impl fmt::Display for SecurityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityState::NoKey => write!(f, "NO_KEY"),
            SecurityState::Locked => write!(f, "LOCKED"),
            SecurityState::Unlocked => write!(f, "UNLOCKED"),
        }
    }
}

/// Sync axis, kept independently of the security axis.
///
/// ```text
/// IDLE → SYNCING → {CONFLICT, ERROR} → IDLE
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    Idle,
    Syncing,
    Conflict,
    Error,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Idle => write!(f, "IDLE"),
            SyncState::Syncing => write!(f, "SYNCING"),
            SyncState::Conflict => write!(f, "CONFLICT"),
            SyncState::Error => write!(f, "ERROR"),
        }
    }
}

/// Per-provider connection status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    Disconnected,
    Connecting,
    Connected,
    Syncing,
    Error,
}

impl ProviderStatus {
    /// Transient statuses are never restored from storage.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderStatus::Connecting | ProviderStatus::Syncing | ProviderStatus::Error
        )
    }
}

impl fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderStatus::Disconnected => "disconnected",
            ProviderStatus::Connecting => "connecting",
            ProviderStatus::Connected => "connected",
            ProviderStatus::Syncing => "syncing",
            ProviderStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

// ---------------------------------------------------------------------------
// Tokens and accounts
// ---------------------------------------------------------------------------

/// OAuth token set. Secret at rest; Debug output is redacted.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthTokens {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Absolute expiry, milliseconds since epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl OAuthTokens {
    /// Whether the access token expires within `margin_ms` of `now_ms`.
    /// Tokens without an expiry never report as expiring.
    pub fn expires_within(&self, now_ms: i64, margin_ms: i64) -> bool {
        match self.expires_at {
            Some(at) => at <= now_ms + margin_ms,
            None => false,
        }
    }
}

impl fmt::Debug for OAuthTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthTokens")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Cached identity of the account behind a connection.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

// ---------------------------------------------------------------------------
// Provider connection
// ---------------------------------------------------------------------------

/// Persisted per-provider connection record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConnection {
    pub provider: Provider,
    pub status: ProviderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<OAuthTokens>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<AccountInfo>,
    /// Opaque provider-side container identifier (gist id, file id, path).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    /// Milliseconds since epoch of the last successful sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProviderConnection {
    pub fn disconnected(provider: Provider) -> Self {
        Self {
            provider,
            status: ProviderStatus::Disconnected,
            tokens: None,
            account: None,
            resource_id: None,
            last_sync: None,
            last_sync_version: None,
            error: None,
        }
    }

    /// Collapse transient statuses on restore: connected iff tokens exist.
    pub fn normalize_restored(mut self) -> Self {
        self.status = if self.tokens.is_some() {
            ProviderStatus::Connected
        } else {
            ProviderStatus::Disconnected
        };
        self
    }

    pub fn is_connected(&self) -> bool {
        self.tokens.is_some()
            && !matches!(self.status, ProviderStatus::Disconnected | ProviderStatus::Connecting)
    }
}

// ---------------------------------------------------------------------------
// Vault payload
// ---------------------------------------------------------------------------

/// The application-defined plaintext. The engine treats field content as
/// opaque JSON and preserves sequence ordering on round-trip.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultPayload {
    #[serde(default)]
    pub hosts: Vec<serde_json::Value>,
    #[serde(default)]
    pub keys: Vec<serde_json::Value>,
    #[serde(default)]
    pub snippets: Vec<serde_json::Value>,
    #[serde(default)]
    pub custom_groups: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_forwarding_rules: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<serde_json::Value>,
    pub synced_at: i64,
}

// ---------------------------------------------------------------------------
// Sync configuration
// ---------------------------------------------------------------------------

/// Auto-sync timer settings. The interval is clamped to one minute .. one day.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoSyncConfig {
    pub enabled: bool,
    pub interval_min: u32,
}

impl AutoSyncConfig {
    pub const MIN_INTERVAL_MIN: u32 = 1;
    pub const DEFAULT_INTERVAL_MIN: u32 = 15;
    pub const MAX_INTERVAL_MIN: u32 = 1440;

    pub fn clamped(enabled: bool, interval_min: u32) -> Self {
        Self {
            enabled,
            interval_min: interval_min
                .clamp(Self::MIN_INTERVAL_MIN, Self::MAX_INTERVAL_MIN),
        }
    }
}

impl Default for AutoSyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_min: Self::DEFAULT_INTERVAL_MIN,
        }
    }
}

/// Persisted sync settings: the auto-sync timer plus per-provider version
/// markers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    #[serde(default)]
    pub auto_sync: AutoSyncConfig,
    #[serde(default)]
    pub markers: HashMap<Provider, VersionMarker>,
}

// ---------------------------------------------------------------------------
// Command outcomes
// ---------------------------------------------------------------------------

/// Which way data moved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Upload,
    Download,
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncAction::Upload => write!(f, "upload"),
            SyncAction::Download => write!(f, "download"),
        }
    }
}

/// Result of a completed sync leg, carried in events and history.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncSummary {
    pub action: SyncAction,
    pub version: u64,
    pub updated_at: i64,
}

/// Typed outcome of `push`. A conflict is an outcome, not a failure.
#[derive(Clone, Debug, PartialEq)]
pub enum PushOutcome {
    Uploaded { version: u64, updated_at: i64 },
    Conflict(ConflictInfo),
    /// Local and remote markers are identical; nothing was written.
    AlreadyInSync { version: u64 },
}

/// Typed outcome of `pull` and of `resolve_conflict(UseRemote)`.
#[derive(Clone, Debug, PartialEq)]
pub struct PullOutcome {
    pub payload: VaultPayload,
    pub version: u64,
    pub updated_at: i64,
}

/// Conflict resolution choice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolveChoice {
    UseRemote,
    UseLocal,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Engine events, emitted in program order per command.
#[derive(Clone, Debug)]
pub enum SyncEvent {
    SecurityStateChanged { state: SecurityState },
    AuthCompleted { provider: Provider, account: Option<AccountInfo> },
    SyncStarted { provider: Provider },
    ConflictDetected { conflict: ConflictInfo },
    ConflictResolved { choice: ResolveChoice },
    SyncCompleted { provider: Provider, result: SyncSummary },
    SyncError { provider: Provider, reason: String },
    /// Another process mutated shared storage and this instance re-read it.
    StateChanged,
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Deep-copied view of engine state; mutating it cannot touch the engine.
#[derive(Clone, Debug)]
pub struct EngineSnapshot {
    pub security: SecurityState,
    pub sync: SyncState,
    pub providers: HashMap<Provider, ProviderConnection>,
    pub conflict: Option<ConflictInfo>,
    pub auto_sync: AutoSyncConfig,
    pub markers: HashMap<Provider, VersionMarker>,
    pub history: Vec<SyncHistoryEntry>,
    pub device: DeviceIdentity,
}
