//! # Skyvault Engine
//!
//! Zero-knowledge multi-cloud sync for a local secrets vault.
//!
//! The engine takes a structured payload from the host application, seals it
//! end-to-end under the user's master password, and reconciles it across
//! opaque cloud backends (a gist-style text store and two drive-style file
//! stores). Providers only ever see ciphertext plus minimal metadata; the
//! master key never leaves the device.
//!
//! Built on [`skyvault_envelope`] for the sealed on-wire format.
//!
//! ## Quick Start
//!
//! ```ignore
//! use skyvault_engine::*;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let store = Arc::new(FileSecretStore::new("/path/to/store")?);
//! let http = Arc::new(ReqwestHttpClient::new()?);
//! let config = EngineConfig::new("2.0.0").with_device_name("work-laptop");
//! let engine = SyncEngine::new(store, http, Arc::new(SystemClock), config)?;
//!
//! engine.setup_master_key("correct horse battery staple").await?;
//!
//! // Connect a provider (device flow shown).
//! let start = engine.start_provider_auth(Provider::Gist, None).await?;
//! if let AuthStart::DeviceCode { user_code, verification_uri, interval_secs, expires_at, device_code } = start {
//!     println!("visit {verification_uri} and enter {user_code}");
//!     engine
//!         .complete_provider_auth(
//!             Provider::Gist,
//!             AuthEvidence::DeviceCode { device_code, interval_secs, expires_at },
//!         )
//!         .await?;
//! }
//!
//! // Push the current vault.
//! let payload = VaultPayload { synced_at: chrono::Utc::now().timestamp_millis(), ..Default::default() };
//! match engine.push(Provider::Gist, &payload).await? {
//!     PushOutcome::Uploaded { version, .. } => println!("now at v{version}"),
//!     PushOutcome::Conflict(info) => println!("remote is ahead: {:?}", info),
//!     PushOutcome::AlreadyInSync { .. } => {}
//! }
//! # Ok::<(), SyncError>(())
//! # });
//! ```

#![deny(unsafe_code)]

pub mod clock;
mod coherence;
pub mod engine;
pub mod error;
pub mod history;
pub mod http;
pub mod master_key;
pub mod providers;
pub mod storage;
pub mod types;
pub mod version;

// Re-export main types for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{EngineConfig, EventSubscription, SyncEngine};
pub use error::SyncError;
pub use history::{SyncHistoryEntry, HISTORY_CAP};
pub use http::{HttpClient, HttpError, HttpRequest, HttpResponse, Method, ReqwestHttpClient};
pub use master_key::{MasterKeyConfig, MasterKeyManager};
pub use providers::drive::{DriveAdapter, DriveApiStyle, DriveConfig, DriveEndpoints};
pub use providers::gist::{GistAdapter, GistConfig};
pub use providers::oauth::{listen_for_callback, CallbackParams, PkceChallenge};
pub use providers::{AuthEvidence, AuthStart, CloudAdapter};
pub use storage::{FileSecretStore, InMemorySecretStore, SecretStore, StorageError};
pub use types::{
    AccountInfo, AutoSyncConfig, EngineSnapshot, OAuthTokens, Provider, ProviderConnection,
    ProviderStatus, PullOutcome, PushOutcome, ResolveChoice, SecurityState, SyncAction,
    SyncConfig, SyncEvent, SyncState, SyncSummary, VaultPayload,
};
pub use version::{ConflictInfo, ConflictSide, VersionMarker};

// The envelope crate is part of the public surface: hosts hold `SyncedFile`s.
pub use skyvault_envelope::{DeviceIdentity, EnvelopeError, FileMeta, SyncedFile};

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
