//! Sync orchestrator: the public command API over one owned aggregate.
//!
//! The engine exclusively owns mutable state. Adapters own only their tokens
//! and container id; the master-key manager owns the unlocked key; everything
//! else lives behind the orchestrator's locks. At most one mutating command
//! runs at a time: `push`/`pull`/`resolve_conflict` fail fast with `Busy`,
//! `push_queued` waits FIFO.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::clock::Clock;
use crate::error::SyncError;
use crate::history::{HistoryLog, SyncHistoryEntry};
use crate::http::HttpClient;
use crate::master_key::MasterKeyManager;
use crate::providers::drive::{DriveAdapter, DriveConfig};
use crate::providers::gist::{GistAdapter, GistConfig};
use crate::providers::{AuthEvidence, AuthStart, CloudAdapter};
use crate::storage::{self, keys, SecretStore};
use crate::types::{
    AccountInfo, AutoSyncConfig, EngineSnapshot, Provider, ProviderConnection, ProviderStatus,
    PullOutcome, PushOutcome, ResolveChoice, SecurityState, SyncAction, SyncConfig, SyncEvent,
    SyncState, SyncSummary, VaultPayload,
};
use crate::version::{self, ConflictInfo, UploadDecision, VersionMarker};
use skyvault_envelope::{
    decrypt_payload, encrypt_payload_with, DeviceIdentity, SyncedFile, DEFAULT_ITERATIONS,
};

/// Retry delays for transient provider failures, before jitter.
const RETRY_DELAYS_MS: [u64; 3] = [1_000, 2_000, 4_000];

/// Upper bound on the random jitter added to each retry delay.
const RETRY_JITTER_MS: u64 = 250;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Host-supplied engine configuration. Constructible; no global singleton —
/// a host may run several engines (and tests always do).
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub app_version: String,
    /// Platform hint; falls back to a generic name.
    pub device_name: Option<String>,
    /// Iteration count for new encryptions and master-key setup.
    pub kdf_iterations: u32,
    pub gist: GistConfig,
    pub drive_a: DriveConfig,
    pub drive_b: DriveConfig,
}

impl EngineConfig {
    pub fn new(app_version: impl Into<String>) -> Self {
        Self {
            app_version: app_version.into(),
            device_name: None,
            kdf_iterations: DEFAULT_ITERATIONS,
            gist: GistConfig::default(),
            drive_a: DriveConfig::drive_a(),
            drive_b: DriveConfig::drive_b(),
        }
    }

    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = Some(name.into());
        self
    }

    pub fn with_kdf_iterations(mut self, iterations: u32) -> Self {
        self.kdf_iterations = iterations;
        self
    }

    pub fn with_gist(mut self, gist: GistConfig) -> Self {
        self.gist = gist;
        self
    }

    pub fn with_drive_a(mut self, drive_a: DriveConfig) -> Self {
        self.drive_a = drive_a;
        self
    }

    pub fn with_drive_b(mut self, drive_b: DriveConfig) -> Self {
        self.drive_b = drive_b;
        self
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub(crate) struct Shared {
    pub(crate) sync: SyncState,
    pub(crate) conflict: Option<ConflictInfo>,
    pub(crate) connections: HashMap<Provider, ProviderConnection>,
    pub(crate) sync_config: SyncConfig,
    pub(crate) history: HistoryLog,
}

pub(crate) struct EngineInner {
    pub(crate) store: Arc<dyn SecretStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) keys: MasterKeyManager,
    pub(crate) config: EngineConfig,
    pub(crate) device: DeviceIdentity,
    pub(crate) shared: Mutex<Shared>,
    /// Serializes mutating commands.
    pub(crate) op: tokio::sync::Mutex<()>,
    pub(crate) adapters: HashMap<Provider, Arc<dyn CloudAdapter>>,
    subscribers: Mutex<Vec<(u64, mpsc::UnboundedSender<SyncEvent>)>>,
    next_subscriber: AtomicU64,
    auto_sync_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    pub(crate) tick_outstanding: AtomicBool,
    store_subscription: AtomicU64,
}

/// The sync engine. Cheap to clone; all clones share one aggregate.
#[derive(Clone)]
pub struct SyncEngine {
    pub(crate) inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Build an engine over the given capabilities. Must be called inside the
    /// host's Tokio runtime: the cross-instance watcher task starts here.
    pub fn new(
        store: Arc<dyn SecretStore>,
        http: Arc<dyn HttpClient>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Result<Self, SyncError> {
        let device = load_device_identity(store.as_ref(), &config)?;

        let mut connections = HashMap::new();
        for provider in Provider::all() {
            let connection = storage::read_json::<ProviderConnection>(store.as_ref(), provider.storage_key())
                .map(ProviderConnection::normalize_restored)
                .unwrap_or_else(|| ProviderConnection::disconnected(provider));
            connections.insert(provider, connection);
        }

        let mut adapters: HashMap<Provider, Arc<dyn CloudAdapter>> = HashMap::new();
        adapters.insert(
            Provider::Gist,
            Arc::new(GistAdapter::new(http.clone(), clock.clone(), config.gist.clone())),
        );
        adapters.insert(
            Provider::DriveA,
            Arc::new(DriveAdapter::new(http.clone(), clock.clone(), config.drive_a.clone())),
        );
        adapters.insert(
            Provider::DriveB,
            Arc::new(DriveAdapter::new(http.clone(), clock.clone(), config.drive_b.clone())),
        );
        for (provider, adapter) in &adapters {
            let connection = &connections[provider];
            adapter.set_session(connection.tokens.clone(), connection.resource_id.clone());
        }

        let sync_config: SyncConfig =
            storage::read_json(store.as_ref(), keys::SYNC_CONFIG).unwrap_or_default();

        let inner = Arc::new(EngineInner {
            keys: MasterKeyManager::new(store.clone(), clock.clone(), config.kdf_iterations),
            store: store.clone(),
            clock,
            config,
            device,
            shared: Mutex::new(Shared {
                sync: SyncState::Idle,
                conflict: None,
                connections,
                sync_config,
                history: HistoryLog::load(store.as_ref()),
            }),
            op: tokio::sync::Mutex::new(()),
            adapters,
            subscribers: Mutex::new(Vec::new()),
            next_subscriber: AtomicU64::new(0),
            auto_sync_task: Mutex::new(None),
            tick_outstanding: AtomicBool::new(false),
            store_subscription: AtomicU64::new(0),
        });

        // Cross-instance coherence: watch the shared store.
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let handle = store.subscribe(Box::new(move |key| {
            let _ = tx.send(key.to_string());
        }));
        inner.store_subscription.store(handle, Ordering::SeqCst);
        crate::coherence::spawn_watcher(Arc::downgrade(&inner), rx);

        Ok(Self { inner })
    }

    // -----------------------------------------------------------------------
    // Observability
    // -----------------------------------------------------------------------

    /// Deep-copied snapshot; observers cannot mutate engine state through it.
    pub fn get_state(&self) -> EngineSnapshot {
        let shared = self.inner.shared.lock().unwrap();
        EngineSnapshot {
            security: self.inner.keys.security_state(),
            sync: shared.sync,
            providers: shared.connections.clone(),
            conflict: shared.conflict.clone(),
            auto_sync: shared.sync_config.auto_sync,
            markers: shared.sync_config.markers.clone(),
            history: shared.history.entries().to_vec(),
            device: self.inner.device.clone(),
        }
    }

    /// Subscribe to engine events. Dropping the subscription unsubscribes.
    pub fn subscribe(&self) -> EventSubscription {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().unwrap().push((id, tx));
        EventSubscription {
            id,
            rx,
            inner: Arc::downgrade(&self.inner),
        }
    }

    // -----------------------------------------------------------------------
    // Master-key commands
    // -----------------------------------------------------------------------

    /// Create the master-key configuration and unlock. Fails with
    /// `AlreadyInitialized` when a configuration exists.
    pub async fn setup_master_key(&self, password: &str) -> Result<(), SyncError> {
        let _guard = self.inner.op.lock().await;
        self.inner.keys.setup(password).await?;
        self.inner.emit(SyncEvent::SecurityStateChanged {
            state: SecurityState::Unlocked,
        });
        EngineInner::maybe_start_auto_sync(&self.inner);
        Ok(())
    }

    /// Returns `Ok(false)` on a wrong password, leaving state locked.
    pub async fn unlock(&self, password: &str) -> Result<bool, SyncError> {
        let _guard = self.inner.op.lock().await;
        if !self.inner.keys.unlock(password).await? {
            return Ok(false);
        }
        self.inner.emit(SyncEvent::SecurityStateChanged {
            state: SecurityState::Unlocked,
        });
        EngineInner::maybe_start_auto_sync(&self.inner);
        Ok(true)
    }

    /// Zeroize the key, stop auto-sync.
    pub async fn lock(&self) {
        let _guard = self.inner.op.lock().await;
        self.inner.stop_auto_sync();
        self.inner.keys.lock();
        self.inner.emit(SyncEvent::SecurityStateChanged {
            state: self.inner.keys.security_state(),
        });
    }

    /// Verify `old`, swap in a fresh configuration, re-unlock with `new`.
    ///
    /// Remote files stay sealed under the old password until the host pushes
    /// again to every connected provider; do that immediately after.
    pub async fn change_master_key(&self, old: &str, new: &str) -> Result<(), SyncError> {
        let _guard = self.inner.op.lock().await;
        if self.inner.keys.security_state() != SecurityState::Unlocked {
            return Err(SyncError::VaultLocked);
        }
        self.inner.keys.change_password(old, new).await
    }

    /// Non-mutating password check.
    pub async fn verify_password(&self, password: &str) -> Result<bool, SyncError> {
        self.inner.keys.verify_password(password).await
    }

    // -----------------------------------------------------------------------
    // Provider commands
    // -----------------------------------------------------------------------

    /// Begin a provider's auth flow. PKCE providers need the redirect URI the
    /// host is listening on.
    pub async fn start_provider_auth(
        &self,
        provider: Provider,
        redirect_uri: Option<String>,
    ) -> Result<AuthStart, SyncError> {
        let _guard = self.inner.op.lock().await;
        self.inner
            .update_connection(provider, |c| c.status = ProviderStatus::Connecting);
        match self.inner.adapter(provider).start_auth(redirect_uri).await {
            Ok(start) => Ok(start),
            Err(e) => {
                self.inner.update_connection(provider, |c| {
                    c.status = if c.tokens.is_some() {
                        ProviderStatus::Connected
                    } else {
                        ProviderStatus::Disconnected
                    };
                });
                Err(e)
            }
        }
    }

    /// Finish the auth flow: store tokens and account, locate or create the
    /// container, persist the connection as `connected`.
    pub async fn complete_provider_auth(
        &self,
        provider: Provider,
        evidence: AuthEvidence,
    ) -> Result<Option<AccountInfo>, SyncError> {
        let _guard = self.inner.op.lock().await;
        let adapter = self.inner.adapter(provider);

        let result = async {
            let (tokens, account) = adapter.complete_auth(evidence).await?;
            let resource_id = adapter.initialize_sync().await?;
            Ok::<_, SyncError>((tokens, account, resource_id))
        }
        .await;

        match result {
            Ok((tokens, account, resource_id)) => {
                self.inner.update_connection(provider, |c| {
                    c.status = ProviderStatus::Connected;
                    c.tokens = Some(tokens.clone());
                    c.account = account.clone();
                    c.resource_id = resource_id.clone();
                    c.error = None;
                });
                self.inner.persist_connection(provider)?;
                self.inner
                    .emit(SyncEvent::AuthCompleted { provider, account: account.clone() });
                info!(%provider, "provider connected");
                Ok(account)
            }
            Err(e) => {
                self.inner.update_connection(provider, |c| {
                    c.status = if c.tokens.is_some() {
                        ProviderStatus::Connected
                    } else {
                        ProviderStatus::Disconnected
                    };
                });
                Err(e)
            }
        }
    }

    /// Sign out and clear the persisted connection.
    pub async fn disconnect(&self, provider: Provider) -> Result<(), SyncError> {
        let _guard = self.inner.op.lock().await;
        let adapter = self.inner.adapter(provider);
        if let Err(e) = adapter.sign_out().await {
            warn!(%provider, error = %e, "sign-out was not clean");
        }
        adapter.set_session(None, None);
        {
            let mut shared = self.inner.shared.lock().unwrap();
            shared
                .connections
                .insert(provider, ProviderConnection::disconnected(provider));
        }
        self.inner.persist_connection(provider)?;
        info!(%provider, "provider disconnected");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sync commands
    // -----------------------------------------------------------------------

    /// Upload `payload` to `provider`, blocking on a remote writer being
    /// ahead. Fails fast with `Busy` while another mutating command runs.
    pub async fn push(&self, provider: Provider, payload: &VaultPayload) -> Result<PushOutcome, SyncError> {
        let guard = self.inner.op.try_lock().map_err(|_| SyncError::Busy)?;
        let result = self.push_body(provider, payload).await;
        drop(guard);
        result
    }

    /// FIFO-queued variant of [`SyncEngine::push`]: waits for the in-flight
    /// command instead of returning `Busy`.
    pub async fn push_queued(
        &self,
        provider: Provider,
        payload: &VaultPayload,
    ) -> Result<PushOutcome, SyncError> {
        let guard = self.inner.op.lock().await;
        let result = self.push_body(provider, payload).await;
        drop(guard);
        result
    }

    /// Download, decrypt, and adopt the remote markers. `Ok(None)` when the
    /// provider holds no synced file yet.
    pub async fn pull(&self, provider: Provider) -> Result<Option<PullOutcome>, SyncError> {
        let guard = self.inner.op.try_lock().map_err(|_| SyncError::Busy)?;
        let result = self.pull_body(provider).await;
        drop(guard);
        result
    }

    /// Resolve a pending conflict.
    ///
    /// `UseRemote` downloads and returns the remote payload for local
    /// adoption, moving the local markers to match. `UseLocal` only clears
    /// the conflict: the engine never force-overwrites, so the host must
    /// refresh its local state and re-issue `push` explicitly.
    pub async fn resolve_conflict(
        &self,
        choice: ResolveChoice,
    ) -> Result<Option<PullOutcome>, SyncError> {
        let guard = self.inner.op.try_lock().map_err(|_| SyncError::Busy)?;
        let result = self.resolve_body(choice).await;
        drop(guard);
        result
    }

    /// Persist auto-sync settings; the interval clamps to `[1, 1440]`
    /// minutes. The timer follows the unlock state.
    pub async fn set_auto_sync(
        &self,
        enabled: bool,
        interval_min: u32,
    ) -> Result<AutoSyncConfig, SyncError> {
        let _guard = self.inner.op.lock().await;
        let clamped = AutoSyncConfig::clamped(enabled, interval_min);
        {
            let mut shared = self.inner.shared.lock().unwrap();
            shared.sync_config.auto_sync = clamped;
        }
        self.inner.persist_sync_config()?;
        self.inner.stop_auto_sync();
        EngineInner::maybe_start_auto_sync(&self.inner);
        Ok(clamped)
    }

    // -----------------------------------------------------------------------
    // Command bodies (run under the op mutex)
    // -----------------------------------------------------------------------

    async fn push_body(&self, provider: Provider, payload: &VaultPayload) -> Result<PushOutcome, SyncError> {
        self.inner.tick_outstanding.store(false, Ordering::SeqCst);
        self.inner.require_unlocked()?;
        self.inner.require_connected(provider)?;
        if let Some(existing) = self.inner.shared.lock().unwrap().conflict.clone() {
            return Ok(PushOutcome::Conflict(existing));
        }

        self.inner.set_sync_state(SyncState::Syncing);
        self.inner.emit(SyncEvent::SyncStarted { provider });
        let adapter = self.inner.adapter(provider);
        let marker = self.inner.marker(provider);
        // The local side of the last-writer check is the sync marker advanced
        // to the host's own edit stamp: a local edit after the remote write
        // makes this device the last writer.
        let local = VersionMarker {
            version: marker.version,
            updated_at: marker.updated_at.max(payload.synced_at),
        };

        let remote = match self.inner.download_checked(provider, &adapter).await {
            Ok(remote) => remote,
            Err(e) => return Err(self.inner.fail_sync(provider, SyncAction::Upload, local.version, e)),
        };

        match version::check_upload(&local, remote.as_ref().map(|f| &f.meta)) {
            UploadDecision::RemoteAhead => {
                let remote_meta = &remote.as_ref().expect("remote present when ahead").meta;
                let conflict = ConflictInfo::new(provider, &local, remote_meta);
                {
                    let mut shared = self.inner.shared.lock().unwrap();
                    shared.conflict = Some(conflict.clone());
                    shared.sync = SyncState::Conflict;
                }
                self.inner
                    .emit(SyncEvent::ConflictDetected { conflict: conflict.clone() });
                debug!(%provider, local = local.version, remote = remote_meta.version, "push blocked by conflict");
                Ok(PushOutcome::Conflict(conflict))
            }
            UploadDecision::InSync => {
                self.inner.set_sync_state(SyncState::Idle);
                Ok(PushOutcome::AlreadyInSync { version: local.version })
            }
            UploadDecision::Proceed => {
                // Base the next version past both sides: overwriting a
                // remote the user chose to discard must still move the
                // document version forward.
                let prior_version = local
                    .version
                    .max(remote.as_ref().map(|f| f.meta.version).unwrap_or(0));
                let file = match self.seal_payload(payload, prior_version).await {
                    Ok(file) => file,
                    Err(e) => {
                        return Err(self.inner.fail_sync(provider, SyncAction::Upload, local.version, e))
                    }
                };
                if let Err(e) = self
                    .inner
                    .with_retry(provider, || adapter.upload(&file))
                    .await
                {
                    return Err(self.inner.fail_sync(provider, SyncAction::Upload, local.version, e));
                }

                let marker = VersionMarker::from_meta(&file.meta);
                if let Err(e) = self.inner.commit_markers(provider, marker) {
                    return Err(self.inner.fail_sync(provider, SyncAction::Upload, local.version, e));
                }
                self.inner.record_history(
                    SyncHistoryEntry::new(
                        self.inner.clock.now_ms(),
                        provider,
                        SyncAction::Upload,
                        marker.version,
                    )
                    .with_remote_version(marker.version)
                    .with_device_name(self.inner.device.name.clone()),
                );
                self.inner.set_sync_state(SyncState::Idle);
                let summary = SyncSummary {
                    action: SyncAction::Upload,
                    version: marker.version,
                    updated_at: marker.updated_at,
                };
                self.inner
                    .emit(SyncEvent::SyncCompleted { provider, result: summary });
                info!(%provider, version = marker.version, "push completed");
                Ok(PushOutcome::Uploaded {
                    version: marker.version,
                    updated_at: marker.updated_at,
                })
            }
        }
    }

    async fn pull_body(&self, provider: Provider) -> Result<Option<PullOutcome>, SyncError> {
        self.inner.require_unlocked()?;
        self.inner.require_connected(provider)?;
        if self.inner.shared.lock().unwrap().conflict.is_some() {
            return Err(SyncError::Busy);
        }

        self.inner.set_sync_state(SyncState::Syncing);
        self.inner.emit(SyncEvent::SyncStarted { provider });
        let adapter = self.inner.adapter(provider);
        let local = self.inner.marker(provider);

        let outcome = self.download_and_adopt(provider, &adapter).await;
        match outcome {
            Ok(None) => {
                self.inner.set_sync_state(SyncState::Idle);
                Ok(None)
            }
            Ok(Some(pulled)) => {
                self.inner.record_history(
                    SyncHistoryEntry::new(
                        self.inner.clock.now_ms(),
                        provider,
                        SyncAction::Download,
                        pulled.version,
                    )
                    .with_remote_version(pulled.version),
                );
                self.inner.set_sync_state(SyncState::Idle);
                let summary = SyncSummary {
                    action: SyncAction::Download,
                    version: pulled.version,
                    updated_at: pulled.updated_at,
                };
                self.inner
                    .emit(SyncEvent::SyncCompleted { provider, result: summary });
                Ok(Some(pulled))
            }
            Err(e) => Err(self.inner.fail_sync(provider, SyncAction::Download, local.version, e)),
        }
    }

    async fn resolve_body(&self, choice: ResolveChoice) -> Result<Option<PullOutcome>, SyncError> {
        let conflict = self
            .inner
            .shared
            .lock()
            .unwrap()
            .conflict
            .clone()
            .ok_or(SyncError::NoConflictPending)?;
        let provider = conflict.provider;

        match choice {
            ResolveChoice::UseLocal => {
                {
                    let mut shared = self.inner.shared.lock().unwrap();
                    shared.conflict = None;
                    shared.sync = SyncState::Idle;
                }
                self.inner.emit(SyncEvent::ConflictResolved { choice });
                info!(%provider, "conflict resolved keeping local data");
                Ok(None)
            }
            ResolveChoice::UseRemote => {
                let adapter = self.inner.adapter(provider);
                let pulled = match self.download_and_adopt(provider, &adapter).await {
                    Ok(pulled) => pulled,
                    Err(e) => {
                        return Err(self.inner.fail_sync(
                            provider,
                            SyncAction::Download,
                            conflict.local.version,
                            e,
                        ))
                    }
                };
                if let Some(pulled) = &pulled {
                    self.inner.record_history(
                        SyncHistoryEntry::new(
                            self.inner.clock.now_ms(),
                            provider,
                            SyncAction::Download,
                            pulled.version,
                        )
                        .with_remote_version(pulled.version)
                        .with_device_name(
                            conflict.remote.device_name.clone().unwrap_or_default(),
                        ),
                    );
                }
                {
                    let mut shared = self.inner.shared.lock().unwrap();
                    shared.conflict = None;
                    shared.sync = SyncState::Idle;
                }
                self.inner.emit(SyncEvent::ConflictResolved { choice });
                info!(%provider, "conflict resolved adopting remote data");
                Ok(pulled)
            }
        }
    }

    /// Download, decrypt with the vault password, and move local markers to
    /// the remote position. Shared by `pull` and `resolve(UseRemote)`.
    async fn download_and_adopt(
        &self,
        provider: Provider,
        adapter: &Arc<dyn CloudAdapter>,
    ) -> Result<Option<PullOutcome>, SyncError> {
        let Some(file) = self.inner.download_checked(provider, adapter).await? else {
            return Ok(None);
        };
        let payload = self.open_payload(&file).await?;
        let marker = VersionMarker::from_meta(&file.meta);
        self.inner.commit_markers(provider, marker)?;
        Ok(Some(PullOutcome {
            payload,
            version: marker.version,
            updated_at: marker.updated_at,
        }))
    }

    /// Encrypt on the blocking pool; PBKDF2 at production iteration counts is
    /// far past the ~300 ms cooperative budget.
    async fn seal_payload(
        &self,
        payload: &VaultPayload,
        prior_version: u64,
    ) -> Result<SyncedFile, SyncError> {
        let password = Zeroizing::new(self.inner.keys.with_password(str::to_string)?);
        let payload = payload.clone();
        let device = self.inner.device.clone();
        let iterations = self.inner.config.kdf_iterations;
        let now_ms = self.inner.clock.now_ms();
        tokio::task::spawn_blocking(move || {
            encrypt_payload_with(&payload, &password, iterations, &device, prior_version, now_ms)
        })
        .await
        .map_err(|_| SyncError::CancelledByCaller)?
        .map_err(SyncError::from)
    }

    async fn open_payload(&self, file: &SyncedFile) -> Result<VaultPayload, SyncError> {
        let password = Zeroizing::new(self.inner.keys.with_password(str::to_string)?);
        let file = file.clone();
        tokio::task::spawn_blocking(move || decrypt_payload::<VaultPayload>(&file, &password))
            .await
            .map_err(|_| SyncError::CancelledByCaller)?
            .map_err(SyncError::from)
    }
}

// ---------------------------------------------------------------------------
// Inner helpers
// ---------------------------------------------------------------------------

impl EngineInner {
    pub(crate) fn adapter(&self, provider: Provider) -> Arc<dyn CloudAdapter> {
        self.adapters[&provider].clone()
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    fn marker(&self, provider: Provider) -> VersionMarker {
        self.shared
            .lock()
            .unwrap()
            .sync_config
            .markers
            .get(&provider)
            .copied()
            .unwrap_or_default()
    }

    fn require_unlocked(&self) -> Result<(), SyncError> {
        match self.keys.security_state() {
            SecurityState::Unlocked => Ok(()),
            SecurityState::Locked => Err(SyncError::VaultLocked),
            SecurityState::NoKey => Err(SyncError::NoMasterKey),
        }
    }

    fn require_connected(&self, provider: Provider) -> Result<(), SyncError> {
        let shared = self.shared.lock().unwrap();
        let connected = shared
            .connections
            .get(&provider)
            .map(|c| c.is_connected())
            .unwrap_or(false);
        if connected {
            Ok(())
        } else {
            Err(SyncError::ProviderNotConnected(provider))
        }
    }

    fn set_sync_state(&self, state: SyncState) {
        self.shared.lock().unwrap().sync = state;
    }

    pub(crate) fn update_connection(
        &self,
        provider: Provider,
        mutate: impl FnOnce(&mut ProviderConnection),
    ) {
        let mut shared = self.shared.lock().unwrap();
        let connection = shared
            .connections
            .entry(provider)
            .or_insert_with(|| ProviderConnection::disconnected(provider));
        mutate(connection);
    }

    /// Persist a connection record, normalizing transient statuses.
    pub(crate) fn persist_connection(&self, provider: Provider) -> Result<(), SyncError> {
        let record = {
            let shared = self.shared.lock().unwrap();
            shared.connections[&provider].clone().normalize_restored()
        };
        storage::write_json(self.store.as_ref(), provider.storage_key(), &record, true)?;
        Ok(())
    }

    fn persist_sync_config(&self) -> Result<(), SyncError> {
        let config = self.shared.lock().unwrap().sync_config.clone();
        storage::write_json(self.store.as_ref(), keys::SYNC_CONFIG, &config, false)?;
        Ok(())
    }

    /// Update markers and the connection's last-sync fields, persisting both.
    /// Also captures any token refresh an adapter performed along the way.
    fn commit_markers(&self, provider: Provider, marker: VersionMarker) -> Result<(), SyncError> {
        let adapter_tokens = self.adapters[&provider].tokens();
        let adapter_resource = self.adapters[&provider].resource_id();
        {
            let mut shared = self.shared.lock().unwrap();
            shared.sync_config.markers.insert(provider, marker);
            let connection = shared
                .connections
                .entry(provider)
                .or_insert_with(|| ProviderConnection::disconnected(provider));
            connection.last_sync = Some(marker.updated_at);
            connection.last_sync_version = Some(marker.version);
            connection.status = ProviderStatus::Connected;
            connection.error = None;
            if adapter_tokens.is_some() {
                connection.tokens = adapter_tokens;
            }
            if adapter_resource.is_some() {
                connection.resource_id = adapter_resource;
            }
        }
        self.persist_sync_config()?;
        self.persist_connection(provider)?;
        Ok(())
    }

    fn record_history(&self, entry: SyncHistoryEntry) {
        let mut shared = self.shared.lock().unwrap();
        let store = self.store.clone();
        shared.history.record(store.as_ref(), entry);
    }

    /// Shared failure path: history, connection error bookkeeping, events.
    /// Leaves the sync axis in `Error` so observers see what happened; the
    /// next command starts from there.
    fn fail_sync(
        &self,
        provider: Provider,
        action: SyncAction,
        local_version: u64,
        error: SyncError,
    ) -> SyncError {
        warn!(%provider, error = %error, "sync failed");
        self.record_history(
            SyncHistoryEntry::new(self.clock.now_ms(), provider, action, local_version)
                .with_failure(error.reason_tag()),
        );
        if matches!(error, SyncError::ReauthRequired(_)) {
            self.update_connection(provider, |c| {
                c.status = ProviderStatus::Error;
                c.error = Some("reauth_required".into());
            });
        } else {
            self.update_connection(provider, |c| {
                c.error = Some(error.reason_tag().into());
            });
        }
        self.set_sync_state(SyncState::Error);
        self.emit(SyncEvent::SyncError {
            provider,
            reason: error.reason_tag().into(),
        });
        error
    }

    /// Download with transient retry plus one silent re-download when the
    /// remote content fails to parse.
    async fn download_checked(
        &self,
        provider: Provider,
        adapter: &Arc<dyn CloudAdapter>,
    ) -> Result<Option<SyncedFile>, SyncError> {
        match self.with_retry(provider, || adapter.download()).await {
            Ok(file) => Ok(file),
            Err(SyncError::MalformedFile(first)) => {
                debug!(%provider, detail = %first, "re-downloading malformed file");
                self.with_retry(provider, || adapter.download()).await
            }
            Err(e) => Err(e),
        }
    }

    /// Bounded exponential back-off for transient provider failures.
    async fn with_retry<T, F, Fut>(&self, provider: Provider, mut attempt: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, SyncError>>,
    {
        let mut last_error = None;
        for delay_ms in std::iter::once(None).chain(RETRY_DELAYS_MS.iter().map(|d| Some(*d))) {
            if let Some(delay_ms) = delay_ms {
                tokio::time::sleep(Duration::from_millis(delay_ms + retry_jitter_ms())).await;
            }
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    debug!(%provider, error = %e, "retrying transient failure");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.expect("at least one attempt ran"))
    }

    // -- auto-sync ----------------------------------------------------------

    /// Start the tick task when enabled and unlocked. The engine never reads
    /// application state itself: each tick emits `SyncStarted` per connected
    /// provider and the host answers with `push`. A tick whose predecessor
    /// went unanswered is skipped.
    pub(crate) fn maybe_start_auto_sync(inner: &Arc<EngineInner>) {
        let auto_sync = inner.shared.lock().unwrap().sync_config.auto_sync;
        if !auto_sync.enabled || inner.keys.security_state() != SecurityState::Unlocked {
            return;
        }
        let mut slot = inner.auto_sync_task.lock().unwrap();
        if slot.is_some() {
            return;
        }
        let weak = Arc::downgrade(inner);
        let interval = Duration::from_secs(u64::from(auto_sync.interval_min) * 60);
        *slot = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.keys.security_state() != SecurityState::Unlocked {
                    continue;
                }
                if inner.tick_outstanding.swap(true, Ordering::SeqCst) {
                    // Host never answered the previous tick; skip this one.
                    inner.tick_outstanding.store(false, Ordering::SeqCst);
                    debug!("auto-sync tick skipped, previous tick unanswered");
                    continue;
                }
                let connected: Vec<Provider> = {
                    let shared = inner.shared.lock().unwrap();
                    shared
                        .connections
                        .values()
                        .filter(|c| c.is_connected())
                        .map(|c| c.provider)
                        .collect()
                };
                if connected.is_empty() {
                    inner.tick_outstanding.store(false, Ordering::SeqCst);
                    continue;
                }
                for provider in connected {
                    inner.emit(SyncEvent::SyncStarted { provider });
                }
            }
        }));
    }

    pub(crate) fn stop_auto_sync(&self) {
        if let Some(task) = self.auto_sync_task.lock().unwrap().take() {
            task.abort();
        }
        self.tick_outstanding.store(false, Ordering::SeqCst);
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.stop_auto_sync();
        let handle = self.store_subscription.load(Ordering::SeqCst);
        self.store.unsubscribe(handle);
    }
}

fn retry_jitter_ms() -> u64 {
    let mut bytes = [0u8; 2];
    let _ = getrandom::getrandom(&mut bytes);
    u64::from(u16::from_le_bytes(bytes)) % RETRY_JITTER_MS
}

// ---------------------------------------------------------------------------
// Event subscription
// ---------------------------------------------------------------------------

/// Handle to an event stream. Dropping it removes the observer.
pub struct EventSubscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<SyncEvent>,
    inner: Weak<EngineInner>,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> Option<SyncEvent> {
        self.rx.recv().await
    }

    /// Non-blocking drain step.
    pub fn try_recv(&mut self) -> Option<SyncEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner
                .subscribers
                .lock()
                .unwrap()
                .retain(|(id, _)| *id != self.id);
        }
    }
}

// ---------------------------------------------------------------------------
// Device identity bootstrap
// ---------------------------------------------------------------------------

fn load_device_identity(
    store: &dyn SecretStore,
    config: &EngineConfig,
) -> Result<DeviceIdentity, SyncError> {
    let id = match storage::read_json::<String>(store, keys::DEVICE_ID) {
        Some(id) => id,
        None => {
            let mut bytes = [0u8; 16];
            getrandom::getrandom(&mut bytes)
                .map_err(|_| SyncError::StorageUnavailable("rng".into()))?;
            let id = hex::encode(bytes);
            storage::write_json(store, keys::DEVICE_ID, &id, false)?;
            id
        }
    };
    let name = match storage::read_json::<String>(store, keys::DEVICE_NAME) {
        Some(name) => name,
        None => {
            let name = config
                .device_name
                .clone()
                .unwrap_or_else(|| "unknown-device".to_string());
            storage::write_json(store, keys::DEVICE_NAME, &name, false)?;
            name
        }
    };
    Ok(DeviceIdentity {
        id,
        name,
        app_version: config.app_version.clone(),
    })
}
