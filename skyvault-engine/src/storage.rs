//! Secret-storage port: where connection records, sync settings, and the
//! master-key configuration live.
//!
//! The store is shared across processes (main window, settings pane); all
//! writes are full-value and rely on storage-level atomicity per key.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

// ---------------------------------------------------------------------------
// Key namespace
// ---------------------------------------------------------------------------

/// Stable storage keys. Renaming any of these orphans user data.
pub mod keys {
    pub const MASTER_KEY_CONFIG: &str = "master_key_config";
    pub const DEVICE_ID: &str = "device_id";
    pub const DEVICE_NAME: &str = "device_name";
    pub const SYNC_CONFIG: &str = "sync_config";
    pub const SYNC_HISTORY: &str = "sync_history";
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageError(pub String);

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "storage: {}", self.0)
    }
}

impl std::error::Error for StorageError {}

impl From<StorageError> for crate::error::SyncError {
    fn from(e: StorageError) -> Self {
        crate::error::SyncError::StorageUnavailable(e.0)
    }
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Callback fired when another process mutates a key in the same store.
pub type ChangeListener = Box<dyn Fn(&str) + Send + Sync>;

/// String key/value store with change notifications.
///
/// Implement this for your platform:
/// - [`InMemorySecretStore`] (tests, ephemeral use)
/// - [`FileSecretStore`] (one JSON file per key)
/// - OS keychain / encrypted settings store (production)
///
/// Values flagged `sensitive` (tokens, verification hash) SHOULD be wrapped
/// by platform secret APIs where available. The master password itself is
/// never handed to a store.
pub trait SecretStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn put(&self, key: &str, value: &str, sensitive: bool) -> Result<(), StorageError>;
    fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Register for external-change notifications. Returns a handle usable
    /// with [`SecretStore::unsubscribe`].
    fn subscribe(&self, listener: ChangeListener) -> u64;
    fn unsubscribe(&self, handle: u64);
}

/// Read a JSON value, treating missing and malformed data alike as absent.
pub fn read_json<T: DeserializeOwned>(store: &dyn SecretStore, key: &str) -> Option<T> {
    let raw = store.get(key).ok().flatten()?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key, error = %e, "discarding malformed stored value");
            None
        }
    }
}

/// Serialize and write a JSON value.
pub fn write_json<T: Serialize>(
    store: &dyn SecretStore,
    key: &str,
    value: &T,
    sensitive: bool,
) -> Result<(), StorageError> {
    let raw = serde_json::to_string(value).map_err(|e| StorageError(format!("serialize: {}", e)))?;
    store.put(key, &raw, sensitive)
}

// ---------------------------------------------------------------------------
// Listener registry (shared by the backends)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Listeners {
    next: u64,
    entries: Vec<(u64, ChangeListener)>,
}

impl Listeners {
    fn add(&mut self, listener: ChangeListener) -> u64 {
        self.next += 1;
        self.entries.push((self.next, listener));
        self.next
    }

    fn remove(&mut self, handle: u64) {
        self.entries.retain(|(id, _)| *id != handle);
    }

    fn fire(&self, key: &str) {
        for (_, listener) in &self.entries {
            listener(key);
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// In-memory store. Same-instance writes do not fire listeners; use
/// [`InMemorySecretStore::external_put`] to simulate another process.
#[derive(Default)]
pub struct InMemorySecretStore {
    values: RwLock<HashMap<String, String>>,
    listeners: Mutex<Listeners>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write as if a sibling process did it, firing change listeners.
    pub fn external_put(&self, key: &str, value: &str) {
        self.values
            .write()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        self.listeners.lock().unwrap().fire(key);
    }

    /// Delete as if a sibling process did it, firing change listeners.
    pub fn external_delete(&self, key: &str) {
        self.values.write().unwrap().remove(key);
        self.listeners.lock().unwrap().fire(key);
    }
}

impl SecretStore for InMemorySecretStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.values.read().unwrap().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str, _sensitive: bool) -> Result<(), StorageError> {
        self.values
            .write()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.values.write().unwrap().remove(key);
        Ok(())
    }

    fn subscribe(&self, listener: ChangeListener) -> u64 {
        self.listeners.lock().unwrap().add(listener)
    }

    fn unsubscribe(&self, handle: u64) {
        self.listeners.lock().unwrap().remove(handle);
    }
}

// ---------------------------------------------------------------------------
// File backend
// ---------------------------------------------------------------------------

/// File-based store: one JSON file per key.
///
/// Directory layout:
/// ```text
/// store/
///   master_key_config.json
///   provider.gist.json
///   ...
/// ```
///
/// Writes go to a temp file first and are renamed into place. There is no
/// built-in file watcher; hosts bridge their own IPC into
/// [`FileSecretStore::notify_external_change`].
pub struct FileSecretStore {
    dir: PathBuf,
    listeners: Mutex<Listeners>,
}

impl FileSecretStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| StorageError(format!("create dir: {}", e)))?;
        Ok(Self {
            dir,
            listeners: Mutex::new(Listeners::default()),
        })
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    /// Tell this instance that another process changed `key`.
    pub fn notify_external_change(&self, key: &str) {
        self.listeners.lock().unwrap().fire(key);
    }

    #[cfg(unix)]
    fn restrict_permissions(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }

    #[cfg(not(unix))]
    fn restrict_permissions(_path: &Path) {}
}

impl SecretStore for FileSecretStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.key_path(key);
        if !path.exists() {
            return Ok(None);
        }
        std::fs::read_to_string(&path)
            .map(Some)
            .map_err(|e| StorageError(format!("read {}: {}", key, e)))
    }

    fn put(&self, key: &str, value: &str, sensitive: bool) -> Result<(), StorageError> {
        let path = self.key_path(key);
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, value).map_err(|e| StorageError(format!("write {}: {}", key, e)))?;
        if sensitive {
            Self::restrict_permissions(&tmp);
        }
        std::fs::rename(&tmp, &path)
            .map_err(|e| StorageError(format!("rename {}: {}", key, e)))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.key_path(key);
        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| StorageError(format!("delete {}: {}", key, e)))?;
        }
        Ok(())
    }

    fn subscribe(&self, listener: ChangeListener) -> u64 {
        self.listeners.lock().unwrap().add(listener)
    }

    fn unsubscribe(&self, handle: u64) {
        self.listeners.lock().unwrap().remove(handle);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
