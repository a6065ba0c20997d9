//! Master-key manager: derive-and-verify, in-memory unlocked key, password
//! lifecycle.
//!
//! The persisted configuration never contains the password or the derived
//! key; a SHA-256 verification hash of the key bytes is enough to confirm
//! password correctness. The unlocked key (and the password, which fresh-salt
//! encryption re-derives from on every push) lives only in memory and is
//! zeroized on lock.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use zeroize::Zeroizing;

use crate::clock::Clock;
use crate::error::SyncError;
use crate::storage::{self, keys, SecretStore};
use crate::types::SecurityState;
use skyvault_envelope::{
    base64_decode, base64_encode, derive_key, fresh_salt, DerivedKey, SALT_BYTES,
};

/// KDF identifier written into the persisted configuration.
pub const KDF_ID: &str = "PBKDF2-HMAC-SHA256";

// ---------------------------------------------------------------------------
// Persisted configuration
// ---------------------------------------------------------------------------

/// Created once per user; replaced atomically on password change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterKeyConfig {
    /// base64, 32 bytes.
    pub salt: String,
    pub kdf: String,
    pub iterations: u32,
    /// base64(sha256(derived key bytes)).
    pub verification_hash: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// In-memory unlocked state
// ---------------------------------------------------------------------------

/// Never serialized, never logged.
pub struct UnlockedKey {
    key: DerivedKey,
    password: Zeroizing<String>,
    pub unlocked_at: i64,
}

impl std::fmt::Debug for UnlockedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnlockedKey")
            .field("unlocked_at", &self.unlocked_at)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct MasterKeyManager {
    store: Arc<dyn SecretStore>,
    clock: Arc<dyn Clock>,
    /// Iteration count for newly created configurations.
    iterations: u32,
    unlocked: Mutex<Option<UnlockedKey>>,
}

impl MasterKeyManager {
    pub fn new(store: Arc<dyn SecretStore>, clock: Arc<dyn Clock>, iterations: u32) -> Self {
        Self {
            store,
            clock,
            iterations,
            unlocked: Mutex::new(None),
        }
    }

    pub fn config(&self) -> Option<MasterKeyConfig> {
        storage::read_json(self.store.as_ref(), keys::MASTER_KEY_CONFIG)
    }

    pub fn security_state(&self) -> SecurityState {
        if self.config().is_none() {
            SecurityState::NoKey
        } else if self.unlocked.lock().unwrap().is_some() {
            SecurityState::Unlocked
        } else {
            SecurityState::Locked
        }
    }

    /// Create the master-key configuration and unlock with it.
    pub async fn setup(&self, password: &str) -> Result<(), SyncError> {
        if self.config().is_some() {
            return Err(SyncError::AlreadyInitialized);
        }
        let salt = fresh_salt().map_err(|_| SyncError::StorageUnavailable("rng".into()))?;
        let key = self.derive(password, salt, self.iterations).await?;

        let config = MasterKeyConfig {
            salt: base64_encode(&salt),
            kdf: KDF_ID.into(),
            iterations: self.iterations,
            verification_hash: base64_encode(&key.verification_hash()),
            created_at: Utc::now(),
        };
        storage::write_json(self.store.as_ref(), keys::MASTER_KEY_CONFIG, &config, true)?;
        info!(iterations = self.iterations, "master key configured");

        self.install(key, password);
        Ok(())
    }

    /// Re-derive and compare. `Ok(true)` installs the key in memory.
    pub async fn unlock(&self, password: &str) -> Result<bool, SyncError> {
        let config = self.config().ok_or(SyncError::NoMasterKey)?;
        let salt = decode_salt(&config)?;
        let expected = base64_decode("verificationHash", &config.verification_hash)
            .map_err(|_| corrupt_config())?;

        let key = self.derive(password, salt, config.iterations).await?;
        if !key.matches_verification_hash(&expected) {
            return Ok(false);
        }
        self.install(key, password);
        info!("vault unlocked");
        Ok(true)
    }

    /// Zeroize the in-memory key and cached password.
    pub fn lock(&self) {
        // DerivedKey and Zeroizing wipe themselves on drop.
        if self.unlocked.lock().unwrap().take().is_some() {
            info!("vault locked");
        }
    }

    /// Non-mutating password check. True iff `unlock` would succeed.
    pub async fn verify_password(&self, password: &str) -> Result<bool, SyncError> {
        let config = self.config().ok_or(SyncError::NoMasterKey)?;
        let salt = decode_salt(&config)?;
        let expected = base64_decode("verificationHash", &config.verification_hash)
            .map_err(|_| corrupt_config())?;
        let key = self.derive(password, salt, config.iterations).await?;
        Ok(key.matches_verification_hash(&expected))
    }

    /// Verify `old`, write a fresh configuration (new salt, same iteration
    /// count), and re-unlock with `new`. Callers must re-upload to every
    /// connected provider afterwards — remote files are sealed with the old
    /// password until they do.
    pub async fn change_password(&self, old: &str, new: &str) -> Result<(), SyncError> {
        let config = self.config().ok_or(SyncError::NoMasterKey)?;
        if !self.verify_password(old).await? {
            return Err(SyncError::WrongPassword);
        }

        let salt = fresh_salt().map_err(|_| SyncError::StorageUnavailable("rng".into()))?;
        let key = self.derive(new, salt, config.iterations).await?;
        let replacement = MasterKeyConfig {
            salt: base64_encode(&salt),
            kdf: KDF_ID.into(),
            iterations: config.iterations,
            verification_hash: base64_encode(&key.verification_hash()),
            created_at: Utc::now(),
        };
        storage::write_json(self.store.as_ref(), keys::MASTER_KEY_CONFIG, &replacement, true)?;
        info!("master password changed");

        self.install(key, new);
        Ok(())
    }

    /// Borrow the cached password for an envelope operation.
    ///
    /// Fails with `VaultLocked` (or `NoMasterKey`) rather than handing out
    /// anything when locked.
    pub fn with_password<R>(&self, f: impl FnOnce(&str) -> R) -> Result<R, SyncError> {
        let guard = self.unlocked.lock().unwrap();
        match guard.as_ref() {
            Some(unlocked) => Ok(f(&unlocked.password)),
            None if self.config().is_none() => Err(SyncError::NoMasterKey),
            None => Err(SyncError::VaultLocked),
        }
    }

    /// Borrow the unlocked key itself, for hosts encrypting local-only data
    /// under the master key. The key is never cloned out.
    pub fn with_key<R>(&self, f: impl FnOnce(&DerivedKey) -> R) -> Result<R, SyncError> {
        let guard = self.unlocked.lock().unwrap();
        match guard.as_ref() {
            Some(unlocked) => Ok(f(&unlocked.key)),
            None if self.config().is_none() => Err(SyncError::NoMasterKey),
            None => Err(SyncError::VaultLocked),
        }
    }

    fn install(&self, key: DerivedKey, password: &str) {
        *self.unlocked.lock().unwrap() = Some(UnlockedKey {
            key,
            password: Zeroizing::new(password.to_string()),
            unlocked_at: self.clock.now_ms(),
        });
    }

    /// PBKDF2 is CPU-bound; keep it off the cooperative executor.
    async fn derive(
        &self,
        password: &str,
        salt: [u8; SALT_BYTES],
        iterations: u32,
    ) -> Result<DerivedKey, SyncError> {
        let password = Zeroizing::new(password.to_string());
        tokio::task::spawn_blocking(move || derive_key(&password, &salt, iterations))
            .await
            .map_err(|_| SyncError::CancelledByCaller)?
            .map_err(SyncError::from)
    }
}

fn decode_salt(config: &MasterKeyConfig) -> Result<[u8; SALT_BYTES], SyncError> {
    let bytes = base64_decode("salt", &config.salt).map_err(|_| corrupt_config())?;
    bytes.as_slice().try_into().map_err(|_| corrupt_config())
}

fn corrupt_config() -> SyncError {
    SyncError::StorageUnavailable("master_key_config corrupt".into())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::InMemorySecretStore;
    use skyvault_envelope::MIN_ITERATIONS;

    fn manager() -> (MasterKeyManager, Arc<InMemorySecretStore>) {
        let store = Arc::new(InMemorySecretStore::new());
        let clock = Arc::new(ManualClock::new(1_000));
        (
            MasterKeyManager::new(store.clone(), clock, MIN_ITERATIONS),
            store,
        )
    }

    #[tokio::test]
    async fn setup_transitions_to_unlocked() {
        let (mgr, store) = manager();
        assert_eq!(mgr.security_state(), SecurityState::NoKey);

        mgr.setup("correct horse battery staple").await.unwrap();
        assert_eq!(mgr.security_state(), SecurityState::Unlocked);

        let config: MasterKeyConfig =
            storage::read_json(store.as_ref(), keys::MASTER_KEY_CONFIG).unwrap();
        assert_eq!(config.kdf, KDF_ID);
        assert_eq!(config.iterations, MIN_ITERATIONS);
        assert_eq!(base64_decode("salt", &config.salt).unwrap().len(), 32);
    }

    #[tokio::test]
    async fn setup_twice_fails() {
        let (mgr, _) = manager();
        mgr.setup("pw").await.unwrap();
        assert_eq!(mgr.setup("pw").await.unwrap_err(), SyncError::AlreadyInitialized);
    }

    #[tokio::test]
    async fn unlock_checks_verification_hash() {
        let (mgr, _) = manager();
        mgr.setup("right").await.unwrap();
        mgr.lock();
        assert_eq!(mgr.security_state(), SecurityState::Locked);

        assert!(!mgr.unlock("wrong").await.unwrap());
        assert_eq!(mgr.security_state(), SecurityState::Locked);

        assert!(mgr.unlock("right").await.unwrap());
        assert_eq!(mgr.security_state(), SecurityState::Unlocked);
    }

    #[tokio::test]
    async fn verify_password_matches_unlock_behavior() {
        let (mgr, _) = manager();
        mgr.setup("right").await.unwrap();
        assert!(mgr.verify_password("right").await.unwrap());
        assert!(!mgr.verify_password("wrong").await.unwrap());
        // Non-mutating: still unlocked, password still available.
        assert!(mgr.with_password(|p| p == "right").unwrap());
    }

    #[tokio::test]
    async fn lock_denies_password_access() {
        let (mgr, _) = manager();
        mgr.setup("pw").await.unwrap();
        mgr.lock();
        assert_eq!(
            mgr.with_password(|_| ()).unwrap_err(),
            SyncError::VaultLocked
        );
    }

    #[tokio::test]
    async fn change_password_swaps_config_and_reunlocks() {
        let (mgr, store) = manager();
        mgr.setup("old").await.unwrap();
        let before: MasterKeyConfig =
            storage::read_json(store.as_ref(), keys::MASTER_KEY_CONFIG).unwrap();

        assert_eq!(
            mgr.change_password("nope", "new").await.unwrap_err(),
            SyncError::WrongPassword
        );

        mgr.change_password("old", "new").await.unwrap();
        let after: MasterKeyConfig =
            storage::read_json(store.as_ref(), keys::MASTER_KEY_CONFIG).unwrap();
        assert_ne!(before.salt, after.salt);
        assert_ne!(before.verification_hash, after.verification_hash);
        assert_eq!(before.iterations, after.iterations);

        mgr.lock();
        assert!(!mgr.unlock("old").await.unwrap());
        assert!(mgr.unlock("new").await.unwrap());
    }

    #[tokio::test]
    async fn unlocked_key_matches_persisted_verification_hash() {
        let (mgr, store) = manager();
        mgr.setup("pw").await.unwrap();
        let config: MasterKeyConfig =
            storage::read_json(store.as_ref(), keys::MASTER_KEY_CONFIG).unwrap();
        let expected = base64_decode("verificationHash", &config.verification_hash).unwrap();
        assert!(mgr
            .with_key(|key| key.matches_verification_hash(&expected))
            .unwrap());
    }

    #[tokio::test]
    async fn no_master_key_surfaces_as_such() {
        let (mgr, _) = manager();
        assert_eq!(mgr.unlock("pw").await.unwrap_err(), SyncError::NoMasterKey);
        assert_eq!(
            mgr.with_password(|_| ()).unwrap_err(),
            SyncError::NoMasterKey
        );
    }
}
