//! Cross-instance coherence: settings panes and the main window may run as
//! separate OS processes over the same secret store. When a sibling process
//! writes a key, this instance re-reads it and reconciles adapter state so
//! both sides stay one logical engine.

use std::sync::{Arc, Weak};

use tokio::sync::mpsc;
use tracing::debug;

use crate::engine::EngineInner;
use crate::storage::{self, keys};
use crate::types::{Provider, ProviderConnection, SyncConfig, SyncEvent};

/// Drain external-change notifications until the engine goes away.
pub(crate) fn spawn_watcher(inner: Weak<EngineInner>, mut rx: mpsc::UnboundedReceiver<String>) {
    tokio::spawn(async move {
        while let Some(key) = rx.recv().await {
            let Some(inner) = inner.upgrade() else { break };
            apply_external_change(&inner, &key);
        }
    });
}

/// Re-read one storage key and fold it into engine state.
pub(crate) fn apply_external_change(inner: &Arc<EngineInner>, key: &str) {
    debug!(key, "external storage change");
    match key {
        keys::SYNC_CONFIG => {
            let fresh: SyncConfig =
                storage::read_json(inner.store.as_ref(), keys::SYNC_CONFIG).unwrap_or_default();
            {
                let mut shared = inner.shared.lock().unwrap();
                shared.sync_config = fresh;
            }
            // The timer follows whatever settings the sibling wrote.
            inner.stop_auto_sync();
            EngineInner::maybe_start_auto_sync(inner);
            inner.emit(SyncEvent::StateChanged);
        }
        keys::SYNC_HISTORY => {
            {
                let mut shared = inner.shared.lock().unwrap();
                let store = inner.store.clone();
                shared.history.reload(store.as_ref());
            }
            inner.emit(SyncEvent::StateChanged);
        }
        _ => {
            if let Some(provider) = Provider::from_storage_key(key) {
                reload_provider(inner, provider);
                inner.emit(SyncEvent::StateChanged);
            }
        }
    }
}

/// Adopt a sibling's connection record. Transient statuses owned by this
/// instance (`connecting`, `syncing`) survive the reload; the adapter session
/// is rebuilt when tokens or the container id moved under it.
fn reload_provider(inner: &Arc<EngineInner>, provider: Provider) {
    let stored = storage::read_json::<ProviderConnection>(inner.store.as_ref(), provider.storage_key())
        .map(ProviderConnection::normalize_restored)
        .unwrap_or_else(|| ProviderConnection::disconnected(provider));

    let (tokens_changed, resource_changed) = {
        let mut shared = inner.shared.lock().unwrap();
        let current = shared
            .connections
            .entry(provider)
            .or_insert_with(|| ProviderConnection::disconnected(provider));

        let mut fresh = stored;
        if current.status.is_transient() && current.status != crate::types::ProviderStatus::Error {
            fresh.status = current.status;
        }
        let tokens_changed = current.tokens != fresh.tokens;
        let resource_changed = current.resource_id != fresh.resource_id;
        *current = fresh;
        (tokens_changed, resource_changed)
    };

    if tokens_changed || resource_changed {
        let (tokens, resource_id) = {
            let shared = inner.shared.lock().unwrap();
            let connection = &shared.connections[&provider];
            (connection.tokens.clone(), connection.resource_id.clone())
        };
        debug!(%provider, "rebuilding adapter session after external change");
        inner.adapter(provider).set_session(tokens, resource_id);
    }
}
