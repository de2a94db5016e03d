//! State persistence
//!
//! A [`StatePersistent`] links one State to one persist key in one or more
//! storages. The persist key is independent from the State key.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::core::StateCore;
use super::State;
use crate::config::{IngestConfig, PersistConfig};
use crate::error::{StoreError, StoreResult};
use crate::storage::Storages;

/// Persistence handle of a State.
pub struct StatePersistent {
    state: Weak<StateCore>,
    storages: Storages,
    key: Mutex<String>,
    storage_keys: Vec<String>,
    default_storage_key: String,
    ready: AtomicBool,
    is_persisted: AtomicBool,
}

impl StatePersistent {
    /// Create the handle and attach it to `state`.
    ///
    /// Fails if one of the requested storages isn't registered.
    pub(crate) fn attach(
        state: &State,
        storages: &Storages,
        key: String,
        config: &PersistConfig,
    ) -> StoreResult<Arc<Self>> {
        let (storage_keys, default_storage_key) = resolve_storage_keys(storages, config)?;

        let persistent = Arc::new(Self {
            state: Arc::downgrade(&state.core),
            storages: storages.clone(),
            key: Mutex::new(key),
            storage_keys,
            default_storage_key,
            ready: AtomicBool::new(!config.load_value),
            is_persisted: AtomicBool::new(false),
        });
        state.core.data.lock().persistent = Some(Arc::clone(&persistent));
        debug!(observer = %state.id(), key = %persistent.key(), "state persistent attached");

        Ok(persistent)
    }

    pub fn key(&self) -> String {
        self.key.lock().clone()
    }

    pub fn storage_keys(&self) -> &[String] {
        &self.storage_keys
    }

    pub fn default_storage_key(&self) -> &str {
        &self.default_storage_key
    }

    /// False while the initial load is in flight. Applied values aren't
    /// written until then, so they can't overwrite the stored value.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_persisted(&self) -> bool {
        self.is_persisted.load(Ordering::Acquire)
    }

    /// Load the stored value, then report the outcome to `on_load`.
    ///
    /// If nothing was stored, the current value is stored instead.
    pub async fn initial_loading(&self) -> bool {
        let loaded = self.load_persisted_value().await;
        self.ready.store(true, Ordering::Release);
        if !loaded {
            self.persist_value();
        }
        self.is_persisted.store(true, Ordering::Release);

        let on_load = self
            .state
            .upgrade()
            .and_then(|core| core.data.lock().on_load.clone());
        if let Some(on_load) = on_load {
            on_load(loaded);
        }
        loaded
    }

    /// Apply the stored value to the State. Returns false if nothing was stored.
    pub async fn load_persisted_value(&self) -> bool {
        let key = self.key();
        let Some(value) = self
            .storages
            .get(&key, Some(&self.default_storage_key))
            .await
        else {
            trace!(%key, "nothing persisted yet");
            return false;
        };
        let Some(core) = self.state.upgrade() else {
            return false;
        };

        State::from_core(core).set_with(
            value,
            IngestConfig::default().with_storage(false).with_overwrite(true),
        );
        true
    }

    /// Queue a write of the State's current value.
    pub fn persist_value(&self) -> bool {
        let Some(core) = self.state.upgrade() else {
            return false;
        };
        self.storages
            .set(&self.key(), core.peek(), &self.storage_keys);
        self.is_persisted.store(true, Ordering::Release);
        true
    }

    /// Queue the removal of the stored value.
    pub fn remove_persisted_value(&self) -> bool {
        self.storages.remove(&self.key(), &self.storage_keys);
        self.is_persisted.store(false, Ordering::Release);
        true
    }

    /// Move the stored value to a new persist key.
    pub fn set_key(&self, key: impl Into<String>) {
        let key = key.into();
        let old = std::mem::replace(&mut *self.key.lock(), key.clone());
        if old == key {
            return;
        }

        if self.is_persisted() {
            self.storages.remove(&old, &self.storage_keys);
            self.persist_value();
        }
        debug!(%old, new = %key, "persist key changed");
    }
}

/// Storages a persistent writes to, and the one it loads from.
pub(crate) fn resolve_storage_keys(
    storages: &Storages,
    config: &PersistConfig,
) -> StoreResult<(Vec<String>, String)> {
    let storage_keys = if config.storage_keys.is_empty() {
        vec![storages
            .default_storage_key()
            .ok_or_else(|| StoreError::UnknownStorage("default".to_owned()))?]
    } else {
        config.storage_keys.clone()
    };

    if let Some(missing) = storage_keys
        .iter()
        .find(|key| storages.get_storage(key).is_none())
    {
        return Err(StoreError::UnknownStorage(missing.clone()));
    }

    let default_storage_key = config
        .default_storage_key
        .clone()
        .unwrap_or_else(|| storage_keys[0].clone());
    Ok((storage_keys, default_storage_key))
}
