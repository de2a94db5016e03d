//! Collection persistence
//!
//! A persisted Collection is stored as loose entries rather than one blob:
//!
//! | entry | storage key | value |
//! |---|---|---|
//! | marker | `<key>` | `true` |
//! | default Group | `_<key>_group_<group>` | list of Item keys |
//! | Item | `_<key>_item_<item>` | Item value |
//!
//! Each Item and the default Group get their own [`StatePersistent`], so
//! ordinary Jobs keep their entries current. A side effect on the default
//! Group writes entries for Items that join it and drops entries of Items
//! that leave it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, trace};

use super::group::keys_from_value;
use super::{Collection, Item, WeakCollection};
use crate::config::{CollectConfig, PersistConfig, SideEffectConfig};
use crate::error::StoreResult;
use crate::key::Key;
use crate::state::{resolve_storage_keys, State, StatePersistent};
use crate::storage::Storages;

/// Side effect on the default Group that keeps Item entries in sync.
pub const REBUILD_STORAGE_SIDE_EFFECT: &str = "rebuildStorage";

/// Persistence handle of a Collection.
pub struct CollectionPersistent {
    collection: WeakCollection,
    storages: Storages,
    key: Mutex<String>,
    storage_keys: Vec<String>,
    default_storage_key: String,
    ready: AtomicBool,
    is_persisted: AtomicBool,
}

impl CollectionPersistent {
    pub(crate) fn new(
        collection: &Collection,
        storages: &Storages,
        key: String,
        config: &PersistConfig,
    ) -> StoreResult<Arc<Self>> {
        let (storage_keys, default_storage_key) = resolve_storage_keys(storages, config)?;
        debug!(%key, "collection persistent created");

        Ok(Arc::new(Self {
            collection: collection.downgrade(),
            storages: storages.clone(),
            key: Mutex::new(key),
            storage_keys,
            default_storage_key,
            ready: AtomicBool::new(!config.load_value),
            is_persisted: AtomicBool::new(false),
        }))
    }

    pub fn key(&self) -> String {
        self.key.lock().clone()
    }

    pub fn storage_keys(&self) -> &[String] {
        &self.storage_keys
    }

    /// False while the initial load is in flight.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_persisted(&self) -> bool {
        self.is_persisted.load(Ordering::Acquire)
    }

    pub fn item_storage_key(&self, item: &Key) -> String {
        format!("_{}_item_{}", self.key(), item)
    }

    pub fn group_storage_key(&self, group: &Key) -> String {
        format!("_{}_group_{}", self.key(), group)
    }

    /// Load what was stored, or store the Collection if nothing was.
    pub async fn initial_loading(self: &Arc<Self>) -> bool {
        let loaded = self.load_persisted_value().await;
        self.ready.store(true, Ordering::Release);
        if !loaded {
            self.persist_value();
        }
        loaded
    }

    /// Collect the stored Items, in stored default-Group order.
    ///
    /// Returns false if the Collection was never stored.
    pub async fn load_persisted_value(self: &Arc<Self>) -> bool {
        let Some(collection) = self.collection.upgrade() else {
            return false;
        };
        let default_storage = Some(self.default_storage_key.as_str());

        if self.storages.get(&self.key(), default_storage).await.is_none() {
            trace!(key = %self.key(), "collection not persisted yet");
            return false;
        }
        let group_key = self.group_storage_key(collection.default_group_key());
        let Some(group) = self.storages.get(&group_key, default_storage).await else {
            trace!(key = %group_key, "no stored default group");
            return false;
        };

        let mut values: Vec<Value> = Vec::new();
        for key in keys_from_value(&group) {
            match self
                .storages
                .get(&self.item_storage_key(&key), default_storage)
                .await
            {
                Some(value) => values.push(value),
                None => trace!(item = %key, "stored item is missing"),
            }
        }
        debug!(key = %self.key(), items = values.len(), "collection loaded");

        collection.collect(values, &[], CollectConfig::default());
        self.persist_value();
        true
    }

    /// Store the default Group and every Item, and keep them stored.
    pub fn persist_value(self: &Arc<Self>) -> bool {
        let Some(collection) = self.collection.upgrade() else {
            return false;
        };
        self.storages
            .set(&self.key(), Value::Bool(true), &self.storage_keys);

        let group = collection.get_default_group();
        let group_key = self.group_storage_key(collection.default_group_key());
        match group.persistent() {
            Some(persistent) => {
                persistent.set_key(group_key);
                persistent.persist_value();
            }
            None => {
                if let Some(persistent) = self.attach(group.state(), group_key) {
                    persistent.persist_value();
                }
            }
        }

        for item in collection.get_all_items() {
            self.persist_item(&item);
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        group.add_side_effect(
            REBUILD_STORAGE_SIDE_EFFECT,
            move |group, _| {
                if let Some(persistent) = weak.upgrade() {
                    persistent.sync_items(group);
                }
            },
            SideEffectConfig::default(),
        );

        self.is_persisted.store(true, Ordering::Release);
        true
    }

    /// Drop every stored entry and stop writing new ones.
    pub fn remove_persisted_value(&self) -> bool {
        let Some(collection) = self.collection.upgrade() else {
            return false;
        };
        self.storages.remove(&self.key(), &self.storage_keys);

        let group = collection.get_default_group();
        group.remove_side_effect(REBUILD_STORAGE_SIDE_EFFECT);
        detach(group.state());

        for item in collection.get_all_items() {
            detach(item.state());
        }

        self.is_persisted.store(false, Ordering::Release);
        true
    }

    /// Move every stored entry to a new persist key.
    pub fn set_key(self: &Arc<Self>, key: impl Into<String>) {
        let key = key.into();
        if *self.key.lock() == key {
            return;
        }
        let persisted = self.is_persisted();
        if persisted {
            self.remove_persisted_value();
        }
        *self.key.lock() = key;
        if persisted {
            self.persist_value();
        }
    }

    fn persist_item(&self, item: &Item) {
        let Some(key) = item.key() else {
            return;
        };
        let storage_key = self.item_storage_key(&key);
        match item.persistent() {
            Some(persistent) => {
                persistent.set_key(storage_key);
                persistent.persist_value();
            }
            None => {
                if let Some(persistent) = self.attach(item.state(), storage_key) {
                    persistent.persist_value();
                }
            }
        }
    }

    fn attach(&self, state: &State, key: String) -> Option<Arc<StatePersistent>> {
        let config = PersistConfig {
            key: None,
            load_value: false,
            storage_keys: self.storage_keys.clone(),
            default_storage_key: Some(self.default_storage_key.clone()),
        };
        match StatePersistent::attach(state, &self.storages, key, &config) {
            Ok(persistent) => Some(persistent),
            Err(err) => {
                error!(observer = %state.id(), %err, "can't persist collection entry");
                None
            }
        }
    }

    /// Store Items that joined the default Group, drop those that left.
    fn sync_items(&self, group: &State) {
        if !self.is_ready() {
            return;
        }
        let Some(collection) = self.collection.upgrade() else {
            return;
        };
        let before = keys_from_value(&group.previous_value());
        let after = keys_from_value(&group.peek());

        for key in after.iter().filter(|key| !before.contains(key)) {
            if let Some(item) = collection.get_item(key).filter(|item| !item.is_placeholder()) {
                self.persist_item(&item);
            }
        }
        for key in before.iter().filter(|key| !after.contains(key)) {
            self.storages
                .remove(&self.item_storage_key(key), &self.storage_keys);
        }
    }
}

fn detach(state: &State) {
    let persistent = state.core.data.lock().persistent.take();
    if let Some(persistent) = persistent {
        persistent.remove_persisted_value();
    }
}

impl std::fmt::Debug for CollectionPersistent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionPersistent")
            .field("key", &self.key())
            .field("storage_keys", &self.storage_keys)
            .field("is_persisted", &self.is_persisted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CollectionConfig, RuntimeConfig};
    use crate::reactive::Runtime;
    use serde_json::json;

    fn runtime() -> Runtime {
        Runtime::with_config(RuntimeConfig {
            memory_storage: true,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn persisting_stores_marker_group_and_items() {
        let runtime = runtime();
        let collection = Collection::new(&runtime, CollectionConfig::default().with_key("todos"));
        collection.collect(vec![json!({ "id": 1, "t": "a" })], &[], CollectConfig::default());

        assert!(collection.persist(PersistConfig::default()).await);
        assert!(collection.persistent().is_some_and(|p| p.is_ready()));
        let storages = runtime.storages();
        storages.flush().await;

        assert_eq!(storages.get("todos", None).await, Some(json!(true)));
        assert_eq!(storages.get("_todos_group_default", None).await, Some(json!([1])));
        assert_eq!(
            storages.get("_todos_item_1", None).await,
            Some(json!({ "id": 1, "t": "a" }))
        );
    }

    #[tokio::test]
    async fn group_changes_sync_item_entries() {
        let runtime = runtime();
        let collection = Collection::new(&runtime, CollectionConfig::default().with_key("todos"));
        collection.persist(PersistConfig::default()).await;

        collection.collect(vec![json!({ "id": 1 }), json!({ "id": 2 })], &[], CollectConfig::default());
        collection.remove([1], Default::default());
        let storages = runtime.storages();

        assert_eq!(storages.get("_todos_item_1", None).await, None);
        assert_eq!(storages.get("_todos_item_2", None).await, Some(json!({ "id": 2 })));
        assert_eq!(storages.get("_todos_group_default", None).await, Some(json!([2])));
    }

    #[tokio::test]
    async fn persisted_collection_is_restored() {
        let runtime = runtime();
        {
            let collection = Collection::new(&runtime, CollectionConfig::default().with_key("todos"));
            collection.persist(PersistConfig::default()).await;
            collection.collect(vec![json!({ "id": 2 }), json!({ "id": 1 })], &[], CollectConfig::default());
            runtime.storages().flush().await;
        }

        let restored = Collection::new(&runtime, CollectionConfig::default().with_key("todos"));
        assert!(restored.persist(PersistConfig::default()).await);

        assert_eq!(restored.get_default_group().peek(), json!([2, 1]));
        assert_eq!(restored.get_item_value(&Key::from(1)), Some(json!({ "id": 1 })));
        assert!(restored.is_persisted());
    }

    #[tokio::test]
    async fn persist_without_key_fails() {
        let runtime = runtime();
        let collection = Collection::new(&runtime, CollectionConfig::default());
        assert!(!collection.persist(PersistConfig::default()).await);
        assert!(collection.persistent().is_none());
    }
}
