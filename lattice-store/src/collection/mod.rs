//! Collections
//!
//! A [`Collection`] is a keyed set of [`Item`]s with ordered [`Group`]s over
//! them and [`Selector`]s following single Items.
//!
//! # Ownership
//!
//! The Collection owns its Items, Groups and Selectors. Each of those only
//! holds a [`WeakCollection`] back, so dropping the last Collection handle
//! tears the whole structure down and unregisters its Observers.
//!
//! # Locks
//!
//! The maps are never locked while an Item, Group or Selector is mutated.
//! Mutations can run compute functions and side effects that call back into
//! the Collection.

mod group;
mod item;
mod persistent;
mod selector;

pub use self::group::Group;
pub use self::item::{Item, REBUILD_GROUP_SIDE_EFFECT};
pub use self::persistent::{CollectionPersistent, REBUILD_STORAGE_SIDE_EFFECT};
pub use self::selector::Selector;

use std::fmt;
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, error, trace, warn};

use crate::config::{
    CollectConfig, CollectionConfig, GroupAddConfig, IngestConfig, PatchConfig, PersistConfig,
    RemoveConfig, SelectConfig, UpdateConfig,
};
use crate::error::{StoreError, StoreResult};
use crate::graph::ObserverId;
use crate::key::{collect_keys, Key};
use crate::reactive::Runtime;
use crate::value::with_field;

struct CollectionInner {
    runtime: Runtime,
    key: RwLock<Option<Key>>,
    primary_key: String,
    default_group_key: Key,
    data: RwLock<IndexMap<Key, Item>>,
    groups: RwLock<IndexMap<Key, Group>>,
    selectors: RwLock<IndexMap<Key, Selector>>,
    persistent: Mutex<Option<Arc<CollectionPersistent>>>,
}

/// Handle to a Collection. Cloning is cheap.
#[derive(Clone)]
pub struct Collection {
    inner: Arc<CollectionInner>,
}

/// Non-owning handle to a [`Collection`].
#[derive(Clone, Default)]
pub struct WeakCollection {
    inner: Weak<CollectionInner>,
}

impl WeakCollection {
    pub fn upgrade(&self) -> Option<Collection> {
        self.inner.upgrade().map(|inner| Collection { inner })
    }
}

impl fmt::Debug for WeakCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakCollection")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl Collection {
    /// Create a Collection with its default Group and the configured Groups
    /// and Selectors.
    pub fn new(runtime: &Runtime, config: CollectionConfig) -> Self {
        let collection = Self {
            inner: Arc::new(CollectionInner {
                runtime: runtime.clone(),
                key: RwLock::new(config.key),
                primary_key: config.primary_key,
                default_group_key: config.default_group_key.clone(),
                data: RwLock::new(IndexMap::new()),
                groups: RwLock::new(IndexMap::new()),
                selectors: RwLock::new(IndexMap::new()),
                persistent: Mutex::new(None),
            }),
        };

        collection.create_group(config.default_group_key, Vec::<Key>::new());
        for key in config.groups {
            collection.create_group(key, Vec::<Key>::new());
        }
        for key in config.selectors {
            collection.create_selector(key.clone(), key);
        }
        collection
    }

    pub fn downgrade(&self) -> WeakCollection {
        WeakCollection {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Check if two handles point at the same Collection.
    pub fn ptr_eq(&self, other: &Collection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    pub fn key(&self) -> Option<Key> {
        self.inner.key.read().clone()
    }

    pub fn set_key(&self, key: Option<Key>) -> &Self {
        *self.inner.key.write() = key;
        self
    }

    /// Payload field holding the Item key.
    pub fn primary_key(&self) -> &str {
        &self.inner.primary_key
    }

    pub fn default_group_key(&self) -> &Key {
        &self.inner.default_group_key
    }

    // ------------------------------------------------------------------
    // Data
    // ------------------------------------------------------------------

    /// Add or update Items from payloads and add their keys to the default
    /// Group and to `groups`.
    ///
    /// Payloads that aren't objects or lack a primary key are logged and
    /// skipped. Subscribers are notified once, after every payload is in.
    pub fn collect<I>(&self, data: I, groups: &[Key], config: CollectConfig) -> &Self
    where
        I: IntoIterator<Item = Value>,
    {
        let mut group_keys = vec![self.inner.default_group_key.clone()];
        for key in groups {
            if !group_keys.contains(key) {
                group_keys.push(key.clone());
            }
        }

        self.inner.runtime.batch(|| {
            let mut collected = Vec::new();
            for payload in data {
                match self.set_data(payload, &config) {
                    Ok(key) => collected.push(key),
                    Err(err) => error!(%err, "payload not collected"),
                }
            }
            if collected.is_empty() {
                return;
            }

            for group_key in &group_keys {
                self.get_group_with_reference(group_key).add(
                    collected.iter().cloned(),
                    GroupAddConfig {
                        method: config.method,
                        overwrite: false,
                        background: config.background,
                    },
                );
            }

            if config.select {
                for key in &collected {
                    if !self.has_selector(key) {
                        self.create_selector(key.clone(), key.clone());
                    }
                }
            }
            debug!(items = collected.len(), "collected");
        });
        self
    }

    /// Apply one payload to its Item, creating the Item if needed.
    fn set_data(&self, payload: Value, config: &CollectConfig) -> StoreResult<Key> {
        if !payload.is_object() {
            return Err(StoreError::NotAnObject {
                target: "collected payload",
            });
        }
        let key = payload
            .get(&self.inner.primary_key)
            .and_then(Key::from_value)
            .ok_or_else(|| StoreError::MissingPrimaryKey(self.inner.primary_key.clone()))?;

        let ingest = IngestConfig::default().with_background(config.background);
        match self.get_item(&key) {
            Some(item) if item.is_placeholder() => {
                item.set_with(payload, ingest.with_overwrite(true));
            }
            Some(item) if config.patch => {
                item.patch_with(payload, PatchConfig::default().with_ingest(ingest));
            }
            Some(item) => {
                item.set_with(payload, ingest);
            }
            None => {
                let item = Item::new(self, &self.inner.runtime, key.clone(), payload, false);
                self.inner.data.write().insert(key.clone(), item);
            }
        }
        Ok(key)
    }

    /// Update the Item at `key` with `changes`.
    ///
    /// A primary key in `changes` that differs from `key` renames the Item
    /// first. Returns the updated Item, or `None` if there is no collected
    /// Item at `key`.
    pub fn update(&self, key: &Key, changes: Value, config: UpdateConfig) -> Option<Item> {
        let Some(item) = self.get_item(key).filter(|item| !item.is_placeholder()) else {
            error!(%key, "can't update an item that doesn't exist");
            return None;
        };
        let Value::Object(mut changes) = changes else {
            let err = StoreError::NotAnObject { target: "changes" };
            error!(%key, %err, "update rejected");
            return None;
        };

        let primary_key = &self.inner.primary_key;
        let ingest = IngestConfig::default().with_background(config.background);
        let new_key = changes
            .get(primary_key)
            .and_then(Key::from_value)
            .unwrap_or_else(|| key.clone());
        if new_key != *key && !self.update_item_key(key, new_key.clone(), ingest.clone()) {
            warn!(%key, new = %new_key, "update dropped, item keeps its key");
            return None;
        }

        if config.patch {
            changes.remove(primary_key);
            item.patch_with(
                Value::Object(changes),
                PatchConfig {
                    add_new_properties: config.add_new_properties,
                    ingest,
                },
            );
        } else {
            changes.insert(primary_key.clone(), new_key.to_value());
            item.set_with(Value::Object(changes), ingest);
        }
        Some(item)
    }

    /// Move the Item at `old` to `new`.
    ///
    /// The primary-key field, Group memberships, Selectors and the persisted
    /// entry all follow, and subscribers see a single update. A placeholder
    /// at `new` is replaced; a collected Item at `new` blocks the move.
    pub fn update_item_key(&self, old: &Key, new: Key, config: IngestConfig) -> bool {
        if *old == new {
            return false;
        }
        let Some(item) = self.get_item(old) else {
            warn!(%old, "can't rename an item that doesn't exist");
            return false;
        };
        if self.get_item(&new).is_some_and(|existing| !existing.is_placeholder()) {
            let err = StoreError::DuplicateItemKey(new);
            error!(%err, "item not renamed");
            return false;
        }

        let runtime = &self.inner.runtime;
        runtime.batch(|| {
            let deferred = IngestConfig::default()
                .with_background(config.background)
                .with_perform(false);

            let replaced = {
                let mut data = self.inner.data.write();
                data.shift_remove(old);
                data.insert(new.clone(), item.clone())
            };
            if let Some(placeholder) = replaced {
                placeholder.dispose();
            }

            item.set_key(Some(new.clone()));
            if let (Some(state_persistent), Some(persistent)) = (item.persistent(), self.persistent()) {
                state_persistent.set_key(persistent.item_storage_key(&new));
            }

            let next = item.next_value();
            let stored_key = next.get(&self.inner.primary_key).and_then(Key::from_value);
            if stored_key.as_ref() != Some(&new) {
                item.set_with(
                    with_field(&next, &self.inner.primary_key, new.to_value()),
                    deferred.clone(),
                );
            }

            for group in self.groups_snapshot() {
                if group.has(old) {
                    group.replace(old, new.clone(), deferred.clone());
                }
            }
            let selectors = self.selectors_snapshot();
            for selector in &selectors {
                if selector.has_selected(old) {
                    selector.retarget(new.clone());
                }
            }
            runtime.drain();

            let select = SelectConfig {
                background: config.background,
                ..Default::default()
            };
            for selector in &selectors {
                if selector.has_selected(&new) {
                    selector.reselect(select);
                }
            }
        });

        debug!(%old, %new, "item key changed");
        true
    }

    /// Remove Items.
    ///
    /// With `from_groups`, the keys are only removed from those Groups, and
    /// Items left in no Group are deleted. Otherwise the Items are deleted
    /// outright.
    pub fn remove<I, K>(&self, keys: I, config: RemoveConfig) -> &Self
    where
        I: IntoIterator<Item = K>,
        K: Into<Key>,
    {
        let keys = collect_keys(keys);
        let ingest = IngestConfig::default().with_background(config.background);
        match config.from_groups {
            Some(groups) => {
                for group_key in groups {
                    match self.get_group(&group_key) {
                        Some(group) => {
                            group.remove(keys.iter(), ingest.clone());
                        }
                        None => warn!(group = %group_key, "group doesn't exist"),
                    }
                }
            }
            None => self.remove_items(&keys, config.background),
        }
        self
    }

    /// Delete Items from the Collection and every Group.
    pub fn remove_items(&self, keys: &[Key], background: bool) {
        let ingest = IngestConfig::default().with_background(background);
        self.inner.runtime.batch(|| {
            for group in self.groups_snapshot() {
                group.remove_keys(keys, ingest.clone());
            }
            for key in keys {
                self.delete_item(key, background);
            }
        });
    }

    /// Delete Items no Group refers to anymore.
    pub(crate) fn remove_orphans(&self, keys: &[Key], background: bool) {
        let groups = self.groups_snapshot();
        for key in keys {
            let collected = self.get_item(key).is_some_and(|item| !item.is_placeholder());
            if collected && !groups.iter().any(|group| group.has(key)) {
                self.delete_item(key, background);
            }
        }
    }

    fn delete_item(&self, key: &Key, background: bool) {
        let removed = self.inner.data.write().shift_remove(key);
        let Some(item) = removed else {
            return;
        };

        if let Some(persistent) = item.persistent() {
            persistent.remove_persisted_value();
        }
        item.dispose();
        drop(item);
        trace!(%key, "item removed");

        let select = SelectConfig {
            background,
            ..Default::default()
        };
        for selector in self.selectors_snapshot() {
            if selector.has_selected(key) {
                selector.reselect(select);
            }
        }
    }

    /// Remove the placeholder at `key` if no Group, no other Selector and
    /// no other Observer than `selector` refers to it.
    pub(crate) fn remove_placeholder_if_unused(&self, key: &Key, selector: ObserverId) {
        let Some(item) = self.get_item(key) else {
            return;
        };
        if !item.is_placeholder() {
            return;
        }
        if self.groups_snapshot().iter().any(|group| group.has(key)) {
            return;
        }
        if self
            .selectors_snapshot()
            .iter()
            .any(|other| other.id() != selector && other.has_selected(key))
        {
            return;
        }
        if self
            .inner
            .runtime
            .dependents(item.id())
            .iter()
            .any(|dependent| *dependent != selector)
        {
            return;
        }

        self.inner.data.write().shift_remove(key);
        item.dispose();
        trace!(%key, "placeholder removed");
    }

    /// Force-rebuild every Group containing `key`.
    pub fn rebuild_groups_that_include_item_key(&self, key: &Key, config: &IngestConfig) {
        let ingest = IngestConfig::default()
            .with_background(config.background)
            .with_side_effects(config.side_effects.enabled);
        for group in self.groups_snapshot() {
            if group.has(key) {
                group.rebuild(ingest.clone());
            }
        }
    }

    /// Remove every Item and reset Groups and Selectors.
    pub fn reset(&self) -> &Self {
        self.inner.runtime.batch(|| {
            let items: Vec<Item> = self
                .inner
                .data
                .write()
                .drain(..)
                .map(|(_, item)| item)
                .collect();
            for item in &items {
                item.dispose();
            }
            drop(items);

            for group in self.groups_snapshot() {
                group.reset();
            }
            for selector in self.selectors_snapshot() {
                selector.reselect(SelectConfig::default());
            }
        });
        self
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    /// The Item at `key`, placeholders included.
    pub fn get_item(&self, key: &Key) -> Option<Item> {
        self.inner.data.read().get(key).cloned()
    }

    /// The Item at `key`, creating a placeholder if there is none.
    pub fn get_item_with_reference(&self, key: &Key) -> Item {
        match self.get_item(key) {
            Some(item) => item,
            None => self.create_placeholder_item(key.clone()),
        }
    }

    /// Value of the collected Item at `key`. Not tracked.
    pub fn get_item_value(&self, key: &Key) -> Option<Value> {
        self.get_item(key)
            .filter(|item| item.exists())
            .map(|item| item.peek())
    }

    /// Collected Items, placeholders excluded.
    pub fn get_all_items(&self) -> Vec<Item> {
        self.inner
            .data
            .read()
            .values()
            .filter(|item| !item.is_placeholder())
            .cloned()
            .collect()
    }

    pub fn get_all_item_values(&self) -> Vec<Value> {
        self.get_all_items()
            .iter()
            .filter(|item| item.exists())
            .map(|item| item.peek())
            .collect()
    }

    /// Placeholder Item at `key`, holding just the primary key. Returns the
    /// existing Item if there is one.
    pub fn create_placeholder_item(&self, key: Key) -> Item {
        if let Some(item) = self.get_item(&key) {
            return item;
        }

        let mut value = serde_json::Map::new();
        value.insert(self.inner.primary_key.clone(), key.to_value());
        let placeholder = Item::new(
            self,
            &self.inner.runtime,
            key.clone(),
            Value::Object(value),
            true,
        );
        trace!(%key, "placeholder created");
        self.inner
            .data
            .write()
            .entry(key)
            .or_insert(placeholder)
            .clone()
    }

    /// Whether a collected Item exists at `key`.
    pub fn has(&self, key: &Key) -> bool {
        self.get_item(key).is_some_and(|item| !item.is_placeholder())
    }

    /// Number of collected Items.
    pub fn size(&self) -> usize {
        self.inner
            .data
            .read()
            .values()
            .filter(|item| !item.is_placeholder())
            .count()
    }

    // ------------------------------------------------------------------
    // Groups
    // ------------------------------------------------------------------

    /// Create a Group. An existing Group at `key` is returned as is.
    pub fn create_group<I, K>(&self, key: impl Into<Key>, initial: I) -> Group
    where
        I: IntoIterator<Item = K>,
        K: Into<Key>,
    {
        let key = key.into();
        if let Some(group) = self.get_group(&key) {
            warn!(group = %key, "group already exists");
            return group;
        }

        let group = Group::new(self, &self.inner.runtime, key.clone(), collect_keys(initial));
        self.inner.groups.write().insert(key, group.clone());
        group
    }

    pub fn get_group(&self, key: &Key) -> Option<Group> {
        self.inner.groups.read().get(key).cloned()
    }

    pub fn get_default_group(&self) -> Group {
        self.get_group_with_reference(&self.inner.default_group_key)
    }

    /// The Group at `key`, created empty if missing.
    pub fn get_group_with_reference(&self, key: &Key) -> Group {
        match self.get_group(key) {
            Some(group) => group,
            None => self.create_group(key.clone(), Vec::<Key>::new()),
        }
    }

    pub fn has_group(&self, key: &Key) -> bool {
        self.inner.groups.read().contains_key(key)
    }

    /// Remove a Group. The default Group can't be removed.
    pub fn remove_group(&self, key: &Key) -> bool {
        if *key == self.inner.default_group_key {
            warn!(group = %key, "the default group can't be removed");
            return false;
        }
        let removed = self.inner.groups.write().shift_remove(key);
        match removed {
            Some(group) => {
                group.dispose();
                true
            }
            None => false,
        }
    }

    pub fn groups(&self) -> Vec<Group> {
        self.groups_snapshot()
    }

    fn groups_snapshot(&self) -> Vec<Group> {
        self.inner.groups.read().values().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Selectors
    // ------------------------------------------------------------------

    /// Create a Selector at `key` selecting `item_key`. An existing
    /// Selector at `key` is returned as is.
    pub fn create_selector(&self, key: impl Into<Key>, item_key: impl Into<Key>) -> Selector {
        let key = key.into();
        if let Some(selector) = self.get_selector(&key) {
            warn!(selector = %key, "selector already exists");
            return selector;
        }

        let selector = Selector::new(
            self,
            &self.inner.runtime,
            Some(key.clone()),
            Some(item_key.into()),
        );
        self.inner.selectors.write().insert(key, selector.clone());
        selector
    }

    /// Selector named after `item_key`, created if missing.
    pub fn select(&self, item_key: impl Into<Key>) -> Selector {
        let key = item_key.into();
        match self.get_selector(&key) {
            Some(selector) => selector,
            None => self.create_selector(key.clone(), key),
        }
    }

    pub fn get_selector(&self, key: &Key) -> Option<Selector> {
        self.inner.selectors.read().get(key).cloned()
    }

    pub fn has_selector(&self, key: &Key) -> bool {
        self.inner.selectors.read().contains_key(key)
    }

    /// Remove a Selector, releasing the placeholder it may hold on to.
    pub fn remove_selector(&self, key: &Key) -> bool {
        let removed = self.inner.selectors.write().shift_remove(key);
        let Some(selector) = removed else {
            return false;
        };
        selector.unselect(SelectConfig {
            background: true,
            ..Default::default()
        });
        selector.dispose();
        true
    }

    pub fn selectors(&self) -> Vec<Selector> {
        self.selectors_snapshot()
    }

    fn selectors_snapshot(&self) -> Vec<Selector> {
        self.inner.selectors.read().values().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Persist the Collection: its default Group and every Item.
    ///
    /// The persist key is `config.key` or the Collection key. Returns false
    /// if neither is set, if a storage is missing or if the Collection is
    /// already persisted.
    pub async fn persist(&self, config: PersistConfig) -> bool {
        if self.inner.persistent.lock().is_some() {
            warn!(collection = ?self.key(), "collection is already persisted");
            return false;
        }
        let Some(key) = config
            .key
            .clone()
            .or_else(|| self.key().map(|key| key.to_string()))
        else {
            error!(err = %StoreError::InvalidPersistKey, "can't persist collection");
            return false;
        };

        let persistent = match CollectionPersistent::new(
            self,
            self.inner.runtime.storages(),
            key,
            &config,
        ) {
            Ok(persistent) => persistent,
            Err(err) => {
                error!(%err, "can't persist collection");
                return false;
            }
        };
        *self.inner.persistent.lock() = Some(Arc::clone(&persistent));

        if config.load_value {
            persistent.initial_loading().await;
        } else {
            persistent.persist_value();
        }
        true
    }

    pub fn persistent(&self) -> Option<Arc<CollectionPersistent>> {
        self.inner.persistent.lock().clone()
    }

    pub fn is_persisted(&self) -> bool {
        self.persistent()
            .is_some_and(|persistent| persistent.is_persisted())
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("key", &self.key())
            .field("items", &self.inner.data.read().len())
            .field("groups", &self.inner.groups.read().len())
            .field("selectors", &self.inner.selectors.read().len())
            .finish()
    }
}
