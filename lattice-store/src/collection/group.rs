//! Groups
//!
//! A [`Group`] is a State whose value is an ordered list of Item keys. Keys
//! are unique within a Group and keep their insertion order.
//!
//! Reading [`Group::output`] inside a compute function depends on the Group
//! only. Items that change rebuild every Group containing them, which is
//! what re-runs those compute functions.

use std::ops::Deref;

use serde_json::Value;

use super::{Collection, Item};
use crate::config::{AddMethod, GroupAddConfig, IngestConfig};
use crate::error::StoreResult;
use crate::graph::ObserverKind;
use crate::key::{collect_keys, Key};
use crate::reactive::Runtime;
use crate::state::State;

/// An ordered subset of a Collection's Items.
#[derive(Clone, Debug)]
pub struct Group(State);

impl Group {
    pub(crate) fn new(collection: &Collection, runtime: &Runtime, key: Key, keys: Vec<Key>) -> Self {
        let mut unique: Vec<Key> = Vec::with_capacity(keys.len());
        for key in keys {
            if !unique.contains(&key) {
                unique.push(key);
            }
        }

        Self(State::create(
            runtime,
            ObserverKind::Group,
            Some(key),
            keys_to_value(&unique),
            false,
            Some(collection.downgrade()),
        ))
    }

    pub(crate) fn from_state(state: State) -> Self {
        Self(state)
    }

    pub fn state(&self) -> &State {
        &self.0
    }

    pub fn collection(&self) -> StoreResult<Collection> {
        self.core.collection()
    }

    /// Item keys, in order. Not tracked.
    pub fn value_keys(&self) -> Vec<Key> {
        keys_from_value(&self.peek())
    }

    pub fn has(&self, key: &Key) -> bool {
        self.value_keys().contains(key)
    }

    pub fn size(&self) -> usize {
        self.value_keys().len()
    }

    /// Add keys. Keys already present stay where they are unless
    /// `config.overwrite` moves them.
    pub fn add<I, K>(&self, keys: I, config: GroupAddConfig) -> &Self
    where
        I: IntoIterator<Item = K>,
        K: Into<Key>,
    {
        let mut current = self.value_keys();
        for key in collect_keys(keys) {
            if let Some(position) = current.iter().position(|existing| *existing == key) {
                if !config.overwrite {
                    continue;
                }
                current.remove(position);
            }
            match config.method {
                AddMethod::Push => current.push(key),
                AddMethod::Unshift => current.insert(0, key),
            }
        }

        self.set_with(
            keys_to_value(&current),
            IngestConfig::default().with_background(config.background),
        );
        self
    }

    /// Remove keys. Items that end up in no Group at all are deleted from the
    /// Collection.
    pub fn remove<I, K>(&self, keys: I, config: IngestConfig) -> &Self
    where
        I: IntoIterator<Item = K>,
        K: Into<Key>,
    {
        let removed = self.remove_keys(&collect_keys(keys), config.clone());
        if !removed.is_empty() {
            if let Ok(collection) = self.collection() {
                collection.remove_orphans(&removed, config.background);
            }
        }
        self
    }

    /// Remove keys from the value only. Returns the keys that were present.
    pub(crate) fn remove_keys(&self, keys: &[Key], config: IngestConfig) -> Vec<Key> {
        let current = self.value_keys();
        let (removed, kept): (Vec<Key>, Vec<Key>) =
            current.into_iter().partition(|key| keys.contains(key));

        if !removed.is_empty() {
            self.set_with(keys_to_value(&kept), config);
        }
        removed
    }

    /// Put `new` where `old` is.
    pub fn replace(&self, old: &Key, new: Key, config: IngestConfig) -> &Self {
        let current = self.value_keys();
        let Some(position) = current.iter().position(|key| key == old) else {
            return self;
        };

        let replaced: Vec<Key> = current
            .into_iter()
            .enumerate()
            .filter_map(|(index, key)| match index == position {
                true => Some(new.clone()),
                false if key == new => None,
                false => Some(key),
            })
            .collect();

        self.set_with(keys_to_value(&replaced), config);
        self
    }

    /// Collected Items, in Group order. Keys without a collected Item are
    /// skipped.
    pub fn items(&self) -> Vec<Item> {
        let Ok(collection) = self.collection() else {
            return Vec::new();
        };
        self.value_keys()
            .iter()
            .filter_map(|key| collection.get_item(key))
            .filter(|item| !item.is_placeholder())
            .collect()
    }

    /// Values of the collected Items, in Group order.
    ///
    /// Tracked: a compute function reading the output depends on this Group.
    pub fn output(&self) -> Vec<Value> {
        let keys = keys_from_value(&self.value());
        let Ok(collection) = self.collection() else {
            return Vec::new();
        };
        keys.iter()
            .filter_map(|key| collection.get_item_value(key))
            .collect()
    }

    /// Re-apply the current key list so subscribers and dependents see the
    /// latest Item data.
    pub fn rebuild(&self, config: IngestConfig) -> &Self {
        self.set_with(self.peek(), config.with_force(true));
        self
    }
}

impl Deref for Group {
    type Target = State;

    fn deref(&self) -> &State {
        &self.0
    }
}

/// Keys stored in a Group value. Entries that aren't keys are skipped.
pub(crate) fn keys_from_value(value: &Value) -> Vec<Key> {
    value
        .as_array()
        .map(|keys| keys.iter().filter_map(Key::from_value).collect())
        .unwrap_or_default()
}

pub(crate) fn keys_to_value(keys: &[Key]) -> Value {
    Value::Array(keys.iter().map(Key::to_value).collect())
}
