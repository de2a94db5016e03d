//! Selectors
//!
//! A [`Selector`] is a Computed whose value is the value of one Item, picked
//! by key. Selecting a key that has no collected Item yet creates a
//! placeholder Item, so the Selector has something to depend on; the
//! placeholder is replaced in place once the real payload is collected.

use std::ops::Deref;
use std::sync::{Arc, Weak};

use serde_json::Value;
use tracing::trace;

use super::{Collection, Item, WeakCollection};
use crate::computed::Computed;
use crate::config::SelectConfig;
use crate::error::StoreResult;
use crate::graph::ObserverKind;
use crate::key::Key;
use crate::reactive::Runtime;
use crate::state::{State, StateCore};

/// Follows the value of one Item.
#[derive(Clone, Debug)]
pub struct Selector(Computed);

impl Selector {
    pub(crate) fn new(
        collection: &Collection,
        runtime: &Runtime,
        key: Option<Key>,
        item_key: Option<Key>,
    ) -> Self {
        let state = State::create(
            runtime,
            ObserverKind::Selector,
            key,
            Value::Null,
            false,
            Some(collection.downgrade()),
        );
        state.core.set_selected(item_key);

        let core = Arc::downgrade(&state.core);
        let weak = collection.downgrade();
        let compute = Arc::new(move || selected_value(&core, &weak));
        Self(Computed::install(state, runtime, compute, std::iter::empty()))
    }

    pub(crate) fn from_state(state: State) -> Self {
        Self(Computed::from_state(state))
    }

    pub fn computed(&self) -> &Computed {
        &self.0
    }

    pub fn collection(&self) -> StoreResult<Collection> {
        self.core.collection()
    }

    /// Key of the selected Item.
    pub fn item_key(&self) -> Option<Key> {
        self.core.selected()
    }

    /// The selected Item, placeholder or not.
    pub fn item(&self) -> Option<Item> {
        let key = self.item_key()?;
        self.collection().ok()?.get_item(&key)
    }

    pub fn has_selected(&self, key: &Key) -> bool {
        self.item_key().as_ref() == Some(key)
    }

    /// Point the Selector at another Item.
    ///
    /// Selecting the current key again does nothing unless forced. A
    /// placeholder left behind by the old selection is removed when nothing
    /// else refers to it.
    pub fn select(&self, key: impl Into<Key>, config: SelectConfig) -> &Self {
        let key = key.into();
        if self.has_selected(&key) && !config.force {
            trace!(observer = %self.id(), %key, "item already selected");
            return self;
        }

        let old = self.core.set_selected(Some(key.clone()));
        self.recompute(config.ingest());

        if let Some(old) = old.filter(|old| *old != key) {
            self.release(&old);
        }
        self
    }

    /// Change the selected key without recomputing.
    pub(crate) fn retarget(&self, key: Key) {
        self.core.set_selected(Some(key));
    }

    /// Select the current key again, forcing a recompute.
    pub fn reselect(&self, config: SelectConfig) -> &Self {
        if let Some(key) = self.item_key() {
            self.select(key, SelectConfig { force: true, ..config });
        }
        self
    }

    /// Drop the selection. The value becomes `null`.
    pub fn unselect(&self, config: SelectConfig) -> &Self {
        let old = self.core.set_selected(None);
        self.recompute(config.ingest());
        if let Some(old) = old {
            self.release(&old);
        }
        self
    }

    fn release(&self, key: &Key) {
        if let Ok(collection) = self.collection() {
            collection.remove_placeholder_if_unused(key, self.id());
        }
    }
}

impl Deref for Selector {
    type Target = Computed;

    fn deref(&self) -> &Computed {
        &self.0
    }
}

/// Compute function of every Selector.
fn selected_value(core: &Weak<StateCore>, collection: &WeakCollection) -> Value {
    let (Some(core), Some(collection)) = (core.upgrade(), collection.upgrade()) else {
        return Value::Null;
    };
    let Some(key) = core.selected() else {
        return Value::Null;
    };

    let item = collection.get_item_with_reference(&key);
    let value = item.value();
    if item.exists() {
        value
    } else {
        Value::Null
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CollectionConfig;
    use serde_json::json;

    fn collection() -> (Runtime, Collection) {
        let runtime = Runtime::new();
        let collection = Collection::new(&runtime, CollectionConfig::default());
        (runtime, collection)
    }

    #[test]
    fn selecting_a_missing_key_creates_a_placeholder() {
        let (runtime, collection) = collection();
        let selector = collection.create_selector("current", 1);

        let placeholder = collection.get_item(&Key::from(1)).unwrap();
        assert!(placeholder.is_placeholder());
        assert_eq!(selector.peek(), Value::Null);
        assert!(runtime.dependents(placeholder.id()).contains(&selector.id()));
        assert_eq!(collection.size(), 0);
    }

    #[test]
    fn selector_follows_collected_item() {
        let (_runtime, collection) = collection();
        let selector = collection.create_selector("current", 1);

        collection.collect(vec![json!({ "id": 1, "name": "a" })], &[], Default::default());
        assert_eq!(selector.peek(), json!({ "id": 1, "name": "a" }));

        collection.update(&Key::from(1), json!({ "name": "b" }), Default::default());
        assert_eq!(selector.peek()["name"], json!("b"));
    }

    #[test]
    fn selecting_away_removes_unused_placeholder() {
        let (_runtime, collection) = collection();
        let selector = collection.create_selector("current", 1);
        collection.collect(vec![json!({ "id": 2 })], &[], Default::default());

        selector.select(2, SelectConfig::default());
        assert_eq!(selector.item_key(), Some(Key::from(2)));
        assert!(collection.get_item(&Key::from(1)).is_none());
        assert_eq!(selector.peek(), json!({ "id": 2 }));
    }

    #[test]
    fn shared_placeholder_survives_reselection() {
        let (_runtime, collection) = collection();
        let first = collection.create_selector("first", 1);
        let _second = collection.create_selector("second", 1);

        first.select(3, SelectConfig::default());
        assert!(collection.get_item(&Key::from(1)).is_some());
    }

    #[test]
    fn unselect_yields_null() {
        let (_runtime, collection) = collection();
        collection.collect(vec![json!({ "id": 1 })], &[], Default::default());
        let selector = collection.create_selector("current", 1);
        assert_eq!(selector.peek(), json!({ "id": 1 }));

        selector.unselect(SelectConfig::default());
        assert_eq!(selector.item_key(), None);
        assert_eq!(selector.peek(), Value::Null);
        assert!(collection.has(&Key::from(1)));
    }
}
