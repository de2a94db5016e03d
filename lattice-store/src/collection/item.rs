//! Items
//!
//! An [`Item`] is a State holding one collected payload. Its key mirrors the
//! payload's primary-key field; changing that field through the Item renames
//! it in its Collection.

use std::ops::Deref;

use serde_json::Value;

use super::{Collection, WeakCollection};
use crate::config::{IngestConfig, SideEffectConfig};
use crate::error::StoreResult;
use crate::graph::ObserverKind;
use crate::key::Key;
use crate::reactive::Runtime;
use crate::state::State;
use crate::value::with_field;

/// Side effect that keeps Groups in sync with Item changes.
pub const REBUILD_GROUP_SIDE_EFFECT: &str = "rebuildGroup";

const REBUILD_GROUP_WEIGHT: i32 = 100;

/// A single payload in a Collection.
#[derive(Clone, Debug)]
pub struct Item(State);

impl Item {
    pub(crate) fn new(
        collection: &Collection,
        runtime: &Runtime,
        key: Key,
        value: Value,
        is_placeholder: bool,
    ) -> Self {
        let state = State::create(
            runtime,
            ObserverKind::Item,
            Some(key),
            value,
            is_placeholder,
            Some(collection.downgrade()),
        );

        let weak = collection.downgrade();
        state.add_side_effect(
            REBUILD_GROUP_SIDE_EFFECT,
            move |state, config| rebuild_groups(&weak, state, config),
            SideEffectConfig {
                weight: REBUILD_GROUP_WEIGHT,
            },
        );
        Self(state)
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
}

impl Deref for Item {
    type Target = State;

    fn deref(&self) -> &State {
        &self.0
    }
}

fn rebuild_groups(collection: &WeakCollection, state: &State, config: &IngestConfig) {
    let Some(collection) = collection.upgrade() else {
        return;
    };
    let Some(mut key) = state.key() else {
        return;
    };

    let primary = state
        .peek()
        .get(collection.primary_key())
        .and_then(Key::from_value);
    if let Some(primary) = primary.filter(|primary| *primary != key) {
        let ingest = IngestConfig::default().with_background(config.background);
        if collection.update_item_key(&key, primary.clone(), ingest.clone()) {
            key = primary;
        } else {
            // Refused rename: the payload has to name the key the Item kept.
            let restored = with_field(&state.peek(), collection.primary_key(), key.to_value());
            state.set_with(restored, ingest);
            return;
        }
    }

    collection.rebuild_groups_that_include_item_key(&key, config);
}
