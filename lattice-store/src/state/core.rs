//! State core
//!
//! [`StateCore`] is the record behind every State-like instance. State,
//! Computed, Group, Selector and Item all wrap an `Arc<StateCore>`; what
//! differs between them is the [`ObserverKind`] tag and which optional parts
//! (compute function, Collection link, selected key) are filled in.
//!
//! The core registers its Observer with the runtime on creation and
//! unregisters it when dropped.

use std::fmt;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::trace;

use super::persistent::StatePersistent;
use super::State;
use crate::collection::{Collection, WeakCollection};
use crate::config::IngestConfig;
use crate::error::{StoreError, StoreResult};
use crate::graph::{ObserverId, ObserverKind};
use crate::key::Key;
use crate::reactive::{Runtime, WeakRuntime};
use crate::value::ValueType;

pub(crate) type SideEffectFn = Arc<dyn Fn(&State, &IngestConfig) + Send + Sync>;
pub(crate) type WatcherFn = Arc<dyn Fn(&Value, &str) + Send + Sync>;
pub(crate) type ComputeFn = Arc<dyn Fn() -> Value + Send + Sync>;
pub(crate) type ValueTransform = Arc<dyn Fn(Value) -> Value + Send + Sync>;
pub(crate) type ExistsFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
pub(crate) type LoadFn = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Clone)]
pub(crate) struct SideEffect {
    pub(crate) weight: i32,
    pub(crate) callback: SideEffectFn,
}

/// Mutable part of a State.
pub(crate) struct StateData {
    pub(crate) key: Option<Key>,
    pub(crate) value: Value,
    /// Value immediately before the last applied Job.
    pub(crate) previous: Value,
    /// Value of the Job in flight, or the current value.
    pub(crate) next: Value,
    pub(crate) initial: Value,
    pub(crate) is_placeholder: bool,
    pub(crate) value_type: Option<ValueType>,
    pub(crate) side_effects: IndexMap<String, SideEffect>,
    pub(crate) watchers: IndexMap<String, WatcherFn>,
    pub(crate) persistent: Option<Arc<StatePersistent>>,
    pub(crate) on_load: Option<LoadFn>,
    pub(crate) exists_fn: Option<ExistsFn>,
    pub(crate) compute_value: Option<ValueTransform>,
    pub(crate) interval: Option<JoinHandle<()>>,
}

impl StateData {
    fn new(key: Option<Key>, initial: Value, is_placeholder: bool) -> Self {
        Self {
            key,
            previous: initial.clone(),
            next: initial.clone(),
            value: initial.clone(),
            initial,
            is_placeholder,
            value_type: None,
            side_effects: IndexMap::new(),
            watchers: IndexMap::new(),
            persistent: None,
            on_load: None,
            exists_fn: None,
            compute_value: None,
            interval: None,
        }
    }
}

/// Compute function of a Computed or Selector.
struct Derivation {
    compute: ComputeFn,
    hard_deps: IndexSet<ObserverId>,
    tracked_deps: IndexSet<ObserverId>,
}

pub(crate) struct StateCore {
    id: ObserverId,
    kind: ObserverKind,
    runtime: WeakRuntime,
    pub(crate) data: Mutex<StateData>,
    derivation: Mutex<Option<Derivation>>,
    collection: Option<WeakCollection>,
    /// Item key a Selector points at.
    selected: Mutex<Option<Key>>,
}

impl StateCore {
    pub(crate) fn new(
        runtime: &Runtime,
        kind: ObserverKind,
        key: Option<Key>,
        initial: Value,
        is_placeholder: bool,
        collection: Option<WeakCollection>,
    ) -> Arc<Self> {
        let core = Arc::new(Self {
            id: ObserverId::new(),
            kind,
            runtime: runtime.downgrade(),
            data: Mutex::new(StateData::new(key.clone(), initial, is_placeholder)),
            derivation: Mutex::new(None),
            collection,
            selected: Mutex::new(None),
        });
        runtime.register(&core, key);
        trace!(observer = %core.id, ?kind, "observer created");
        core
    }

    pub(crate) fn id(&self) -> ObserverId {
        self.id
    }

    pub(crate) fn kind(&self) -> ObserverKind {
        self.kind
    }

    pub(crate) fn runtime(&self) -> StoreResult<Runtime> {
        self.runtime.upgrade().ok_or(StoreError::MissingRuntime)
    }

    pub(crate) fn collection(&self) -> StoreResult<Collection> {
        self.collection
            .as_ref()
            .and_then(WeakCollection::upgrade)
            .ok_or(StoreError::MissingCollection)
    }

    pub(crate) fn peek(&self) -> Value {
        self.data.lock().value.clone()
    }

    pub(crate) fn key(&self) -> Option<Key> {
        self.data.lock().key.clone()
    }

    /// Apply a value to the snapshots.
    ///
    /// Returns the replaced value, or `None` if the Job is skipped because
    /// the value didn't change.
    pub(crate) fn apply(&self, value: Value, config: &IngestConfig) -> Option<Value> {
        let mut data = self.data.lock();
        let replaces_placeholder = data.is_placeholder && config.overwrite;
        if !config.force && !replaces_placeholder && data.value == value {
            data.next = data.value.clone();
            return None;
        }

        let previous = std::mem::replace(&mut data.value, value.clone());
        data.previous = previous.clone();
        data.next = value.clone();
        data.is_placeholder = false;
        if config.overwrite {
            data.initial = value.clone();
            data.previous = value;
        }

        Some(previous)
    }

    /// Write the current value to storage if the State is persisted.
    pub(crate) fn persist_current(&self) {
        let persistent = self.data.lock().persistent.clone();
        if let Some(persistent) = persistent {
            if persistent.is_ready() {
                persistent.persist_value();
            }
        }
    }

    pub(crate) fn persistent(&self) -> Option<Arc<StatePersistent>> {
        self.data.lock().persistent.clone()
    }

    // ------------------------------------------------------------------
    // Derivation
    // ------------------------------------------------------------------

    pub(crate) fn install_derivation(&self, compute: ComputeFn, hard_deps: IndexSet<ObserverId>) {
        *self.derivation.lock() = Some(Derivation {
            compute,
            hard_deps,
            tracked_deps: IndexSet::new(),
        });
    }

    pub(crate) fn derivation_parts(&self) -> Option<(ComputeFn, IndexSet<ObserverId>)> {
        self.derivation
            .lock()
            .as_ref()
            .map(|derivation| (Arc::clone(&derivation.compute), derivation.hard_deps.clone()))
    }

    pub(crate) fn set_tracked_deps(&self, tracked: IndexSet<ObserverId>) {
        if let Some(derivation) = self.derivation.lock().as_mut() {
            derivation.tracked_deps = tracked;
        }
    }

    pub(crate) fn hard_deps(&self) -> IndexSet<ObserverId> {
        self.derivation
            .lock()
            .as_ref()
            .map(|derivation| derivation.hard_deps.clone())
            .unwrap_or_default()
    }

    pub(crate) fn tracked_deps(&self) -> IndexSet<ObserverId> {
        self.derivation
            .lock()
            .as_ref()
            .map(|derivation| derivation.tracked_deps.clone())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Selection
    // ------------------------------------------------------------------

    pub(crate) fn selected(&self) -> Option<Key> {
        self.selected.lock().clone()
    }

    pub(crate) fn set_selected(&self, key: Option<Key>) -> Option<Key> {
        std::mem::replace(&mut *self.selected.lock(), key)
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    fn stop_interval(&self) {
        if let Some(handle) = self.data.lock().interval.take() {
            handle.abort();
        }
    }

    /// Remove the Observer from the graph. Its edges go with it.
    pub(crate) fn dispose(&self) {
        self.stop_interval();
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.unregister(self.id);
        }
    }
}

impl Drop for StateCore {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for StateCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.data.lock();
        f.debug_struct("StateCore")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("key", &data.key)
            .field("value", &data.value)
            .field("is_placeholder", &data.is_placeholder)
            .finish()
    }
}
