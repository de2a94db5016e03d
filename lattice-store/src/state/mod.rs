//! State
//!
//! A [`State`] is a single reactive value. Reading it with [`State::value`]
//! inside a compute function makes the Computed depend on it; setting it
//! queues a Job on the runtime it was created on.
//!
//! # Errors
//!
//! The chaining methods (`set`, `patch`, `invert`, ...) never fail loudly:
//! a rejected value is logged and the State keeps its previous value. The
//! `try_*` variants return the error instead.
//!
//! ```rust,ignore
//! let runtime = Runtime::new();
//! let count = State::new(&runtime, 1);
//!
//! count.watch("log", |value, _| println!("count is {value}"));
//! count.set(2).update(|v| json!(v.as_i64().unwrap_or(0) * 10));
//! assert_eq!(count.peek(), json!(20));
//! ```

mod core;
mod persistent;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, trace, warn};

pub(crate) use self::core::StateCore;
pub(crate) use self::persistent::resolve_storage_keys;
pub use self::persistent::StatePersistent;

use self::core::SideEffect;
use crate::collection::WeakCollection;
use crate::config::{IngestConfig, PatchConfig, PersistConfig, SideEffectConfig, StateConfig};
use crate::error::{StoreError, StoreResult};
use crate::graph::{ObserverId, ObserverKind};
use crate::key::Key;
use crate::reactive::{Job, Runtime};
use crate::value::{flat_merge, type_name, ValueType};

/// Key of the watcher registered by [`State::on_inaugurated`].
pub const INAUGURATED_WATCHER_KEY: &str = "InauguratedWatcherKey";

/// A reactive value.
#[derive(Clone)]
pub struct State {
    pub(crate) core: Arc<StateCore>,
}

impl State {
    /// Create a State holding `initial`.
    pub fn new(runtime: &Runtime, initial: impl Into<Value>) -> Self {
        Self::with_config(runtime, initial, StateConfig::default())
    }

    pub fn with_config(runtime: &Runtime, initial: impl Into<Value>, config: StateConfig) -> Self {
        let state = Self::create(
            runtime,
            ObserverKind::State,
            config.key,
            initial.into(),
            config.is_placeholder,
            None,
        );
        for dependent in config.dependents {
            runtime.add_edge(state.id(), dependent);
        }
        state
    }

    pub(crate) fn create(
        runtime: &Runtime,
        kind: ObserverKind,
        key: Option<Key>,
        initial: Value,
        is_placeholder: bool,
        collection: Option<WeakCollection>,
    ) -> Self {
        Self {
            core: StateCore::new(runtime, kind, key, initial, is_placeholder, collection),
        }
    }

    pub(crate) fn from_core(core: Arc<StateCore>) -> Self {
        Self { core }
    }

    /// Id of the State's Observer.
    pub fn id(&self) -> ObserverId {
        self.core.id()
    }

    pub fn kind(&self) -> ObserverKind {
        self.core.kind()
    }

    pub fn runtime(&self) -> StoreResult<Runtime> {
        self.core.runtime()
    }

    /// Check if two handles point at the same State.
    pub fn ptr_eq(&self, other: &State) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    pub fn key(&self) -> Option<Key> {
        self.core.key()
    }

    /// Change the key.
    ///
    /// The Observer key follows, and so does the persist key if it was
    /// derived from the old State key.
    pub fn set_key(&self, key: Option<Key>) -> &Self {
        let (old, persistent) = {
            let mut data = self.core.data.lock();
            let old = std::mem::replace(&mut data.key, key.clone());
            (old, data.persistent.clone())
        };

        if let Ok(runtime) = self.runtime() {
            runtime.set_observer_key(self.id(), key.clone());
        }
        if let (Some(persistent), Some(old), Some(new)) = (persistent, old, key) {
            if persistent.key() == old.to_string() {
                persistent.set_key(new.to_string());
            }
        }
        self
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Current value. Recorded as a dependency inside a compute function.
    pub fn value(&self) -> Value {
        if let Ok(runtime) = self.runtime() {
            runtime.tracker().record(self.id());
        }
        self.core.peek()
    }

    /// Current value, without recording a dependency.
    pub fn peek(&self) -> Value {
        self.core.peek()
    }

    /// Current value deserialized into `T`. Recorded like [`State::value`].
    pub fn value_as<T: DeserializeOwned>(&self) -> Option<T> {
        match serde_json::from_value(self.value()) {
            Ok(value) => Some(value),
            Err(err) => {
                debug!(observer = %self.id(), %err, "value doesn't deserialize");
                None
            }
        }
    }

    /// Value immediately before the last applied Job.
    pub fn previous_value(&self) -> Value {
        self.core.data.lock().previous.clone()
    }

    /// Value of the Job in flight, or the current value.
    pub fn next_value(&self) -> Value {
        self.core.data.lock().next.clone()
    }

    pub fn initial_value(&self) -> Value {
        self.core.data.lock().initial.clone()
    }

    /// Whether the value differs from the initial value.
    pub fn is_set(&self) -> bool {
        let data = self.core.data.lock();
        data.value != data.initial
    }

    pub fn is_placeholder(&self) -> bool {
        self.core.data.lock().is_placeholder
    }

    /// Whether the State holds a real value.
    ///
    /// Placeholders never exist. Otherwise the `compute_exists` function
    /// decides, by default "is not null".
    pub fn exists(&self) -> bool {
        let (is_placeholder, value, exists_fn) = {
            let data = self.core.data.lock();
            (data.is_placeholder, data.value.clone(), data.exists_fn.clone())
        };
        if is_placeholder {
            return false;
        }
        match exists_fn {
            Some(exists) => exists(&value),
            None => !value.is_null(),
        }
    }

    pub fn is(&self, value: &Value) -> bool {
        self.core.data.lock().value == *value
    }

    pub fn is_not(&self, value: &Value) -> bool {
        !self.is(value)
    }

    /// Deep copy of the current value.
    pub fn copy(&self) -> Value {
        self.core.peek()
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    pub fn set(&self, value: impl Into<Value>) -> &Self {
        self.set_with(value, IngestConfig::default())
    }

    pub fn set_with(&self, value: impl Into<Value>, config: IngestConfig) -> &Self {
        if let Err(err) = self.try_set(value, config) {
            error!(observer = %self.id(), %err, "value rejected");
        }
        self
    }

    /// Validate `value` and ingest it.
    ///
    /// A value that doesn't match the declared type is rejected, unless the
    /// config forces it through.
    pub fn try_set(&self, value: impl Into<Value>, config: IngestConfig) -> StoreResult<()> {
        let runtime = self.runtime()?;
        let value = self.prepare(value.into(), &config)?;

        self.core.data.lock().next = value.clone();
        runtime.ingest(Job::value(self.id(), value, config));
        Ok(())
    }

    /// Set the value returned by `updater`, called with the current value.
    pub fn update(&self, updater: impl FnOnce(&Value) -> Value) -> &Self {
        let next = updater(&self.core.peek());
        self.set(next)
    }

    /// Run the transform and the type check on an incoming value.
    pub(crate) fn prepare(&self, value: Value, config: &IngestConfig) -> StoreResult<Value> {
        let (transform, value_type) = {
            let data = self.core.data.lock();
            (data.compute_value.clone(), data.value_type)
        };
        let value = match transform {
            Some(transform) => transform(value),
            None => value,
        };

        if let Some(expected) = value_type {
            if !expected.matches(&value) {
                let err = StoreError::TypeMismatch {
                    expected,
                    actual: type_name(&value),
                };
                if !config.force {
                    return Err(err);
                }
                warn!(observer = %self.id(), %err, "forcing value of the wrong type");
            }
        }
        Ok(value)
    }

    /// Re-ingest the pending value. Computed instances recompute instead.
    pub fn ingest(&self, config: IngestConfig) -> &Self {
        let runtime = match self.runtime() {
            Ok(runtime) => runtime,
            Err(err) => {
                error!(observer = %self.id(), %err, "ingest failed");
                return self;
            }
        };

        let job = if self.kind().is_derived() {
            Job::recompute(self.id(), config)
        } else {
            Job::value(self.id(), self.next_value(), config)
        };
        runtime.ingest(job);
        self
    }

    /// Shallow-merge `changes` into an object value.
    pub fn patch(&self, changes: impl Into<Value>) -> &Self {
        self.patch_with(changes, PatchConfig::default())
    }

    pub fn patch_with(&self, changes: impl Into<Value>, config: PatchConfig) -> &Self {
        if let Err(err) = self.try_patch(changes, config) {
            error!(observer = %self.id(), %err, "patch rejected");
        }
        self
    }

    pub fn try_patch(&self, changes: impl Into<Value>, config: PatchConfig) -> StoreResult<()> {
        let merged = flat_merge(&self.next_value(), &changes.into(), config.add_new_properties)?;
        self.try_set(merged, config.ingest)
    }

    /// Go back to the value before the last applied Job.
    pub fn undo(&self) -> &Self {
        self.undo_with(IngestConfig::default())
    }

    pub fn undo_with(&self, config: IngestConfig) -> &Self {
        self.set_with(self.previous_value(), config)
    }

    /// Go back to the initial value.
    pub fn reset(&self) -> &Self {
        self.reset_with(IngestConfig::default())
    }

    pub fn reset_with(&self, config: IngestConfig) -> &Self {
        self.set_with(self.initial_value(), config)
    }

    /// Flip a boolean value.
    pub fn invert(&self) -> &Self {
        if let Err(err) = self.try_invert(IngestConfig::default()) {
            error!(observer = %self.id(), %err, "invert rejected");
        }
        self
    }

    pub fn try_invert(&self, config: IngestConfig) -> StoreResult<()> {
        match self.core.peek() {
            Value::Bool(value) => self.try_set(!value, config),
            other => Err(StoreError::NotBoolean(type_name(&other))),
        }
    }

    // ------------------------------------------------------------------
    // Watchers and side effects
    // ------------------------------------------------------------------

    /// Call `callback` with `(value, key)` after every applied Job.
    ///
    /// A watcher key that is taken is rejected and the existing watcher kept.
    pub fn watch<F>(&self, key: impl Into<String>, callback: F) -> &Self
    where
        F: Fn(&Value, &str) + Send + Sync + 'static,
    {
        let key = key.into();
        let mut data = self.core.data.lock();
        if data.watchers.contains_key(&key) {
            warn!(observer = %self.id(), %key, "watcher key is already taken");
            return self;
        }
        data.watchers.insert(key, Arc::new(callback));
        self
    }

    /// Like [`State::watch`] with a generated key, which is returned.
    pub fn watch_auto<F>(&self, callback: F) -> String
    where
        F: Fn(&Value, &str) + Send + Sync + 'static,
    {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let key = format!("watcher_{}", COUNTER.fetch_add(1, Ordering::Relaxed));
        self.watch(key.clone(), callback);
        key
    }

    pub fn remove_watcher(&self, key: &str) -> &Self {
        self.core.data.lock().watchers.shift_remove(key);
        self
    }

    pub fn has_watcher(&self, key: &str) -> bool {
        self.core.data.lock().watchers.contains_key(key)
    }

    /// Call `callback` once, after the next applied Job.
    pub fn on_inaugurated<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(&Value) + Send + 'static,
    {
        let callback = Mutex::new(Some(callback));
        let core = Arc::downgrade(&self.core);
        self.watch(INAUGURATED_WATCHER_KEY, move |value, key| {
            if let Some(core) = core.upgrade() {
                core.data.lock().watchers.shift_remove(key);
            }
            if let Some(callback) = callback.lock().take() {
                callback(value);
            }
        })
    }

    /// Run `callback` as part of every applied Job.
    ///
    /// Side effects run in ascending weight order. Adding a side effect with
    /// a key that is taken replaces it.
    pub fn add_side_effect<F>(&self, key: impl Into<String>, callback: F, config: SideEffectConfig) -> &Self
    where
        F: Fn(&State, &IngestConfig) + Send + Sync + 'static,
    {
        self.core.data.lock().side_effects.insert(
            key.into(),
            SideEffect {
                weight: config.weight,
                callback: Arc::new(callback),
            },
        );
        self
    }

    pub fn remove_side_effect(&self, key: &str) -> &Self {
        self.core.data.lock().side_effects.shift_remove(key);
        self
    }

    pub fn has_side_effect(&self, key: &str) -> bool {
        self.core.data.lock().side_effects.contains_key(key)
    }

    /// Run watchers, then the side effects `config` allows.
    pub(crate) fn run_side_effects(&self, config: &IngestConfig) {
        let (value, watchers, mut side_effects) = {
            let data = self.core.data.lock();
            let watchers: Vec<_> = data
                .watchers
                .iter()
                .map(|(key, watcher)| (key.clone(), Arc::clone(watcher)))
                .collect();
            let side_effects: Vec<_> = data
                .side_effects
                .iter()
                .filter(|(key, _)| config.side_effects.runs(key))
                .map(|(key, effect)| (key.clone(), effect.clone()))
                .collect();
            (data.value.clone(), watchers, side_effects)
        };

        for (key, watcher) in watchers {
            watcher(&value, &key);
        }

        side_effects.sort_by_key(|(_, effect)| effect.weight);
        for (key, effect) in side_effects {
            trace!(observer = %self.id(), side_effect = %key, "running side effect");
            (effect.callback)(self, config);
        }
    }

    // ------------------------------------------------------------------
    // Value constraints
    // ------------------------------------------------------------------

    /// Only accept values of `value_type` from now on.
    pub fn set_type(&self, value_type: ValueType) -> &Self {
        self.core.data.lock().value_type = Some(value_type);
        self
    }

    /// Like [`State::set_type`], from a tag such as `"number"`.
    ///
    /// An unknown tag is logged and no type is declared.
    pub fn set_type_tag(&self, tag: &str) -> &Self {
        match tag.parse::<ValueType>() {
            Ok(value_type) => self.set_type(value_type),
            Err(err) => {
                error!(observer = %self.id(), %err, "type not declared");
                self
            }
        }
    }

    pub fn value_type(&self) -> Option<ValueType> {
        self.core.data.lock().value_type
    }

    /// Whether `value` is acceptable for the declared type.
    pub fn has_correct_type(&self, value: &Value) -> bool {
        self.value_type()
            .map_or(true, |value_type| value_type.matches(value))
    }

    /// Transform every value ingested from now on with `transform`.
    pub fn compute_value<F>(&self, transform: F) -> &Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.core.data.lock().compute_value = Some(Arc::new(transform));
        self
    }

    /// Decide with `exists` whether a non-placeholder value exists.
    pub fn compute_exists<F>(&self, exists: F) -> &Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.core.data.lock().exists_fn = Some(Arc::new(exists));
        self
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Persist the State.
    ///
    /// The persist key is `config.key`, else the State key. With
    /// `load_value` set the stored value is loaded before this returns.
    /// Returns false if the State can't be persisted or was already.
    pub async fn persist(&self, config: PersistConfig) -> bool {
        if self.core.persistent().is_some() {
            warn!(observer = %self.id(), "state is already persisted");
            return false;
        }

        let Some(key) = config
            .key
            .clone()
            .or_else(|| self.key().map(|key| key.to_string()))
        else {
            error!(observer = %self.id(), err = %StoreError::InvalidPersistKey, "can't persist state");
            return false;
        };
        let runtime = match self.runtime() {
            Ok(runtime) => runtime,
            Err(err) => {
                error!(observer = %self.id(), %err, "can't persist state");
                return false;
            }
        };

        let persistent = match StatePersistent::attach(self, runtime.storages(), key, &config) {
            Ok(persistent) => persistent,
            Err(err) => {
                error!(observer = %self.id(), %err, "can't persist state");
                return false;
            }
        };

        if config.load_value {
            persistent.initial_loading().await;
        }
        true
    }

    pub fn persistent(&self) -> Option<Arc<StatePersistent>> {
        self.core.persistent()
    }

    pub fn is_persisted(&self) -> bool {
        self.core
            .persistent()
            .is_some_and(|persistent| persistent.is_persisted())
    }

    /// Call `callback` once the initial persisted load settles.
    ///
    /// Called right away with `true` if the State is already persisted.
    pub fn on_load<F>(&self, callback: F) -> &Self
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        if self.is_persisted() {
            callback(true);
            return self;
        }
        self.core.data.lock().on_load = Some(Arc::new(callback));
        self
    }

    // ------------------------------------------------------------------
    // Interval
    // ------------------------------------------------------------------

    /// Every `period`, set the value returned by `f` for the current value.
    ///
    /// Needs a tokio runtime. Only one interval runs at a time.
    pub fn interval<F>(&self, f: F, period: Duration) -> &Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        if self.core.data.lock().interval.is_some() {
            warn!(observer = %self.id(), "interval already exists, keeping it");
            return self;
        }
        if period.is_zero() {
            error!(observer = %self.id(), "interval period must not be zero");
            return self;
        }
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(err) => {
                error!(observer = %self.id(), %err, "interval needs a tokio runtime");
                return self;
            }
        };

        let core = Arc::downgrade(&self.core);
        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(core) = core.upgrade() else {
                    break;
                };
                let state = State::from_core(core);
                let next = f(&state.peek());
                state.set(next);
            }
        });
        self.core.data.lock().interval = Some(task);
        self
    }

    pub fn clear_interval(&self) -> &Self {
        if let Some(task) = self.core.data.lock().interval.take() {
            task.abort();
        }
        self
    }

    pub fn has_interval(&self) -> bool {
        self.core.data.lock().interval.is_some()
    }

    /// Remove the State's Observer from the graph.
    ///
    /// The State keeps its value but no longer takes part in propagation.
    pub fn dispose(&self) {
        self.core.dispose();
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.core, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn runtime() -> Runtime {
        Runtime::new()
    }

    #[test]
    fn set_tracks_snapshots() {
        let runtime = runtime();
        let state = State::new(&runtime, 1);

        state.set(2);
        assert_eq!(state.peek(), json!(2));
        assert_eq!(state.previous_value(), json!(1));
        assert_eq!(state.next_value(), json!(2));
        assert_eq!(state.initial_value(), json!(1));
        assert!(state.is_set());
    }

    #[test]
    fn undo_and_reset() {
        let runtime = runtime();
        let state = State::new(&runtime, "a");

        state.set("b").set("c");
        state.undo();
        assert_eq!(state.peek(), json!("b"));

        state.reset();
        assert_eq!(state.peek(), json!("a"));
        assert!(!state.is_set());
    }

    #[test]
    fn update_receives_current_value() {
        let runtime = runtime();
        let state = State::new(&runtime, 2);

        state.update(|value| json!(value.as_i64().unwrap_or(0) * 21));
        assert_eq!(state.peek(), json!(42));
    }

    #[test]
    fn declared_type_rejects_other_values() {
        let runtime = runtime();
        let state = State::new(&runtime, 1);
        state.set_type(ValueType::Number);

        assert!(matches!(
            state.try_set("nope", IngestConfig::default()),
            Err(StoreError::TypeMismatch { .. })
        ));
        state.set("still nope");
        assert_eq!(state.peek(), json!(1));

        state.set_with("forced", IngestConfig::default().with_force(true));
        assert_eq!(state.peek(), json!("forced"));
        assert!(!state.has_correct_type(&json!("forced")));
    }

    #[test]
    fn invalid_type_tag_declares_nothing() {
        let runtime = runtime();
        let state = State::new(&runtime, 1);

        state.set_type_tag("date");
        assert_eq!(state.value_type(), None);

        state.set_type_tag("String");
        assert_eq!(state.value_type(), Some(ValueType::String));
    }

    #[test]
    fn patch_merges_objects() {
        let runtime = runtime();
        let state = State::new(&runtime, json!({ "id": 1, "name": "jeff" }));

        state.patch(json!({ "name": "hans", "age": 3 }));
        assert_eq!(state.peek(), json!({ "id": 1, "name": "hans", "age": 3 }));

        state.patch_with(
            json!({ "name": "frank", "city": "x" }),
            PatchConfig::default().with_add_new_properties(false),
        );
        assert_eq!(state.peek(), json!({ "id": 1, "name": "frank", "age": 3 }));
    }

    #[test]
    fn patch_requires_objects() {
        let runtime = runtime();
        let state = State::new(&runtime, 5);

        assert!(matches!(
            state.try_patch(json!({ "a": 1 }), PatchConfig::default()),
            Err(StoreError::NotAnObject { .. })
        ));
        assert_eq!(state.peek(), json!(5));
    }

    #[test]
    fn invert_only_flips_booleans() {
        let runtime = runtime();
        let flag = State::new(&runtime, true);
        flag.invert();
        assert_eq!(flag.peek(), json!(false));

        let number = State::new(&runtime, 1);
        assert!(matches!(
            number.try_invert(IngestConfig::default()),
            Err(StoreError::NotBoolean("number"))
        ));
        number.invert();
        assert_eq!(number.peek(), json!(1));
    }

    #[test]
    fn watchers_receive_value_and_key() {
        let runtime = runtime();
        let state = State::new(&runtime, 0);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        state.watch("w", move |value, key| {
            sink.lock().push((value.clone(), key.to_owned()));
        });
        // taken key keeps the first watcher
        state.watch("w", |_, _| panic!("replaced watcher must not run"));

        state.set(1);
        assert_eq!(*seen.lock(), vec![(json!(1), "w".to_owned())]);

        state.remove_watcher("w");
        assert!(!state.has_watcher("w"));
        state.set(2);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn generated_watcher_keys_are_unique() {
        let runtime = runtime();
        let state = State::new(&runtime, 0);

        let a = state.watch_auto(|_, _| {});
        let b = state.watch_auto(|_, _| {});
        assert_ne!(a, b);
        assert!(state.has_watcher(&a) && state.has_watcher(&b));
    }

    #[test]
    fn inaugurated_watcher_runs_once() {
        let runtime = runtime();
        let state = State::new(&runtime, 0);
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        state.on_inaugurated(move |value| {
            assert_eq!(value, &json!(1));
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(state.has_watcher(INAUGURATED_WATCHER_KEY));

        state.set(1);
        state.set(2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!state.has_watcher(INAUGURATED_WATCHER_KEY));
    }

    #[test]
    fn side_effects_run_by_weight() {
        let runtime = runtime();
        let state = State::new(&runtime, 0);
        let order = Arc::new(Mutex::new(Vec::new()));

        for (key, weight) in [("late", 20), ("early", 1), ("default", 10)] {
            let order = Arc::clone(&order);
            state.add_side_effect(
                key,
                move |_, _| order.lock().push(key),
                SideEffectConfig { weight },
            );
        }

        state.set(1);
        assert_eq!(*order.lock(), vec!["early", "default", "late"]);
    }

    #[test]
    fn side_effects_can_be_disabled_or_excluded() {
        let runtime = runtime();
        let state = State::new(&runtime, 0);
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        state.add_side_effect(
            "count",
            move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            SideEffectConfig::default(),
        );

        state.set_with(1, IngestConfig::default().with_side_effects(false));
        state.set_with(2, IngestConfig::default().excluding_side_effect("count"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        state.set(3);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        state.remove_side_effect("count");
        assert!(!state.has_side_effect("count"));
    }

    #[test]
    fn same_value_skips_side_effects() {
        let runtime = runtime();
        let state = State::new(&runtime, 1);
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        state.watch("w", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        state.set(1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        state.set_with(1, IngestConfig::default().with_force(true));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn compute_value_transforms_input() {
        let runtime = runtime();
        let state = State::new(&runtime, "");
        state.compute_value(|value| json!(value.as_str().unwrap_or_default().to_uppercase()));

        state.set("hello");
        assert_eq!(state.peek(), json!("HELLO"));
    }

    #[test]
    fn existence_checks() {
        let runtime = runtime();
        let state = State::new(&runtime, Value::Null);
        assert!(!state.exists());

        state.set(0);
        assert!(state.exists());

        state.compute_exists(|value| value.as_i64() != Some(0));
        assert!(!state.exists());

        let placeholder = State::with_config(
            &runtime,
            1,
            StateConfig {
                is_placeholder: true,
                ..Default::default()
            },
        );
        assert!(!placeholder.exists());
        placeholder.set(2);
        assert!(placeholder.exists());
    }

    #[test]
    fn is_and_copy() {
        let runtime = runtime();
        let state = State::new(&runtime, json!({ "a": [1, 2] }));

        assert!(state.is(&json!({ "a": [1, 2] })));
        assert!(state.is_not(&json!({ "a": [] })));

        let mut copy = state.copy();
        copy["a"] = json!([]);
        assert_eq!(state.peek(), json!({ "a": [1, 2] }));
    }

    #[test]
    fn typed_reads() {
        #[derive(serde::Deserialize, PartialEq, Debug)]
        struct User {
            id: u32,
            name: String,
        }

        let runtime = runtime();
        let state = State::new(&runtime, json!({ "id": 1, "name": "jeff" }));
        assert_eq!(
            state.value_as::<User>(),
            Some(User {
                id: 1,
                name: "jeff".into()
            })
        );
        assert_eq!(state.value_as::<Vec<u8>>(), None);
    }

    #[test]
    fn set_key_updates_observer_key() {
        let runtime = runtime();
        let state = State::with_config(&runtime, 1, StateConfig::default().with_key("a"));

        state.set_key(Some(Key::from("b")));
        assert_eq!(state.key(), Some(Key::from("b")));
    }

    #[test]
    fn dropped_runtime_is_reported() {
        let runtime = runtime();
        let state = State::new(&runtime, 1);
        drop(runtime);

        assert!(matches!(
            state.try_set(2, IngestConfig::default()),
            Err(StoreError::MissingRuntime)
        ));
        state.set(3);
        assert_eq!(state.peek(), json!(1));
    }

    #[test]
    fn dispose_detaches_the_observer() {
        let runtime = runtime();
        let state = State::new(&runtime, 1);
        let id = state.id();

        state.dispose();
        assert!(!runtime.contains(id));
    }

    #[tokio::test(start_paused = true)]
    async fn interval_updates_value() {
        let runtime = runtime();
        let state = State::new(&runtime, 0);

        state.interval(|value| json!(value.as_i64().unwrap_or(0) + 1), Duration::from_millis(1000));
        state.interval(|_| json!(-1), Duration::from_millis(10));
        assert!(state.has_interval());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(state.peek(), json!(2));

        state.clear_interval();
        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(state.peek(), json!(2));
    }
}
