//! Runtime
//!
//! The runtime is the central coordinator. It owns the Observer graph, the
//! Job queue, the tracker used for auto-tracking, the subscription registry
//! and the storages.
//!
//! # How It Works
//!
//! 1. Every State-like instance registers its Observer with the runtime it
//!    was created on. The registry only keeps weak references, so dropping
//!    the last handle to an instance unregisters it.
//!
//! 2. Ingesting a value appends a [`Job`] to the queue and drains it, unless
//!    a drain is already running further up the stack. Reentrant ingests (a
//!    side effect calling `set`) are just queued and picked up by that drain.
//!
//! 3. Applying a Job:
//!    a. Recompute Jobs run the compute function under a tracking session and
//!       rebuild the Observer's dependency edges
//!    b. Unchanged values are skipped unless the Job is forced
//!    c. The owning State's snapshots are updated and the value is written to
//!       storage if the State is persisted
//!    d. Watchers and side effects run
//!    e. Derived dependents are queued for recompute, dependencies first
//!
//! 4. Once the queue is empty, the Observers updated by non-background Jobs
//!    are handed to the [`SubscriptionController`] in one notification pass.
//!    [`Runtime::batch`] holds that pass back until the outermost batch
//!    returns.
//!
//! # Locks
//!
//! No lock is held while user code (compute functions, watchers, side
//! effects, subscriber callbacks) runs.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use indexmap::{IndexMap, IndexSet};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, error, trace};

use super::context::ComputedTracker;
use super::job::{Job, JobPayload};
use super::subscriber::{ObserverChange, SubscriptionController, SubscriptionHandle};
use crate::config::{IngestConfig, RuntimeConfig, SubscribeOptions};
use crate::graph::{Observer, ObserverGraph, ObserverId};
use crate::graph::ObserverKind;
use crate::instance::Instance;
use crate::key::Key;
use crate::state::{State, StateCore};
use crate::storage::{MemoryStorage, Storage, Storages};

pub(crate) struct RuntimeInner {
    config: RuntimeConfig,
    graph: RwLock<ObserverGraph>,
    registry: RwLock<HashMap<ObserverId, Weak<StateCore>>>,
    queue: Mutex<VecDeque<Job>>,
    draining: AtomicBool,
    /// Set when a compute ran untracked and queued a recompute to retrack.
    deferred: AtomicBool,
    batch_depth: AtomicUsize,
    /// Observers updated by non-background Jobs since the last notification
    /// pass, with their value before the first of those Jobs.
    updated: Mutex<IndexMap<ObserverId, Value>>,
    tracker: ComputedTracker,
    subscriptions: SubscriptionController,
    storages: Storages,
}

/// Handle to a reactive runtime. Cloning is cheap.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

/// Non-owning handle to a [`Runtime`].
#[derive(Clone, Default)]
pub struct WeakRuntime {
    inner: Weak<RuntimeInner>,
}

impl WeakRuntime {
    pub fn upgrade(&self) -> Option<Runtime> {
        self.inner.upgrade().map(|inner| Runtime { inner })
    }
}

impl fmt::Debug for WeakRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakRuntime")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

/// Resets the draining flag, also when a Job panics.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct BatchGuard<'a>(&'a Runtime);

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        let runtime = self.0;
        let depth = runtime.inner.batch_depth.fetch_sub(1, Ordering::AcqRel);
        if depth == 1
            && !runtime.inner.draining.load(Ordering::Acquire)
            && !std::thread::panicking()
        {
            runtime.flush_notifications();
        }
    }
}

impl Runtime {
    /// Create a runtime with the default config.
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        let storages = Storages::new(config.default_storage_prefix.clone());
        if config.memory_storage {
            storages.register(Storage::new("memory", MemoryStorage::new()), true);
        }

        debug!(?config, "runtime created");
        Self {
            inner: Arc::new(RuntimeInner {
                subscriptions: SubscriptionController::new(config.wait_for_mount),
                config,
                graph: RwLock::new(ObserverGraph::new()),
                registry: RwLock::new(HashMap::new()),
                queue: Mutex::new(VecDeque::new()),
                draining: AtomicBool::new(false),
                deferred: AtomicBool::new(false),
                batch_depth: AtomicUsize::new(0),
                updated: Mutex::new(IndexMap::new()),
                tracker: ComputedTracker::new(),
                storages,
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn downgrade(&self) -> WeakRuntime {
        WeakRuntime {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Check if two handles point at the same runtime.
    pub fn ptr_eq(&self, other: &Runtime) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn tracker(&self) -> &ComputedTracker {
        &self.inner.tracker
    }

    pub fn storages(&self) -> &Storages {
        &self.inner.storages
    }

    pub fn subscriptions(&self) -> &SubscriptionController {
        &self.inner.subscriptions
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Subscribe `callback` to the given Observers. See [`SubscriptionController`].
    pub fn subscribe<I, F>(
        &self,
        observers: I,
        callback: F,
        options: SubscribeOptions,
    ) -> SubscriptionHandle
    where
        I: IntoIterator<Item = ObserverId>,
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.subscriptions.subscribe(observers, callback, options)
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.inner.subscriptions.unsubscribe(handle)
    }

    pub fn mount(&self, key: &str) {
        self.inner.subscriptions.mount(key);
    }

    pub fn unmount(&self, key: &str) {
        self.inner.subscriptions.unmount(key);
    }

    // ------------------------------------------------------------------
    // Registry and graph
    // ------------------------------------------------------------------

    pub(crate) fn register(&self, core: &Arc<StateCore>, key: Option<Key>) {
        self.inner
            .graph
            .write()
            .add_node(Observer::new(core.id(), core.kind(), key));
        self.inner
            .registry
            .write()
            .insert(core.id(), Arc::downgrade(core));
    }

    pub(crate) fn unregister(&self, id: ObserverId) {
        self.inner.registry.write().remove(&id);
        self.inner.graph.write().remove_node(id);
    }

    pub(crate) fn core(&self, id: ObserverId) -> Option<Arc<StateCore>> {
        let weak = self.inner.registry.read().get(&id).cloned()?;
        weak.upgrade()
    }

    /// Resolve an Observer to the instance that owns it.
    pub fn instance(&self, id: ObserverId) -> Option<Instance> {
        self.core(id).map(Instance::from_core)
    }

    /// Whether the Observer is still part of the graph.
    pub fn contains(&self, id: ObserverId) -> bool {
        self.inner.graph.read().contains(id)
    }

    pub fn dependencies(&self, id: ObserverId) -> Vec<ObserverId> {
        self.inner.graph.read().dependencies(id)
    }

    pub fn dependents(&self, id: ObserverId) -> Vec<ObserverId> {
        self.inner.graph.read().dependents(id).into_vec()
    }

    pub fn observer_count(&self) -> usize {
        self.inner.graph.read().node_count()
    }

    /// Check that every edge in the graph is stored on both of its ends.
    pub fn edges_are_mutual(&self) -> bool {
        self.inner.graph.read().edges_are_mutual()
    }

    pub(crate) fn add_edge(&self, dependency: ObserverId, dependent: ObserverId) -> bool {
        self.inner.graph.write().add_edge(dependency, dependent)
    }

    pub(crate) fn set_observer_key(&self, id: ObserverId, key: Option<Key>) {
        self.inner.graph.write().set_key(id, key);
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    /// Queue a Job and drain the queue unless the Job asks not to.
    pub fn ingest(&self, job: Job) {
        let perform = job.config().perform;
        trace!(observer = %job.observer(), perform, "job queued");
        self.inner.queue.lock().push_back(job);

        if perform {
            self.drain();
        }
    }

    /// Apply every queued Job.
    ///
    /// Returns right away if a drain is already running; that drain picks up
    /// whatever was queued. While a tracking session is active, recompute
    /// Jobs are held back until [`run_deferred`](Self::run_deferred).
    pub fn drain(&self) {
        let tracking = self.inner.tracker.is_active();
        let mut held: Vec<Job> = Vec::new();
        loop {
            if self.inner.draining.swap(true, Ordering::AcqRel) {
                self.hold_back(held);
                return;
            }
            if !tracking {
                self.inner.deferred.store(false, Ordering::Release);
            }
            {
                let _guard = DrainGuard(&self.inner.draining);
                while let Some(job) = self.next_job() {
                    if tracking && job.is_recompute() {
                        held.push(job);
                    } else {
                        self.apply(job);
                    }
                }
            }
            if self.inner.queue.lock().is_empty() {
                break;
            }
        }
        self.hold_back(held);

        if self.inner.batch_depth.load(Ordering::Acquire) == 0 {
            self.flush_notifications();
        }
    }

    /// Run `f`, holding notifications back until the outermost batch returns.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.batch_depth.fetch_add(1, Ordering::AcqRel);
        let _guard = BatchGuard(self);
        f()
    }

    fn hold_back(&self, held: Vec<Job>) {
        if held.is_empty() {
            return;
        }
        trace!(jobs = held.len(), "recomputes held until tracking ends");
        self.inner.queue.lock().extend(held);
        self.inner.deferred.store(true, Ordering::Release);
    }

    /// Number of Jobs waiting in the queue.
    pub fn pending_jobs(&self) -> usize {
        self.inner.queue.lock().len()
    }

    fn next_job(&self) -> Option<Job> {
        self.inner.queue.lock().pop_front()
    }

    fn apply(&self, job: Job) {
        let (id, payload, config) = job.into_parts();
        let Some(core) = self.core(id) else {
            trace!(observer = %id, "observer is gone, dropping job");
            return;
        };

        let value = match payload {
            JobPayload::Value(value) => value,
            JobPayload::Recompute => {
                let Some(value) = self.compute_derivation(&core) else {
                    return;
                };
                match State::from_core(Arc::clone(&core)).prepare(value, &config) {
                    Ok(value) => value,
                    Err(err) => {
                        error!(observer = %id, %err, "computed value rejected");
                        return;
                    }
                }
            }
        };

        let Some(previous) = core.apply(value, &config) else {
            trace!(observer = %id, "value unchanged, job skipped");
            return;
        };
        trace!(observer = %id, kind = ?core.kind(), background = config.background, "job applied");

        if config.storage {
            core.persist_current();
        }

        State::from_core(Arc::clone(&core)).run_side_effects(&config);

        if !config.background {
            self.inner.updated.lock().entry(id).or_insert(previous);
        }

        self.enqueue_dependents(id, config.background);
    }

    /// Queue a recompute for every derived dependent of `id`.
    ///
    /// A dependent that already has a recompute queued isn't queued twice.
    fn enqueue_dependents(&self, id: ObserverId, background: bool) {
        let ordered = {
            let graph = self.inner.graph.read();
            let derived: Vec<ObserverId> = graph
                .dependents(id)
                .into_iter()
                .filter(|dependent| {
                    graph
                        .get(*dependent)
                        .is_some_and(|observer| observer.kind().is_derived())
                })
                .collect();
            graph.topological_order(&derived)
        };
        if ordered.is_empty() {
            return;
        }

        let mut queue = self.inner.queue.lock();
        for dependent in ordered {
            if let Some(queued) = queue.iter_mut().find(|job| job.is_recompute_of(dependent)) {
                if !background {
                    queued.clear_background();
                }
                continue;
            }
            queue.push_back(Job::recompute(
                dependent,
                IngestConfig::default().with_background(background),
            ));
        }
    }

    /// Run the compute function of `core` and rebuild its dependency edges
    /// from what it read. Returns `None` for cores without a compute function.
    pub(crate) fn compute_derivation(&self, core: &StateCore) -> Option<Value> {
        let (compute, hard_deps) = core.derivation_parts()?;

        match self.inner.tracker.track() {
            Ok(session) => {
                let value = compute();
                let tracked = session.finish();

                let mut deps: IndexSet<ObserverId> = hard_deps;
                deps.extend(tracked.iter().copied());
                deps.shift_remove(&core.id());

                core.set_tracked_deps(tracked);
                self.inner
                    .graph
                    .write()
                    .rebuild_dependencies(core.id(), &deps);
                Some(value)
            }
            Err(err) => {
                // Retrack once the session that holds the tracker has ended.
                debug!(observer = %core.id(), %err, "computing untracked, recompute deferred");
                self.inner
                    .queue
                    .lock()
                    .push_back(Job::recompute(core.id(), IngestConfig::default()));
                self.inner.deferred.store(true, Ordering::Release);
                Some(compute())
            }
        }
    }

    /// Drain recomputes deferred by [`compute_derivation`](Self::compute_derivation)
    /// once no tracking session is active.
    pub(crate) fn run_deferred(&self) {
        if self.inner.tracker.is_active() {
            return;
        }
        if self.inner.deferred.swap(false, Ordering::AcqRel) {
            self.drain();
        }
    }

    fn flush_notifications(&self) {
        let updated = std::mem::take(&mut *self.inner.updated.lock());
        if updated.is_empty() {
            return;
        }

        let changes: Vec<ObserverChange> = updated
            .into_iter()
            .filter_map(|(observer, before)| {
                self.core(observer).map(|core| ObserverChange {
                    observer,
                    before,
                    after: core.peek(),
                })
            })
            .collect();

        debug!(observers = changes.len(), "flush finished");
        self.inner.subscriptions.notify(&changes);
    }

    /// Kind of a registered Observer.
    pub fn kind_of(&self, id: ObserverId) -> Option<ObserverKind> {
        self.inner.graph.read().get(id).map(|observer| observer.kind())
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("observers", &self.observer_count())
            .field("pending_jobs", &self.pending_jobs())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::computed::Computed;
    use crate::value::ValueType;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn probe(runtime: &Runtime, observers: Vec<ObserverId>) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        runtime.subscribe(
            observers,
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            SubscribeOptions::default(),
        );
        count
    }

    #[test]
    fn states_register_and_unregister() {
        let runtime = Runtime::new();
        let state = State::new(&runtime, 1);
        let id = state.id();

        assert!(runtime.contains(id));
        assert!(runtime.instance(id).is_some());

        drop(state);
        assert!(!runtime.contains(id));
        assert!(runtime.instance(id).is_none());
    }

    #[test]
    fn jobs_wait_until_drained() {
        let runtime = Runtime::new();
        let state = State::new(&runtime, 1);

        state.set_with(2, IngestConfig::default().with_perform(false));
        assert_eq!(runtime.pending_jobs(), 1);
        assert_eq!(state.peek(), json!(1));

        runtime.drain();
        assert_eq!(runtime.pending_jobs(), 0);
        assert_eq!(state.peek(), json!(2));
    }

    #[test]
    fn batch_coalesces_notifications() {
        let runtime = Runtime::new();
        let a = State::new(&runtime, 1);
        let b = State::new(&runtime, 1);
        let count = probe(&runtime, vec![a.id(), b.id()]);

        runtime.batch(|| {
            a.set(2);
            b.set(2);
            a.set(3);
        });

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reentrant_ingest_is_queued() {
        let runtime = Runtime::new();
        let source = State::new(&runtime, 1);
        let mirror = State::new(&runtime, 0);

        let target = mirror.clone();
        source.watch("mirror", move |value, _| {
            target.set(value.clone());
        });

        let count = probe(&runtime, vec![source.id(), mirror.id()]);
        source.set(5);

        assert_eq!(mirror.peek(), json!(5));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn diamond_recomputes_once() {
        let runtime = Runtime::new();
        let source = State::new(&runtime, 1);

        let s = source.clone();
        let left = Computed::new(&runtime, move || json!(s.value().as_i64().unwrap_or(0) + 1));
        let s = source.clone();
        let right = Computed::new(&runtime, move || json!(s.value().as_i64().unwrap_or(0) * 2));

        let runs = Arc::new(AtomicUsize::new(0));
        let (l, r, counter) = (left.clone(), right.clone(), Arc::clone(&runs));
        let sum = Computed::new(&runtime, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            json!(l.value().as_i64().unwrap_or(0) + r.value().as_i64().unwrap_or(0))
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        source.set(2);

        assert_eq!(sum.peek(), json!(7));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn computed_created_while_tracking_retracks_afterwards() {
        let runtime = Runtime::new();
        let source = State::new(&runtime, 1);
        let slot: Arc<Mutex<Option<Computed>>> = Arc::default();

        let (rt, s, inner_slot) = (runtime.clone(), source.clone(), Arc::clone(&slot));
        let outer = Computed::new(&runtime, move || {
            let mut inner_slot = inner_slot.lock();
            let inner = inner_slot.get_or_insert_with(|| {
                let s = s.clone();
                Computed::new(&rt, move || json!(s.value().as_i64().unwrap_or(0) * 10))
            });
            inner.value()
        });

        let inner = slot.lock().clone().expect("inner computed");
        assert_eq!(runtime.dependencies(inner.id()), vec![source.id()]);
        assert_eq!(runtime.pending_jobs(), 0);

        source.set(2);
        assert_eq!(inner.peek(), json!(20));
        assert_eq!(outer.peek(), json!(20));
        assert!(runtime.edges_are_mutual());
    }

    #[test]
    fn recomputed_values_pass_the_declared_type() {
        let runtime = Runtime::new();
        let source = State::new(&runtime, 1);
        let s = source.clone();
        let computed = Computed::new(&runtime, move || match s.value().as_i64() {
            Some(3) => json!("three"),
            other => json!(other.unwrap_or(0) * 2),
        });
        computed.set_type(ValueType::Number);
        computed.compute_value(|value| match value.as_i64() {
            Some(number) => json!(number + 1),
            None => value,
        });

        source.set(2);
        assert_eq!(computed.peek(), json!(5));

        source.set(3);
        assert_eq!(computed.peek(), json!(5));
    }

    #[test]
    fn weak_runtime_does_not_keep_it_alive() {
        let runtime = Runtime::new();
        let weak = runtime.downgrade();
        assert!(weak.upgrade().is_some());

        drop(runtime);
        assert!(weak.upgrade().is_none());
    }
}
