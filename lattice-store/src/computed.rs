//! Computed
//!
//! A [`Computed`] is a State whose value comes from a function.
//!
//! # How Computed Values Work
//!
//! 1. The function runs inside a tracking session. Every State read with
//!    `value()` during the run is recorded.
//!
//! 2. The dependencies become the recorded reads plus the hard-coded
//!    dependencies passed in the config. Edges to Observers that weren't read
//!    this time are removed.
//!
//! 3. When one of the dependencies is applied, the runtime queues a recompute
//!    Job. The function runs again at application time and its result is
//!    applied like any other value: the [`State::compute_value`] transform
//!    runs on it, and a result of the wrong declared type is rejected.
//!
//! The function runs once synchronously on construction. A Computed created
//! inside another compute function can't track right away; it computes
//! untracked and retracks with a recompute once the outer function returns.

use std::ops::Deref;
use std::sync::Arc;

use indexmap::IndexSet;
use serde_json::Value;
use tracing::error;

use crate::config::{ComputedConfig, IngestConfig};
use crate::graph::{ObserverId, ObserverKind};
use crate::key::Key;
use crate::reactive::{Job, Runtime};
use crate::state::{State, StateCore};

/// A derived State.
#[derive(Clone, Debug)]
pub struct Computed(State);

impl Computed {
    pub fn new<F>(runtime: &Runtime, compute: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        Self::with_config(runtime, compute, ComputedConfig::default())
    }

    pub fn with_config<F>(runtime: &Runtime, compute: F, config: ComputedConfig) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        let state = State::create(
            runtime,
            ObserverKind::Computed,
            config.key,
            Value::Null,
            false,
            None,
        );
        let computed = Self::install(state, runtime, Arc::new(compute), config.computed_deps);

        for dependent in config.dependents {
            runtime.add_edge(computed.id(), dependent);
        }
        computed
    }

    /// Attach `compute` to a freshly created State and run it once.
    pub(crate) fn install(
        state: State,
        runtime: &Runtime,
        compute: Arc<dyn Fn() -> Value + Send + Sync>,
        hard_deps: impl IntoIterator<Item = ObserverId>,
    ) -> Self {
        state.core.install_derivation(compute, hard_deps.into_iter().collect());
        let value = runtime
            .compute_derivation(&state.core)
            .unwrap_or(Value::Null);
        initialize(&state.core, value);
        runtime.run_deferred();
        Self(state)
    }

    pub(crate) fn from_state(state: State) -> Self {
        Self(state)
    }

    pub fn state(&self) -> &State {
        &self.0
    }

    /// Run the function and return its result without applying it.
    ///
    /// Dependencies are re-tracked all the same.
    pub fn compute(&self) -> Value {
        match self.runtime() {
            Ok(runtime) => {
                let value = runtime
                    .compute_derivation(&self.core)
                    .unwrap_or(Value::Null);
                runtime.run_deferred();
                value
            }
            Err(err) => {
                error!(observer = %self.id(), %err, "compute failed");
                self.peek()
            }
        }
    }

    /// Queue a recompute Job.
    pub fn recompute(&self, config: IngestConfig) -> &Self {
        match self.runtime() {
            Ok(runtime) => runtime.ingest(Job::recompute(self.id(), config)),
            Err(err) => error!(observer = %self.id(), %err, "recompute failed"),
        }
        self
    }

    /// Swap the function and the hard-coded dependencies, then recompute.
    pub fn update_compute_function<F, I>(&self, compute: F, deps: I, config: IngestConfig) -> &Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
        I: IntoIterator<Item = ObserverId>,
    {
        self.core
            .install_derivation(Arc::new(compute), deps.into_iter().collect());
        self.recompute(config)
    }

    /// Current dependencies: hard-coded ones and those read in the last run.
    pub fn deps(&self) -> Vec<ObserverId> {
        self.runtime()
            .map(|runtime| runtime.dependencies(self.id()))
            .unwrap_or_default()
    }

    pub fn hard_coded_deps(&self) -> IndexSet<ObserverId> {
        self.core.hard_deps()
    }

    /// Dependencies recorded in the last run.
    pub fn tracked_deps(&self) -> IndexSet<ObserverId> {
        self.core.tracked_deps()
    }

    pub fn with_key(self, key: impl Into<Key>) -> Self {
        self.0.set_key(Some(key.into()));
        self
    }
}

impl Deref for Computed {
    type Target = State;

    fn deref(&self) -> &State {
        &self.0
    }
}

/// Seed every snapshot of a new derived State with its first value.
fn initialize(core: &StateCore, value: Value) {
    let mut data = core.data.lock();
    data.initial = value.clone();
    data.previous = value.clone();
    data.next = value.clone();
    data.value = value;
}
