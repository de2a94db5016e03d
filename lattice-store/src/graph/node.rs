//! Graph Nodes
//!
//! This module defines the Observer record stored in the graph.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexSet;

use crate::key::Key;

/// Unique identifier for an Observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

impl ObserverId {
    /// Generate a new unique observer ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for ObserverId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What owns an Observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObserverKind {
    /// A plain State.
    State,

    /// A Computed. Recomputed when one of its dependencies is applied.
    Computed,

    /// A Collection Group. Its value is the ordered list of Item keys.
    Group,

    /// A Collection Selector, a Computed pinned to one Item key.
    Selector,

    /// A Collection Item.
    Item,
}

impl ObserverKind {
    /// Whether Observers of this kind own a compute function.
    pub fn is_derived(&self) -> bool {
        matches!(self, ObserverKind::Computed | ObserverKind::Selector)
    }
}

/// An Observer in the graph.
#[derive(Debug, Clone)]
pub struct Observer {
    id: ObserverId,
    kind: ObserverKind,
    key: Option<Key>,

    /// Observers this one reads from.
    dependencies: IndexSet<ObserverId>,

    /// Observers that read from this one.
    dependents: IndexSet<ObserverId>,
}

impl Observer {
    pub fn new(id: ObserverId, kind: ObserverKind, key: Option<Key>) -> Self {
        Self {
            id,
            kind,
            key,
            dependencies: IndexSet::new(),
            dependents: IndexSet::new(),
        }
    }

    pub fn id(&self) -> ObserverId {
        self.id
    }

    pub fn kind(&self) -> ObserverKind {
        self.kind
    }

    pub fn key(&self) -> Option<&Key> {
        self.key.as_ref()
    }

    pub(crate) fn set_key(&mut self, key: Option<Key>) {
        self.key = key;
    }

    /// Observers this one reads from, in insertion order.
    pub fn dependencies(&self) -> &IndexSet<ObserverId> {
        &self.dependencies
    }

    /// Observers that read from this one, in insertion order.
    pub fn dependents(&self) -> &IndexSet<ObserverId> {
        &self.dependents
    }

    // Edge halves. Only `ObserverGraph` calls these so both sides change together.

    pub(super) fn add_dependency(&mut self, id: ObserverId) {
        self.dependencies.insert(id);
    }

    pub(super) fn remove_dependency(&mut self, id: ObserverId) {
        self.dependencies.shift_remove(&id);
    }

    pub(super) fn add_dependent(&mut self, id: ObserverId) {
        self.dependents.insert(id);
    }

    pub(super) fn remove_dependent(&mut self, id: ObserverId) {
        self.dependents.shift_remove(&id);
    }
}
