//! Observer Graph Storage
//!
//! [`ObserverGraph`] owns every [`Observer`] of a runtime and is the only
//! place edges are changed.
//!
//! # Ordering
//!
//! When a Job is applied the runtime enqueues a recompute for each derived
//! dependent. Those dependents can depend on each other (a Computed reading
//! both a State and another Computed of that State), so they are ordered with
//! a topological sort first:
//!
//! 1. Count, for each candidate, how many of its dependencies are candidates too
//! 2. Start from the candidates with a count of zero
//! 3. Emit a candidate, decrement the count of its candidate dependents
//! 4. Repeat until every candidate is emitted
//!
//! Candidates left over by a cycle are appended in their original order.

use std::collections::{HashMap, HashSet, VecDeque};

use indexmap::IndexSet;
use smallvec::SmallVec;

use super::node::{Observer, ObserverId};
use crate::key::Key;

/// Dependents collected while applying one Job. Fan-out is usually small.
pub type Dependents = SmallVec<[ObserverId; 8]>;

/// The dependency graph of one runtime.
#[derive(Debug, Default)]
pub struct ObserverGraph {
    nodes: HashMap<ObserverId, Observer>,
}

impl ObserverGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an Observer to the graph.
    pub fn add_node(&mut self, observer: Observer) -> ObserverId {
        let id = observer.id();
        self.nodes.insert(id, observer);
        id
    }

    /// Remove an Observer from the graph.
    ///
    /// Every edge touching it is removed on the other side too.
    pub fn remove_node(&mut self, id: ObserverId) -> Option<Observer> {
        let observer = self.nodes.remove(&id)?;

        for dependency in observer.dependencies() {
            if let Some(node) = self.nodes.get_mut(dependency) {
                node.remove_dependent(id);
            }
        }
        for dependent in observer.dependents() {
            if let Some(node) = self.nodes.get_mut(dependent) {
                node.remove_dependency(id);
            }
        }

        Some(observer)
    }

    pub fn get(&self, id: ObserverId) -> Option<&Observer> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: ObserverId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn set_key(&mut self, id: ObserverId, key: Option<Key>) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.set_key(key);
        }
    }

    /// Add an edge: `dependent` reads from `dependency`.
    ///
    /// Returns false (and changes nothing) for self edges or unknown Observers.
    pub fn add_edge(&mut self, dependency: ObserverId, dependent: ObserverId) -> bool {
        if dependency == dependent
            || !self.nodes.contains_key(&dependency)
            || !self.nodes.contains_key(&dependent)
        {
            return false;
        }

        if let Some(node) = self.nodes.get_mut(&dependency) {
            node.add_dependent(dependent);
        }
        if let Some(node) = self.nodes.get_mut(&dependent) {
            node.add_dependency(dependency);
        }
        true
    }

    /// Remove an edge.
    pub fn remove_edge(&mut self, dependency: ObserverId, dependent: ObserverId) {
        if let Some(node) = self.nodes.get_mut(&dependency) {
            node.remove_dependent(dependent);
        }
        if let Some(node) = self.nodes.get_mut(&dependent) {
            node.remove_dependency(dependency);
        }
    }

    /// Replace the dependencies of `id` with `deps`.
    ///
    /// Only the difference is applied: stale edges are removed, new ones
    /// added, unchanged ones left in place.
    pub fn rebuild_dependencies(&mut self, id: ObserverId, deps: &IndexSet<ObserverId>) {
        let current = match self.nodes.get(&id) {
            Some(node) => node.dependencies().clone(),
            None => return,
        };

        for stale in current.iter().filter(|dep| !deps.contains(*dep)) {
            self.remove_edge(*stale, id);
        }
        for dep in deps.iter().filter(|dep| !current.contains(*dep)) {
            self.add_edge(*dep, id);
        }
    }

    pub fn dependencies(&self, id: ObserverId) -> Vec<ObserverId> {
        self.nodes
            .get(&id)
            .map(|node| node.dependencies().iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn dependents(&self, id: ObserverId) -> Dependents {
        self.nodes
            .get(&id)
            .map(|node| node.dependents().iter().copied().collect())
            .unwrap_or_default()
    }

    /// Order `ids` so that dependencies come before their dependents.
    ///
    /// Unknown ids are dropped.
    pub fn topological_order(&self, ids: &[ObserverId]) -> Dependents {
        let candidates: HashSet<ObserverId> = ids
            .iter()
            .copied()
            .filter(|id| self.nodes.contains_key(id))
            .collect();
        let mut in_degree: HashMap<ObserverId, usize> = HashMap::new();
        let mut queue = VecDeque::new();
        let mut result = Dependents::new();

        for id in ids {
            if in_degree.contains_key(id) {
                continue;
            }
            if let Some(node) = self.nodes.get(id) {
                let degree = node
                    .dependencies()
                    .iter()
                    .filter(|dep| candidates.contains(*dep))
                    .count();
                in_degree.insert(*id, degree);
                if degree == 0 {
                    queue.push_back(*id);
                }
            }
        }

        while let Some(id) = queue.pop_front() {
            result.push(id);

            if let Some(node) = self.nodes.get(&id) {
                for dependent in node.dependents() {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        if *degree > 0 {
                            *degree -= 1;
                            if *degree == 0 {
                                queue.push_back(*dependent);
                            }
                        }
                    }
                }
            }
        }

        if result.len() < in_degree.len() {
            for id in ids {
                if in_degree.contains_key(id) && !result.contains(id) {
                    result.push(*id);
                }
            }
        }

        result
    }

    /// Get the total number of Observers in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Check that every edge is stored on both of its ends.
    pub fn edges_are_mutual(&self) -> bool {
        self.nodes.values().all(|node| {
            node.dependencies().iter().all(|dep| {
                self.nodes
                    .get(dep)
                    .is_some_and(|other| other.dependents().contains(&node.id()))
            }) && node.dependents().iter().all(|dependent| {
                self.nodes
                    .get(dependent)
                    .is_some_and(|other| other.dependencies().contains(&node.id()))
            })
        })
    }
}
