//! Observer Graph
//!
//! Every State, Computed, Group, Selector and Item owns one Observer in the
//! runtime's [`ObserverGraph`]. Edges record which Observers a derived value
//! reads from.
//!
//! # Overview
//!
//! - Nodes are Observers, indexed by [`ObserverId`].
//! - An edge from B to A means A depends on B: when B is applied, A is
//!   recomputed.
//!
//! Both directions are stored (`dependencies` and `dependents`) and every
//! mutation goes through the graph, which updates both sides at once. That
//! keeps the edge sets mutual at all times.
//!
//! Only the Runtime (job application) and Computed (dependency re-tracking)
//! mutate edges.

mod node;
mod observers;

pub use node::{Observer, ObserverId, ObserverKind};
pub use observers::ObserverGraph;
