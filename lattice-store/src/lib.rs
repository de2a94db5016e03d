//! Lattice Store
//!
//! This crate provides the state layer of the Lattice reactive UI framework.
//! It implements:
//!
//! - Observable values ([`State`]) and derived values ([`Computed`]) with
//!   automatic dependency tracking
//! - A Job queue that propagates changes through the Observer graph in
//!   dependency order and notifies subscribers once per flush
//! - Keyed collections with ordered Groups and Item Selectors
//! - Persistence of States and Collections to pluggable async storages
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `graph`: Observer nodes and the dependency graph
//! - `reactive`: the runtime, Jobs, dependency tracking and subscriptions
//! - `state` / `computed`: the value instances
//! - `collection`: Collections, Items, Groups and Selectors
//! - `storage`: storage backends and the storage registry
//!
//! # Example
//!
//! ```rust,ignore
//! use lattice_store::{Computed, Runtime, State};
//! use serde_json::json;
//!
//! let runtime = Runtime::new();
//! let count = State::new(&runtime, 1);
//!
//! let c = count.clone();
//! let doubled = Computed::new(&runtime, move || json!(c.value().as_i64().unwrap_or(0) * 2));
//!
//! count.set(5);
//! assert_eq!(doubled.peek(), json!(10));
//! ```

pub mod collection;
pub mod computed;
pub mod config;
pub mod error;
pub mod graph;
pub mod instance;
pub mod key;
pub mod reactive;
pub mod state;
pub mod storage;
pub mod value;

pub use collection::{Collection, Group, Item, Selector};
pub use computed::Computed;
pub use config::{IngestConfig, RuntimeConfig};
pub use error::{StorageError, StoreError, StoreResult};
pub use graph::{ObserverId, ObserverKind};
pub use instance::{Instance, Observable};
pub use key::Key;
pub use reactive::{Runtime, SubscriptionHandle};
pub use state::State;
pub use storage::{MemoryStorage, Storage, StorageBackend, Storages};
pub use value::ValueType;
