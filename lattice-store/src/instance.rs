//! Instances
//!
//! Every Observer is owned by exactly one of five instance kinds. [`Instance`]
//! is the closed sum over them, discriminated by [`ObserverKind`], and
//! [`Observable`] is what they all share.

use std::sync::Arc;

use crate::collection::{Group, Item, Selector};
use crate::computed::Computed;
use crate::config::IngestConfig;
use crate::graph::{ObserverId, ObserverKind};
use crate::state::{State, StateCore};

/// Operations shared by everything that owns an Observer.
pub trait Observable {
    /// The State record behind the instance.
    fn as_state(&self) -> &State;

    fn observer(&self) -> ObserverId {
        self.as_state().id()
    }

    fn kind(&self) -> ObserverKind {
        self.as_state().kind()
    }

    /// Re-ingest the instance's pending value (or recompute it).
    fn ingest(&self, config: IngestConfig) {
        self.as_state().ingest(config);
    }
}

impl Observable for State {
    fn as_state(&self) -> &State {
        self
    }
}

impl Observable for Computed {
    fn as_state(&self) -> &State {
        self.state()
    }
}

impl Observable for Group {
    fn as_state(&self) -> &State {
        self.state()
    }
}

impl Observable for Selector {
    fn as_state(&self) -> &State {
        self.computed().state()
    }
}

impl Observable for Item {
    fn as_state(&self) -> &State {
        self.state()
    }
}

/// Any Observer-owning instance.
#[derive(Debug, Clone)]
pub enum Instance {
    State(State),
    Computed(Computed),
    Group(Group),
    Selector(Selector),
    Item(Item),
}

impl Instance {
    pub(crate) fn from_core(core: Arc<StateCore>) -> Self {
        let state = State::from_core(core);
        match state.kind() {
            ObserverKind::State => Instance::State(state),
            ObserverKind::Computed => Instance::Computed(Computed::from_state(state)),
            ObserverKind::Group => Instance::Group(Group::from_state(state)),
            ObserverKind::Selector => Instance::Selector(Selector::from_state(state)),
            ObserverKind::Item => Instance::Item(Item::from_state(state)),
        }
    }

    pub fn as_group(&self) -> Option<&Group> {
        match self {
            Instance::Group(group) => Some(group),
            _ => None,
        }
    }

    pub fn as_selector(&self) -> Option<&Selector> {
        match self {
            Instance::Selector(selector) => Some(selector),
            _ => None,
        }
    }

    pub fn as_item(&self) -> Option<&Item> {
        match self {
            Instance::Item(item) => Some(item),
            _ => None,
        }
    }

    pub fn as_computed(&self) -> Option<&Computed> {
        match self {
            Instance::Computed(computed) => Some(computed),
            _ => None,
        }
    }
}

impl Observable for Instance {
    fn as_state(&self) -> &State {
        match self {
            Instance::State(state) => state,
            Instance::Computed(computed) => computed.as_state(),
            Instance::Group(group) => group.as_state(),
            Instance::Selector(selector) => selector.as_state(),
            Instance::Item(item) => item.as_state(),
        }
    }
}
