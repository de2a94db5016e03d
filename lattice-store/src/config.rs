//! Configuration
//!
//! [`RuntimeConfig`] configures a [`Runtime`](crate::Runtime) and can be
//! loaded from JSON. Every other type in this module is the option bundle of
//! one operation. They all implement `Default` with the documented defaults,
//! so call sites only spell out what differs:
//!
//! ```rust,ignore
//! state.set_with(5, IngestConfig::default().with_background(true));
//! ```

use serde::{Deserialize, Serialize};

use crate::graph::ObserverId;
use crate::key::Key;

/// Runtime-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Default for [`SubscribeOptions::wait_for_mount`].
    pub wait_for_mount: bool,

    /// Key prefix applied by storages registered without their own prefix.
    pub default_storage_prefix: String,

    /// Register an in-memory storage as the default storage at startup.
    pub memory_storage: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            wait_for_mount: false,
            default_storage_prefix: "lattice".to_owned(),
            memory_storage: false,
        }
    }
}

impl RuntimeConfig {
    /// Parse a config from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Which side effects run when a Job is applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SideEffectsConfig {
    pub enabled: bool,
    /// Side-effect keys skipped even when side effects are enabled.
    pub exclude: Vec<String>,
}

impl Default for SideEffectsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            exclude: Vec::new(),
        }
    }
}

impl SideEffectsConfig {
    pub(crate) fn runs(&self, key: &str) -> bool {
        self.enabled && !self.exclude.iter().any(|excluded| excluded == key)
    }
}

/// Options of a value ingestion (one Job).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Apply the value without notifying subscribers.
    pub background: bool,
    pub side_effects: SideEffectsConfig,
    /// Apply even if the value is unchanged or fails the declared type.
    pub force: bool,
    /// Write the applied value to storage if the State is persisted.
    pub storage: bool,
    /// Make the applied value the new initial value.
    pub overwrite: bool,
    /// Drain the queue right away. When false the Job waits for the next drain.
    pub perform: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            background: false,
            side_effects: SideEffectsConfig::default(),
            force: false,
            storage: true,
            overwrite: false,
            perform: true,
        }
    }
}

impl IngestConfig {
    pub fn with_background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_storage(mut self, storage: bool) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_perform(mut self, perform: bool) -> Self {
        self.perform = perform;
        self
    }

    pub fn with_side_effects(mut self, enabled: bool) -> Self {
        self.side_effects.enabled = enabled;
        self
    }

    pub fn excluding_side_effect(mut self, key: impl Into<String>) -> Self {
        self.side_effects.exclude.push(key.into());
        self
    }
}

/// Options of `State::patch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchConfig {
    /// Copy properties the current value doesn't have yet.
    pub add_new_properties: bool,
    pub ingest: IngestConfig,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            add_new_properties: true,
            ingest: IngestConfig::default(),
        }
    }
}

impl PatchConfig {
    pub fn with_add_new_properties(mut self, add: bool) -> Self {
        self.add_new_properties = add;
        self
    }

    pub fn with_ingest(mut self, ingest: IngestConfig) -> Self {
        self.ingest = ingest;
        self
    }
}

/// Options of `State::with_config`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateConfig {
    pub key: Option<Key>,
    /// Observers that depend on the new State from the start.
    pub dependents: Vec<ObserverId>,
    /// Create the State as a placeholder that holds no real value yet.
    pub is_placeholder: bool,
}

impl StateConfig {
    pub fn with_key(mut self, key: impl Into<Key>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Options of `Computed::with_config`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComputedConfig {
    pub key: Option<Key>,
    pub dependents: Vec<ObserverId>,
    /// Hard-coded dependencies, kept regardless of what the function reads.
    pub computed_deps: Vec<ObserverId>,
}

/// Options of `State::add_side_effect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SideEffectConfig {
    /// Side effects run in ascending weight order.
    pub weight: i32,
}

impl Default for SideEffectConfig {
    fn default() -> Self {
        Self { weight: 10 }
    }
}

/// Options of `State::persist` and `Collection::persist`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    /// Persist key. Falls back to the instance key.
    pub key: Option<String>,
    /// Load the stored value right away.
    pub load_value: bool,
    /// Storages the value is written to. Empty means the default storage.
    pub storage_keys: Vec<String>,
    /// Storage the value is loaded from.
    pub default_storage_key: Option<String>,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            key: None,
            load_value: true,
            storage_keys: Vec::new(),
            default_storage_key: None,
        }
    }
}

impl PersistConfig {
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_load_value(mut self, load_value: bool) -> Self {
        self.load_value = load_value;
        self
    }
}

/// Options of `Collection::new`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    pub key: Option<Key>,
    /// Payload field holding the Item key.
    pub primary_key: String,
    pub default_group_key: Key,
    /// Named Groups created with the Collection.
    pub groups: Vec<Key>,
    /// Named Selectors created with the Collection; each selects the Item
    /// whose key equals its name.
    pub selectors: Vec<Key>,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            key: None,
            primary_key: "id".to_owned(),
            default_group_key: Key::from("default"),
            groups: Vec::new(),
            selectors: Vec::new(),
        }
    }
}

impl CollectionConfig {
    pub fn with_key(mut self, key: impl Into<Key>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_primary_key(mut self, primary_key: impl Into<String>) -> Self {
        self.primary_key = primary_key.into();
        self
    }

    pub fn with_groups<I, K>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<Key>,
    {
        self.groups.extend(groups.into_iter().map(Into::into));
        self
    }

    pub fn with_selectors<I, K>(mut self, selectors: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<Key>,
    {
        self.selectors.extend(selectors.into_iter().map(Into::into));
        self
    }
}

/// Where new keys enter a Group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AddMethod {
    #[default]
    Push,
    Unshift,
}

/// Options of `Group::add`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupAddConfig {
    pub method: AddMethod,
    /// Move keys that are already present to the new position.
    pub overwrite: bool,
    pub background: bool,
}

/// Options of `Collection::collect`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectConfig {
    pub method: AddMethod,
    pub background: bool,
    /// Patch existing Items instead of replacing their value.
    pub patch: bool,
    /// Create a Selector for every collected Item.
    pub select: bool,
}

/// Options of `Collection::update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateConfig {
    pub patch: bool,
    pub add_new_properties: bool,
    pub background: bool,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            patch: true,
            add_new_properties: true,
            background: false,
        }
    }
}

/// Options of `Collection::remove`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoveConfig {
    /// Only remove from these Groups. `None` removes the Items everywhere.
    pub from_groups: Option<Vec<Key>>,
    pub background: bool,
}

impl RemoveConfig {
    pub fn from_groups<I, K>(groups: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<Key>,
    {
        Self {
            from_groups: Some(groups.into_iter().map(Into::into).collect()),
            background: false,
        }
    }
}

/// Options of `Selector::select`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectConfig {
    pub background: bool,
    pub side_effects: bool,
    /// Reselect even if the key is already selected.
    pub force: bool,
}

impl Default for SelectConfig {
    fn default() -> Self {
        Self {
            background: false,
            side_effects: true,
            force: false,
        }
    }
}

impl SelectConfig {
    pub(crate) fn ingest(&self) -> IngestConfig {
        IngestConfig::default()
            .with_background(self.background)
            .with_side_effects(self.side_effects)
            .with_force(self.force)
    }
}

/// Options of `Runtime::subscribe`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Subscription key, used by `mount`/`unmount`.
    pub key: Option<String>,
    /// Only notify when a value at one of `paths` changed.
    pub proxy_based: bool,
    /// JSON-pointer paths per observer, e.g. `(id, "/name")`.
    pub paths: Vec<(ObserverId, String)>,
    /// Overrides [`RuntimeConfig::wait_for_mount`].
    pub wait_for_mount: Option<bool>,
}
