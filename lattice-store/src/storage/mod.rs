//! Storage
//!
//! Persistence goes through pluggable backends. A [`StorageBackend`] only
//! knows how to get, set and remove values by string key. [`Storage`] wraps
//! a backend with a name and a key prefix and exposes the contract States
//! and Collections use: every failure is logged and reported as `false` or
//! `None`, never returned as an error.
//!
//! [`Storages`] is the registry of a runtime. One storage is the default.
//!
//! # Writes
//!
//! Job application is synchronous, so writes can't be awaited where they
//! happen. `Storages::set` and `Storages::remove` queue the write instead
//! and spawn a task on the current tokio runtime to drain the queue. Writes
//! are applied in the order they were queued. Outside a tokio runtime the
//! queue is only drained by [`Storages::flush`], which reads also call first.

mod memory;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, error, trace, warn};

pub use memory::MemoryStorage;

use crate::error::StorageError;

/// A key-value storage backend.
pub trait StorageBackend: Send + Sync + 'static {
    /// Load the value stored at `key`.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Value>, StorageError>>;

    /// Store `value` at `key`.
    fn set<'a>(&'a self, key: &'a str, value: Value) -> BoxFuture<'a, Result<(), StorageError>>;

    /// Remove whatever is stored at `key`.
    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StorageError>>;
}

/// A named storage.
pub struct Storage {
    key: String,
    prefix: Option<String>,
    backend: Arc<dyn StorageBackend>,
}

impl Storage {
    pub fn new(key: impl Into<String>, backend: impl StorageBackend) -> Self {
        Self {
            key: key.into(),
            prefix: None,
            backend: Arc::new(backend),
        }
    }

    /// Prefix every key with `_<prefix>_`. An empty prefix disables prefixing.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// Key as stored in the backend.
    pub fn format_key(&self, key: &str) -> String {
        match self.prefix.as_deref() {
            Some(prefix) if !prefix.is_empty() => format!("_{prefix}_{key}"),
            _ => key.to_owned(),
        }
    }

    /// Check a key before it's used. Empty keys are rejected.
    pub fn validate_key(&self, key: &str) -> Option<String> {
        if key.is_empty() {
            error!(storage = %self.key, "no valid storage key provided");
            return None;
        }
        Some(key.to_owned())
    }

    /// Load the value stored at `key`. Missing values and failures are `None`.
    pub async fn load_value(&self, key: &str) -> Option<Value> {
        let key = self.validate_key(key)?;
        match self.backend.get(&self.format_key(&key)).await {
            Ok(value) => value,
            Err(err) => {
                error!(storage = %self.key, %key, %err, "failed to load value");
                None
            }
        }
    }

    /// Store `value` at `key`.
    pub async fn update_value(&self, key: &str, value: Value) -> bool {
        let Some(key) = self.validate_key(key) else {
            return false;
        };
        match self.backend.set(&self.format_key(&key), value).await {
            Ok(()) => true,
            Err(err) => {
                error!(storage = %self.key, %key, %err, "failed to store value");
                false
            }
        }
    }

    /// Remove the value stored at `key`.
    pub async fn remove_value(&self, key: &str) -> bool {
        let Some(key) = self.validate_key(key) else {
            return false;
        };
        match self.backend.remove(&self.format_key(&key)).await {
            Ok(()) => true,
            Err(err) => {
                error!(storage = %self.key, %key, %err, "failed to remove value");
                false
            }
        }
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("key", &self.key)
            .field("prefix", &self.prefix)
            .finish()
    }
}

#[derive(Debug)]
enum StorageWrite {
    Set {
        storage_keys: Vec<String>,
        key: String,
        value: Value,
    },
    Remove {
        storage_keys: Vec<String>,
        key: String,
    },
}

struct StoragesInner {
    storages: DashMap<String, Arc<Storage>>,
    default_key: RwLock<Option<String>>,
    default_prefix: String,
    pending: Mutex<VecDeque<StorageWrite>>,
    /// Held while a drain runs so queued writes stay in order.
    draining: tokio::sync::Mutex<()>,
}

/// Registry of the storages of a runtime. Cloning is cheap.
#[derive(Clone)]
pub struct Storages {
    inner: Arc<StoragesInner>,
}

impl Storages {
    /// `default_prefix` is applied to storages registered without a prefix.
    pub fn new(default_prefix: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(StoragesInner {
                storages: DashMap::new(),
                default_key: RwLock::new(None),
                default_prefix: default_prefix.into(),
                pending: Mutex::new(VecDeque::new()),
                draining: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Register a storage.
    ///
    /// The first registered storage becomes the default, as does any storage
    /// registered with `default` set. Registering a taken key is rejected.
    pub fn register(&self, storage: Storage, default: bool) -> bool {
        let mut storage = storage;
        if storage.prefix.is_none() {
            storage.prefix = Some(self.inner.default_prefix.clone());
        }

        let key = storage.key.clone();
        if self.inner.storages.contains_key(&key) {
            warn!(storage = %key, "storage is already registered");
            return false;
        }
        self.inner.storages.insert(key.clone(), Arc::new(storage));

        let mut default_key = self.inner.default_key.write();
        if default || default_key.is_none() {
            *default_key = Some(key.clone());
        }
        debug!(storage = %key, default = default_key.as_deref() == Some(key.as_str()), "storage registered");
        true
    }

    pub fn get_storage(&self, key: &str) -> Option<Arc<Storage>> {
        self.inner.storages.get(key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn has_storage(&self) -> bool {
        !self.inner.storages.is_empty()
    }

    pub fn default_storage_key(&self) -> Option<String> {
        self.inner.default_key.read().clone()
    }

    /// Load `key` from `storage_key`, or from the default storage.
    ///
    /// Queued writes are flushed first.
    pub async fn get(&self, key: &str, storage_key: Option<&str>) -> Option<Value> {
        self.flush().await;

        let storage_key = match storage_key {
            Some(storage_key) => storage_key.to_owned(),
            None => self.default_storage_key()?,
        };
        let Some(storage) = self.get_storage(&storage_key) else {
            error!(storage = %storage_key, "storage is not registered");
            return None;
        };
        storage.load_value(key).await
    }

    /// Queue a write of `value` at `key` to each of `storage_keys`.
    pub fn set(&self, key: &str, value: Value, storage_keys: &[String]) {
        self.enqueue(StorageWrite::Set {
            storage_keys: storage_keys.to_vec(),
            key: key.to_owned(),
            value,
        });
    }

    /// Queue a removal of `key` from each of `storage_keys`.
    pub fn remove(&self, key: &str, storage_keys: &[String]) {
        self.enqueue(StorageWrite::Remove {
            storage_keys: storage_keys.to_vec(),
            key: key.to_owned(),
        });
    }

    /// Number of writes waiting to be applied.
    pub fn pending_writes(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Apply every queued write.
    pub async fn flush(&self) {
        let _draining = self.inner.draining.lock().await;
        loop {
            let next = self.inner.pending.lock().pop_front();
            let Some(write) = next else {
                break;
            };
            self.perform(write).await;
        }
    }

    fn enqueue(&self, write: StorageWrite) {
        trace!(?write, "storage write queued");
        self.inner.pending.lock().push_back(write);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let storages = self.clone();
                handle.spawn(async move { storages.flush().await });
            }
            Err(_) => trace!("no tokio runtime, write waits for the next flush"),
        }
    }

    async fn perform(&self, write: StorageWrite) {
        match write {
            StorageWrite::Set {
                storage_keys,
                key,
                value,
            } => {
                for storage_key in &storage_keys {
                    match self.get_storage(storage_key) {
                        Some(storage) => {
                            storage.update_value(&key, value.clone()).await;
                        }
                        None => error!(storage = %storage_key, %key, "storage is not registered"),
                    }
                }
            }
            StorageWrite::Remove { storage_keys, key } => {
                for storage_key in &storage_keys {
                    match self.get_storage(storage_key) {
                        Some(storage) => {
                            storage.remove_value(&key).await;
                        }
                        None => error!(storage = %storage_key, %key, "storage is not registered"),
                    }
                }
            }
        }
    }
}

impl fmt::Debug for Storages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storages")
            .field("storages", &self.inner.storages.len())
            .field("default", &self.default_storage_key())
            .field("pending", &self.pending_writes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn storages_with_memory() -> (Storages, MemoryStorage) {
        let storages = Storages::new("test");
        let memory = MemoryStorage::new();
        storages.register(Storage::new("memory", memory.clone()), false);
        (storages, memory)
    }

    #[test]
    fn keys_are_prefixed() {
        let storage = Storage::new("memory", MemoryStorage::new()).with_prefix("app");
        assert_eq!(storage.format_key("count"), "_app_count");

        let plain = Storage::new("memory", MemoryStorage::new()).with_prefix("");
        assert_eq!(plain.format_key("count"), "count");
        assert_eq!(plain.validate_key(""), None);
    }

    #[test]
    fn first_storage_becomes_default() {
        let (storages, _) = storages_with_memory();
        assert_eq!(storages.default_storage_key().as_deref(), Some("memory"));

        storages.register(Storage::new("other", MemoryStorage::new()), false);
        assert_eq!(storages.default_storage_key().as_deref(), Some("memory"));

        storages.register(Storage::new("main", MemoryStorage::new()), true);
        assert_eq!(storages.default_storage_key().as_deref(), Some("main"));

        assert!(!storages.register(Storage::new("main", MemoryStorage::new()), false));
    }

    #[tokio::test]
    async fn queued_writes_apply_in_order() {
        let (storages, memory) = storages_with_memory();
        let keys = vec!["memory".to_owned()];

        storages.set("count", json!(1), &keys);
        storages.set("count", json!(2), &keys);
        storages.remove("gone", &keys);
        storages.flush().await;

        assert_eq!(storages.pending_writes(), 0);
        assert_eq!(storages.get("count", None).await, Some(json!(2)));
        assert!(memory.contains("_test_count"));
    }

    #[tokio::test]
    async fn unknown_storage_reads_nothing() {
        let (storages, _) = storages_with_memory();
        assert_eq!(storages.get("count", Some("missing")).await, None);
    }
}
