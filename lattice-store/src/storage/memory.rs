//! In-memory storage backend.

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt};
use serde_json::Value;

use super::StorageBackend;
use crate::error::StorageError;

/// Keeps MessagePack-encoded values in a concurrent map.
///
/// Clones share the same cells, so a test can keep a handle to inspect what
/// a runtime stored.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    cells: Arc<DashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a (formatted) key is stored.
    pub fn contains(&self, key: &str) -> bool {
        self.cells.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    fn decode(&self, key: &str) -> Result<Option<Value>, StorageError> {
        match self.cells.get(key) {
            Some(bytes) => Ok(Some(rmp_serde::from_slice(bytes.value())?)),
            None => Ok(None),
        }
    }
}

impl StorageBackend for MemoryStorage {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Value>, StorageError>> {
        async move { self.decode(key) }.boxed()
    }

    fn set<'a>(&'a self, key: &'a str, value: Value) -> BoxFuture<'a, Result<(), StorageError>> {
        async move {
            let bytes = rmp_serde::to_vec(&value)?;
            self.cells.insert(key.to_owned(), bytes);
            Ok(())
        }
        .boxed()
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StorageError>> {
        async move {
            self.cells.remove(key);
            Ok(())
        }
        .boxed()
    }
}
