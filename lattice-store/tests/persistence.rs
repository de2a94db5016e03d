//! Integration Tests for Persistence
//!
//! These tests run States and Collections against in-memory and failing
//! storage backends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use lattice_store::config::{CollectConfig, CollectionConfig, PersistConfig, StateConfig};
use lattice_store::{
    Collection, Key, MemoryStorage, Runtime, State, Storage, StorageBackend, StorageError,
};
use serde_json::{json, Value};

/// Runtime with a shared in-memory default storage.
fn runtime_with(memory: &MemoryStorage) -> Runtime {
    let runtime = Runtime::new();
    runtime
        .storages()
        .register(Storage::new("memory", memory.clone()), true);
    runtime
}

struct Unavailable;

impl StorageBackend for Unavailable {
    fn get<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, Result<Option<Value>, StorageError>> {
        async { Err(StorageError::Unavailable("offline".to_owned())) }.boxed()
    }

    fn set<'a>(&'a self, _key: &'a str, _value: Value) -> BoxFuture<'a, Result<(), StorageError>> {
        async { Err(StorageError::Unavailable("offline".to_owned())) }.boxed()
    }

    fn remove<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, Result<(), StorageError>> {
        async { Err(StorageError::Unavailable("offline".to_owned())) }.boxed()
    }
}

/// Test that a reloaded State gets the last stored value, not its initial one.
#[tokio::test]
async fn state_round_trips_through_storage() {
    let memory = MemoryStorage::new();
    let runtime = runtime_with(&memory);

    let count = State::new(&runtime, 1);
    assert!(count.persist(PersistConfig::default().with_key("count")).await);
    count.set(5);
    count.set(7);
    runtime.storages().flush().await;
    assert!(memory.contains("_lattice_count"));

    let reloaded = State::new(&runtime, 1);
    let loaded = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&loaded);
    reloaded.on_load(move |success| flag.store(success, Ordering::SeqCst));
    assert!(reloaded.persist(PersistConfig::default().with_key("count")).await);

    assert_eq!(reloaded.peek(), json!(7));
    assert!(loaded.load(Ordering::SeqCst));
    assert!(reloaded.is_persisted());
}

/// Test that the first persist stores the current value.
#[tokio::test]
async fn first_persist_stores_current_value() {
    let memory = MemoryStorage::new();
    let runtime = runtime_with(&memory);

    let theme = State::with_config(
        &runtime,
        "dark",
        StateConfig::default().with_key("theme"),
    );
    let loaded = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&loaded);
    theme.on_load(move |success| flag.store(success, Ordering::SeqCst));

    assert!(theme.persist(PersistConfig::default()).await);
    assert!(!loaded.load(Ordering::SeqCst));
    assert_eq!(
        runtime.storages().get("theme", None).await,
        Some(json!("dark"))
    );
}

/// Test that persisting needs a key and happens only once.
#[tokio::test]
async fn persist_needs_a_key_and_runs_once() {
    let memory = MemoryStorage::new();
    let runtime = runtime_with(&memory);

    let anonymous = State::new(&runtime, 1);
    assert!(!anonymous.persist(PersistConfig::default()).await);
    assert!(anonymous.persistent().is_none());

    let named = State::new(&runtime, 1);
    assert!(named.persist(PersistConfig::default().with_key("named")).await);
    assert!(!named.persist(PersistConfig::default().with_key("other")).await);
    assert_eq!(named.persistent().map(|p| p.key()), Some("named".to_owned()));
}

/// Test that changing the persist key moves the stored value.
#[tokio::test]
async fn persist_key_change_moves_value() {
    let memory = MemoryStorage::new();
    let runtime = runtime_with(&memory);

    let state = State::with_config(&runtime, 3, StateConfig::default().with_key("old"));
    state.persist(PersistConfig::default()).await;
    state.set_key(Some(Key::from("new")));

    let storages = runtime.storages();
    assert_eq!(storages.get("new", None).await, Some(json!(3)));
    assert_eq!(storages.get("old", None).await, None);
}

/// Test that storage failures are reported, not raised.
#[tokio::test]
async fn failing_backend_reports_failure() {
    let storage = Storage::new("offline", Unavailable);
    assert!(!storage.update_value("key", json!(1)).await);
    assert!(!storage.remove_value("key").await);
    assert_eq!(storage.load_value("key").await, None);
    assert_eq!(storage.validate_key(""), None);

    let runtime = Runtime::new();
    runtime.storages().register(storage, true);
    let state = State::new(&runtime, 1);
    assert!(state.persist(PersistConfig::default().with_key("k")).await);
    state.set(2);
    runtime.storages().flush().await;
    assert_eq!(state.peek(), json!(2));
}

/// Test that persisting without any registered storage fails.
#[tokio::test]
async fn persist_without_storage_fails() {
    let runtime = Runtime::new();
    let state = State::new(&runtime, 1);
    assert!(!state.persist(PersistConfig::default().with_key("k")).await);
}

/// Test that a persisted Collection comes back with its Items and order.
#[tokio::test]
async fn collection_round_trips_through_storage() {
    let memory = MemoryStorage::new();
    let runtime = runtime_with(&memory);
    let config = CollectionConfig::default().with_key("todos");

    {
        let collection = Collection::new(&runtime, config.clone());
        assert!(collection.persist(PersistConfig::default()).await);
        collection.collect(
            vec![json!({ "id": 3, "t": "c" }), json!({ "id": 1, "t": "a" })],
            &[],
            CollectConfig::default(),
        );
        collection.update(&Key::from(1), json!({ "t": "A" }), Default::default());
        runtime.storages().flush().await;
    }
    assert!(memory.contains("_lattice__todos_item_1"));

    let restored = Collection::new(&runtime, config);
    assert!(restored.persist(PersistConfig::default()).await);

    assert_eq!(restored.get_default_group().peek(), json!([3, 1]));
    assert_eq!(
        restored.get_item_value(&Key::from(1)),
        Some(json!({ "id": 1, "t": "A" }))
    );
    assert_eq!(restored.size(), 2);
}

/// Test that renamed Items are stored under their new key.
#[tokio::test]
async fn renamed_item_moves_in_storage() {
    let memory = MemoryStorage::new();
    let runtime = runtime_with(&memory);
    let collection = Collection::new(&runtime, CollectionConfig::default().with_key("todos"));
    collection.persist(PersistConfig::default()).await;
    collection.collect(vec![json!({ "id": 1 })], &[], CollectConfig::default());

    collection.update(&Key::from(1), json!({ "id": 2 }), Default::default());

    let storages = runtime.storages();
    assert_eq!(storages.get("_todos_item_1", None).await, None);
    assert_eq!(storages.get("_todos_item_2", None).await, Some(json!({ "id": 2 })));
    assert_eq!(storages.get("_todos_group_default", None).await, Some(json!([2])));
}
