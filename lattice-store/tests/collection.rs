//! Integration Tests for Collections
//!
//! These tests verify that Items, Groups and Selectors stay consistent while
//! data is collected, updated, renamed and removed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lattice_store::config::{
    CollectConfig, CollectionConfig, IngestConfig, RemoveConfig, SelectConfig, SubscribeOptions,
    UpdateConfig,
};
use lattice_store::{Collection, Computed, Key, Runtime};
use serde_json::{json, Value};

fn todos(runtime: &Runtime) -> Collection {
    Collection::new(runtime, CollectionConfig::default().with_key("todos"))
}

/// Test that selecting a missing key creates a placeholder, and selecting
/// away removes it again.
#[test]
fn placeholder_lifecycle() {
    let runtime = Runtime::new();
    let collection = todos(&runtime);
    collection.collect(vec![json!({ "id": 2, "name": "b" })], &[], CollectConfig::default());

    let selector = collection.create_selector("current", 100);
    let placeholder = collection.get_item(&Key::from(100)).expect("placeholder");
    assert!(!placeholder.exists());
    assert!(placeholder.is_placeholder());
    assert_eq!(placeholder.peek(), json!({ "id": 100 }));
    assert_eq!(selector.peek(), Value::Null);
    drop(placeholder);

    selector.select(2, SelectConfig::default());
    assert!(collection.get_item(&Key::from(100)).is_none());
    assert_eq!(selector.peek(), json!({ "id": 2, "name": "b" }));
}

/// Test that a Selector created from inside a compute function follows its
/// Item once the Item is collected.
#[test]
fn selector_created_while_computing_follows_its_item() {
    let runtime = Runtime::new();
    let collection = todos(&runtime);

    let c = collection.clone();
    let name = Computed::new(&runtime, move || c.select(1).value()["name"].clone());
    assert_eq!(name.peek(), Value::Null);

    collection.collect(vec![json!({ "id": 1, "name": "a" })], &[], CollectConfig::default());

    let selector = collection.get_selector(&Key::from(1)).expect("selector");
    assert_eq!(selector.peek(), json!({ "id": 1, "name": "a" }));
    assert_eq!(name.peek(), json!("a"));
}

/// Test that a placeholder becomes the real Item when its data arrives.
#[test]
fn collected_data_replaces_placeholder_in_place() {
    let runtime = Runtime::new();
    let collection = todos(&runtime);
    let selector = collection.create_selector("current", 1);
    let placeholder = collection.get_item(&Key::from(1)).expect("placeholder");

    collection.collect(vec![json!({ "id": 1, "name": "a" })], &[], CollectConfig::default());

    let item = collection.get_item(&Key::from(1)).expect("item");
    assert!(item.ptr_eq(&placeholder));
    assert!(item.exists());
    assert_eq!(selector.peek(), json!({ "id": 1, "name": "a" }));
    assert_eq!(collection.get_default_group().peek(), json!([1]));
}

/// Test that group output follows the group's key order.
#[test]
fn group_output_follows_key_order() {
    let runtime = Runtime::new();
    let collection = todos(&runtime);
    collection.collect(
        vec![json!({ "id": 1, "name": "a" }), json!({ "id": 2, "name": "b" })],
        &[],
        CollectConfig::default(),
    );

    let group = collection.create_group("ordered", [2, 1]);
    assert_eq!(
        group.output(),
        vec![json!({ "id": 2, "name": "b" }), json!({ "id": 1, "name": "a" })]
    );
}

/// Test that a Computed reading a group output reacts to Item changes.
#[test]
fn computed_over_group_output_recomputes() {
    let runtime = Runtime::new();
    let collection = todos(&runtime);
    collection.collect(
        vec![json!({ "id": 1, "done": false }), json!({ "id": 2, "done": true })],
        &[],
        CollectConfig::default(),
    );

    let group = collection.get_default_group();
    let done = Computed::new(&runtime, move || {
        let count = group
            .output()
            .iter()
            .filter(|todo| todo["done"] == json!(true))
            .count();
        json!(count)
    });
    assert_eq!(done.peek(), json!(1));

    collection.update(&Key::from(1), json!({ "done": true }), UpdateConfig::default());
    assert_eq!(done.peek(), json!(2));

    collection.collect(vec![json!({ "id": 3, "done": true })], &[], CollectConfig::default());
    assert_eq!(done.peek(), json!(3));

    collection.remove([2], RemoveConfig::default());
    assert_eq!(done.peek(), json!(2));
}

/// Test that collecting many payloads notifies subscribers once.
#[test]
fn collect_notifies_once() {
    let runtime = Runtime::new();
    let collection = todos(&runtime);
    let group = collection.get_default_group();

    let count = Arc::new(AtomicUsize::new(0));
    let probe = Arc::clone(&count);
    runtime.subscribe(
        [group.id()],
        move || {
            probe.fetch_add(1, Ordering::SeqCst);
        },
        SubscribeOptions::default(),
    );

    collection.collect(
        (1..=5).map(|id| json!({ "id": id })).collect::<Vec<_>>(),
        &[],
        CollectConfig::default(),
    );
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(group.size(), 5);
}

/// Test that renaming an Item keeps every structure pointing at it.
#[test]
fn rename_keeps_groups_and_selectors_consistent() {
    let runtime = Runtime::new();
    let collection = todos(&runtime);
    collection.collect(
        vec![json!({ "id": 1, "name": "a" }), json!({ "id": 2, "name": "b" })],
        &[Key::from("mine")],
        CollectConfig::default(),
    );
    let selector = collection.create_selector("current", 1);

    let count = Arc::new(AtomicUsize::new(0));
    let probe = Arc::clone(&count);
    runtime.subscribe(
        [collection.get_default_group().id(), selector.id()],
        move || {
            probe.fetch_add(1, Ordering::SeqCst);
        },
        SubscribeOptions::default(),
    );

    assert!(collection.update_item_key(&Key::from(1), Key::from(10), IngestConfig::default()));

    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(collection.get_default_group().peek(), json!([10, 2]));
    assert_eq!(
        collection.get_group(&Key::from("mine")).expect("group").peek(),
        json!([10, 2])
    );
    assert_eq!(selector.item_key(), Some(Key::from(10)));
    assert_eq!(selector.peek(), json!({ "id": 10, "name": "a" }));
    assert!(collection.get_item(&Key::from(1)).is_none());
}

/// Test that removing from some Groups only deletes orphaned Items.
#[test]
fn remove_from_groups_deletes_orphans_only() {
    let runtime = Runtime::new();
    let collection = todos(&runtime);
    collection.collect(vec![json!({ "id": 1 }), json!({ "id": 2 })], &[], CollectConfig::default());
    collection.collect(vec![json!({ "id": 2 })], &[Key::from("starred")], CollectConfig::default());

    collection.remove([1, 2], RemoveConfig::from_groups(["default"]));

    assert!(!collection.has(&Key::from(1)));
    assert!(collection.has(&Key::from(2)));
    assert_eq!(collection.size(), 1);
    assert_eq!(collection.get_default_group().peek(), json!([]));
}

/// Test that values of removed Items are no longer reachable.
#[test]
fn removed_items_leave_selectors_null() {
    let runtime = Runtime::new();
    let collection = todos(&runtime);
    collection.collect(vec![json!({ "id": 1 })], &[], CollectConfig::default());
    let selector = collection.create_selector("current", 1);
    assert_eq!(selector.peek(), json!({ "id": 1 }));

    collection.remove([1], RemoveConfig::default());

    assert_eq!(selector.peek(), Value::Null);
    assert!(collection.get_item_value(&Key::from(1)).is_none());
    assert!(collection.get_all_item_values().is_empty());
    assert!(runtime.edges_are_mutual());
}

/// Test that background collects don't notify.
#[test]
fn background_collect_is_silent() {
    let runtime = Runtime::new();
    let collection = todos(&runtime);
    let group = collection.get_default_group();

    let count = Arc::new(AtomicUsize::new(0));
    let probe = Arc::clone(&count);
    runtime.subscribe(
        [group.id()],
        move || {
            probe.fetch_add(1, Ordering::SeqCst);
        },
        SubscribeOptions::default(),
    );

    collection.collect(
        vec![json!({ "id": 1 })],
        &[],
        CollectConfig {
            background: true,
            ..Default::default()
        },
    );
    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert_eq!(group.peek(), json!([1]));
}

/// Test collections keyed by a custom primary key.
#[test]
fn custom_primary_key() {
    let runtime = Runtime::new();
    let collection = Collection::new(
        &runtime,
        CollectionConfig::default().with_primary_key("slug"),
    );
    collection.collect(
        vec![json!({ "slug": "intro", "title": "Intro" }), json!({ "id": 1 })],
        &[],
        CollectConfig::default(),
    );

    assert_eq!(collection.size(), 1);
    assert!(collection.has(&Key::from("intro")));
    let placeholder = collection.create_placeholder_item(Key::from("outro"));
    assert_eq!(placeholder.peek(), json!({ "slug": "outro" }));
}
