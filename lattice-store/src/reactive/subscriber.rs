//! Subscriptions
//!
//! A subscription connects a set of Observers to an external callback, e.g.
//! the re-render hook of a UI component. The callback takes no arguments: its
//! only job is to make the subscriber read fresh values.
//!
//! The runtime hands the Observers updated during a flush to
//! [`SubscriptionController::notify`], which calls each matching callback
//! once, however many of its Observers changed.
//!
//! # Mounting
//!
//! A subscription created with `wait_for_mount` is not ready until its key is
//! mounted. Notifications that arrive before that are remembered and
//! delivered once on [`SubscriptionController::mount`].
//!
//! # Proxy-based subscriptions
//!
//! With `proxy_based` set, a subscription only fires if the value at one of
//! its JSON-pointer paths differs between the start and the end of the flush.
//! Observers without registered paths always count as changed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, trace};

use crate::config::SubscribeOptions;
use crate::graph::ObserverId;

/// Unique identifier for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Generate a new unique subscriber ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

type Callback = Arc<dyn Fn() + Send + Sync>;

/// Returned by `subscribe`, passed back to `unsubscribe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: SubscriberId,
    key: Option<String>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }
}

/// An Observer updated during a flush.
#[derive(Debug, Clone)]
pub struct ObserverChange {
    pub observer: ObserverId,
    /// Value before the first Job applied to it in this flush.
    pub before: Value,
    /// Value at the end of the flush.
    pub after: Value,
}

impl ObserverChange {
    fn changed_at(&self, path: &str) -> bool {
        self.before.pointer(path) != self.after.pointer(path)
    }
}

struct Subscription {
    key: Option<String>,
    observers: IndexSet<ObserverId>,
    callback: Callback,
    /// Paths per Observer. `None` unless the subscription is proxy based.
    paths: Option<HashMap<ObserverId, Vec<String>>>,
    ready: bool,
    pending: bool,
}

impl Subscription {
    fn is_affected(&self, changes: &[ObserverChange]) -> bool {
        changes
            .iter()
            .filter(|change| self.observers.contains(&change.observer))
            .any(|change| {
                match self
                    .paths
                    .as_ref()
                    .and_then(|paths| paths.get(&change.observer))
                {
                    Some(paths) if !paths.is_empty() => {
                        paths.iter().any(|path| change.changed_at(path))
                    }
                    _ => true,
                }
            })
    }
}

/// Registry of external subscriptions.
pub struct SubscriptionController {
    subscriptions: Mutex<IndexMap<SubscriberId, Subscription>>,
    wait_for_mount: bool,
}

impl SubscriptionController {
    /// `wait_for_mount` is the default for subscriptions that don't set it.
    pub fn new(wait_for_mount: bool) -> Self {
        Self {
            subscriptions: Mutex::new(IndexMap::new()),
            wait_for_mount,
        }
    }

    /// Subscribe `callback` to `observers`.
    pub fn subscribe<I, F>(
        &self,
        observers: I,
        callback: F,
        options: SubscribeOptions,
    ) -> SubscriptionHandle
    where
        I: IntoIterator<Item = ObserverId>,
        F: Fn() + Send + Sync + 'static,
    {
        let id = SubscriberId::new();
        let wait_for_mount = options.wait_for_mount.unwrap_or(self.wait_for_mount);

        let paths = options.proxy_based.then(|| {
            let mut paths: HashMap<ObserverId, Vec<String>> = HashMap::new();
            for (observer, path) in options.paths {
                paths.entry(observer).or_default().push(path);
            }
            paths
        });

        let subscription = Subscription {
            key: options.key.clone(),
            observers: observers.into_iter().collect(),
            callback: Arc::new(callback),
            paths,
            ready: !wait_for_mount,
            pending: false,
        };
        debug!(
            subscriber = ?id,
            observers = subscription.observers.len(),
            "subscribed"
        );
        self.subscriptions.lock().insert(id, subscription);

        SubscriptionHandle {
            id,
            key: options.key,
        }
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.subscriptions.lock().shift_remove(&handle.id).is_some()
    }

    /// Mark the subscriptions with `key` as ready and deliver what they missed.
    pub fn mount(&self, key: &str) {
        let missed: Vec<Callback> = {
            let mut subscriptions = self.subscriptions.lock();
            subscriptions
                .values_mut()
                .filter(|sub| sub.key.as_deref() == Some(key))
                .filter_map(|sub| {
                    sub.ready = true;
                    std::mem::take(&mut sub.pending).then(|| Arc::clone(&sub.callback))
                })
                .collect()
        };

        for callback in missed {
            callback();
        }
    }

    /// Mark the subscriptions with `key` as not ready.
    pub fn unmount(&self, key: &str) {
        for sub in self
            .subscriptions
            .lock()
            .values_mut()
            .filter(|sub| sub.key.as_deref() == Some(key))
        {
            sub.ready = false;
        }
    }

    /// Call every subscription affected by `changes` exactly once.
    pub fn notify(&self, changes: &[ObserverChange]) {
        let to_call: Vec<Callback> = {
            let mut subscriptions = self.subscriptions.lock();
            subscriptions
                .values_mut()
                .filter(|sub| sub.is_affected(changes))
                .filter_map(|sub| {
                    if sub.ready {
                        Some(Arc::clone(&sub.callback))
                    } else {
                        sub.pending = true;
                        None
                    }
                })
                .collect()
        };

        trace!(changes = changes.len(), callbacks = to_call.len(), "notifying subscribers");
        for callback in to_call {
            callback();
        }
    }

    /// Number of registered subscriptions.
    pub fn len(&self) -> usize {
        self.subscriptions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
