//! Computed Tracker
//!
//! The tracker records which Observers are read while a compute function
//! runs. This is what lets a Computed discover its dependencies without
//! declaring them.
//!
//! # Implementation
//!
//! Each runtime owns one tracker with a single session slot. Starting a
//! session claims the slot for the calling thread and returns a
//! [`TrackingSession`] guard. Reads made by that thread while the guard is
//! alive are recorded. [`TrackingSession::finish`] hands back exactly the set
//! of Observers that were read; dropping the guard without finishing (e.g.
//! when the compute function panics) just releases the slot.
//!
//! Sessions don't nest: `track` fails with [`StoreError::NestedTracking`]
//! while the slot is taken.

use std::thread::{self, ThreadId};

use indexmap::IndexSet;
use parking_lot::Mutex;

use crate::error::{StoreError, StoreResult};
use crate::graph::ObserverId;

/// The session currently holding the tracker.
#[derive(Debug)]
struct ActiveSession {
    thread: ThreadId,
    /// Observers read so far, in read order.
    tracked: IndexSet<ObserverId>,
}

/// Records Observer reads during compute functions.
#[derive(Debug, Default)]
pub struct ComputedTracker {
    active: Mutex<Option<ActiveSession>>,
}

impl ComputedTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a tracking session.
    ///
    /// Fails if a session is already active.
    pub fn track(&self) -> StoreResult<TrackingSession<'_>> {
        let mut active = self.active.lock();
        if active.is_some() {
            return Err(StoreError::NestedTracking);
        }
        *active = Some(ActiveSession {
            thread: thread::current().id(),
            tracked: IndexSet::new(),
        });

        Ok(TrackingSession {
            tracker: self,
            finished: false,
        })
    }

    /// Check if the calling thread is inside a tracking session.
    pub fn is_tracking(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|session| session.thread == thread::current().id())
    }

    /// Check if any thread holds the session slot.
    pub fn is_active(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Record a read of `id`.
    ///
    /// Called by every tracked value read. Does nothing outside a session.
    pub fn record(&self, id: ObserverId) {
        if let Some(session) = self.active.lock().as_mut() {
            if session.thread == thread::current().id() {
                session.tracked.insert(id);
            }
        }
    }

    fn release(&self) -> IndexSet<ObserverId> {
        self.active
            .lock()
            .take()
            .map(|session| session.tracked)
            .unwrap_or_default()
    }
}

/// Guard for an active tracking session.
pub struct TrackingSession<'a> {
    tracker: &'a ComputedTracker,
    finished: bool,
}

impl TrackingSession<'_> {
    /// End the session and return the Observers read during it.
    pub fn finish(mut self) -> IndexSet<ObserverId> {
        self.finished = true;
        self.tracker.release()
    }
}

impl Drop for TrackingSession<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.tracker.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_returns_exact_reads() {
        let tracker = ComputedTracker::new();
        let a = ObserverId::new();
        let b = ObserverId::new();

        assert!(!tracker.is_tracking());

        let session = tracker.track().unwrap();
        assert!(tracker.is_tracking());
        tracker.record(b);
        tracker.record(a);
        tracker.record(b);

        let tracked = session.finish();
        assert_eq!(tracked.into_iter().collect::<Vec<_>>(), vec![b, a]);
        assert!(!tracker.is_tracking());
    }

    #[test]
    fn reads_outside_a_session_are_ignored() {
        let tracker = ComputedTracker::new();
        tracker.record(ObserverId::new());

        let session = tracker.track().unwrap();
        assert!(session.finish().is_empty());
    }

    #[test]
    fn nesting_is_rejected() {
        let tracker = ComputedTracker::new();
        let _outer = tracker.track().unwrap();

        assert!(matches!(tracker.track(), Err(StoreError::NestedTracking)));
        assert!(tracker.is_active());
    }

    #[test]
    fn dropped_session_releases_the_slot() {
        let tracker = ComputedTracker::new();
        {
            let _session = tracker.track().unwrap();
            tracker.record(ObserverId::new());
        }

        assert!(!tracker.is_tracking());
        let session = tracker.track().unwrap();
        assert!(session.finish().is_empty());
    }

    #[test]
    fn other_threads_are_not_recorded() {
        use std::sync::Arc;

        let tracker = Arc::new(ComputedTracker::new());
        let session = tracker.track().unwrap();

        let remote = Arc::clone(&tracker);
        std::thread::spawn(move || remote.record(ObserverId::new()))
            .join()
            .unwrap();

        assert!(session.finish().is_empty());
    }
}
