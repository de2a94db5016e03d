//! Reactive Core
//!
//! This module holds the machinery every State-like instance runs on.
//!
//! # Concepts
//!
//! ## Jobs
//!
//! Every value change is a [`Job`] queued on the [`Runtime`]. Jobs are applied
//! one at a time, in submission order. Applying a Job can queue more Jobs:
//! side effects that call `set`, and recomputes of the Computed values that
//! depend on the changed Observer.
//!
//! ## Tracking
//!
//! A Computed runs its function inside a [`TrackingSession`]. Every tracked
//! read made during the session is recorded by the runtime's
//! [`ComputedTracker`], and the recorded set becomes the Computed's
//! dependencies.
//!
//! ## Subscriptions
//!
//! External code, typically a UI component, subscribes to Observers through
//! the [`SubscriptionController`] and gets one callback per flush.

mod context;
mod job;
mod runtime;
mod subscriber;

pub use context::{ComputedTracker, TrackingSession};
pub use job::{Job, JobPayload};
pub use runtime::{Runtime, WeakRuntime};
pub use subscriber::{
    ObserverChange, SubscriberId, SubscriptionController, SubscriptionHandle,
};
