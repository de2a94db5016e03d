//! Jobs
//!
//! A [`Job`] is one pending value application for one Observer. Jobs are
//! created by ingest calls, queued by the runtime and applied exactly once,
//! in submission order.

use serde_json::Value;

use crate::config::IngestConfig;
use crate::graph::ObserverId;

/// What a Job applies.
#[derive(Debug, Clone, PartialEq)]
pub enum JobPayload {
    /// Apply this value.
    Value(Value),

    /// Run the Observer's compute function when the Job is applied and apply
    /// its result.
    Recompute,
}

/// One pending mutation.
#[derive(Debug, Clone)]
pub struct Job {
    observer: ObserverId,
    payload: JobPayload,
    config: IngestConfig,
}

impl Job {
    pub fn value(observer: ObserverId, value: Value, config: IngestConfig) -> Self {
        Self {
            observer,
            payload: JobPayload::Value(value),
            config,
        }
    }

    pub fn recompute(observer: ObserverId, config: IngestConfig) -> Self {
        Self {
            observer,
            payload: JobPayload::Recompute,
            config,
        }
    }

    pub fn observer(&self) -> ObserverId {
        self.observer
    }

    pub fn payload(&self) -> &JobPayload {
        &self.payload
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub(crate) fn is_recompute(&self) -> bool {
        matches!(self.payload, JobPayload::Recompute)
    }

    pub(crate) fn is_recompute_of(&self, observer: ObserverId) -> bool {
        self.observer == observer && self.payload == JobPayload::Recompute
    }

    pub(crate) fn clear_background(&mut self) {
        self.config.background = false;
    }

    pub(crate) fn into_parts(self) -> (ObserverId, JobPayload, IngestConfig) {
        (self.observer, self.payload, self.config)
    }
}
