//! Job context: progress reporting and cooperative cancellation
//!
//! Long-running operations receive a [`JobContext`] by reference and consult
//! it only at chunk/batch boundaries. Work inside a chunk is never pre-empted.

use crate::events::{CodingEvent, EventBus};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Progress and cancellation channel for one job
#[derive(Clone)]
pub struct JobContext {
    job_id: Uuid,
    operation: String,
    cancel: CancellationToken,
    events: Option<EventBus>,
}

impl JobContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            operation: operation.into(),
            cancel: CancellationToken::new(),
            events: None,
        }
    }

    /// Context that is never cancelled and reports nowhere
    pub fn detached() -> Self {
        Self::new("detached")
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Token callers use to request cancellation
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Report progress (clamped to 0..=100)
    pub fn report_progress(&self, percent: u8) {
        let percent = percent.min(100);
        tracing::debug!(job_id = %self.job_id, operation = %self.operation, percent, "Job progress");

        if let Some(events) = &self.events {
            events.emit_lossy(CodingEvent::JobProgress {
                job_id: self.job_id,
                operation: self.operation.clone(),
                percent,
                timestamp: Utc::now(),
            });
        }
    }

    /// Report `done` of `total` units as a percentage
    pub fn report_fraction(&self, done: usize, total: usize) {
        self.report_progress(percent_of(done, total));
    }

    pub fn report_cancelled(&self) {
        tracing::warn!(job_id = %self.job_id, operation = %self.operation, "Job cancelled");
        if let Some(events) = &self.events {
            events.emit_lossy(CodingEvent::JobCancelled {
                job_id: self.job_id,
                operation: self.operation.clone(),
                timestamp: Utc::now(),
            });
        }
    }

    /// Announce that cached results matching `pattern` were dropped
    pub fn report_cache_invalidated(&self, workspace_id: i64, pattern: &str) {
        if let Some(events) = &self.events {
            events.emit_lossy(CodingEvent::CacheInvalidated {
                workspace_id,
                pattern: pattern.to_string(),
                timestamp: Utc::now(),
            });
        }
    }

    pub fn report_completed(&self) {
        if let Some(events) = &self.events {
            events.emit_lossy(CodingEvent::JobCompleted {
                job_id: self.job_id,
                operation: self.operation.clone(),
                timestamp: Utc::now(),
            });
        }
    }
}

/// Integer percentage of `done / total`, 100 for an empty job
pub fn percent_of(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = done.min(total) * 100 / total;
    pct as u8
}

/// Result of a cancellable job
///
/// Cancellation is a normal return path, not an error. `Cancelled` carries
/// whatever was produced before the job stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "result", rename_all = "lowercase")]
pub enum JobOutcome<T> {
    Completed(T),
    Cancelled(T),
}

impl<T> JobOutcome<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobOutcome::Cancelled(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            JobOutcome::Completed(v) | JobOutcome::Cancelled(v) => v,
        }
    }

    pub fn as_inner(&self) -> &T {
        match self {
            JobOutcome::Completed(v) | JobOutcome::Cancelled(v) => v,
        }
    }

    /// The completed value, `None` when cancelled
    pub fn completed(self) -> Option<T> {
        match self {
            JobOutcome::Completed(v) => Some(v),
            JobOutcome::Cancelled(_) => None,
        }
    }
}
