//! Event system for long-running pipeline jobs
//!
//! Jobs publish progress and lifecycle events on a tokio broadcast channel.
//! Subscribers (job runners, CLI progress output) receive events emitted
//! after they subscribed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Events emitted by pipeline jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CodingEvent {
    /// Progress at a chunk/batch boundary (0..=100)
    JobProgress {
        job_id: Uuid,
        operation: String,
        percent: u8,
        timestamp: DateTime<Utc>,
    },

    /// Job stopped at a suspension point after cancellation was requested
    JobCancelled {
        job_id: Uuid,
        operation: String,
        timestamp: DateTime<Utc>,
    },

    JobCompleted {
        job_id: Uuid,
        operation: String,
        timestamp: DateTime<Utc>,
    },

    /// Cached results of a workspace were dropped after a mutation
    CacheInvalidated {
        workspace_id: i64,
        pattern: String,
        timestamp: DateTime<Utc>,
    },
}

impl CodingEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            CodingEvent::JobProgress { .. } => "JobProgress",
            CodingEvent::JobCancelled { .. } => "JobCancelled",
            CodingEvent::JobCompleted { .. } => "JobCompleted",
            CodingEvent::CacheInvalidated { .. } => "CacheInvalidated",
        }
    }
}

/// Broadcast bus for [`CodingEvent`]s
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CodingEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// Lagging subscribers lose the oldest events once `capacity` is exceeded.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CodingEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: CodingEvent,
    ) -> Result<usize, broadcast::error::SendError<CodingEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: CodingEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(CodingEvent::CacheInvalidated {
            workspace_id: 3,
            pattern: "response-analysis:3_*".to_string(),
            timestamp: Utc::now(),
        })
        .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "CacheInvalidated");
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(4);
        let event = CodingEvent::JobCompleted {
            job_id: Uuid::new_v4(),
            operation: "test".to_string(),
            timestamp: Utc::now(),
        };
        assert!(bus.emit(event.clone()).is_err());
        bus.emit_lossy(event);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.capacity(), 4);
    }

    #[test]
    fn test_serialization_tag() {
        let event = CodingEvent::JobProgress {
            job_id: Uuid::nil(),
            operation: "response analysis".to_string(),
            percent: 40,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "JobProgress");
        assert_eq!(json["percent"], 40);
    }
}
