//! Typed in-process event bus (C12).
//!
//! Modeled on the teacher's event-struct idiom (type + timestamp +
//! correlation id + kind-specific payload) used for trajectory reporting,
//! re-keyed to this system's progress-event vocabulary. Delivery uses
//! `tokio::sync::broadcast` directly: its lagging-receiver semantics already
//! drop the oldest unread messages for a slow subscriber, which is exactly
//! the bounded-ring-buffer behavior spec.md §4.12 calls for.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default per-subscriber channel capacity before oldest events are dropped.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    EventIngested {
        event_id: String,
    },
    AnalysisStarted {
        event_id: String,
    },
    StageCompleted {
        event_id: String,
        stage: String,
        confidence: f64,
        tokens_used: u64,
        duration_ms: u64,
    },
    AnalysisCompleted {
        event_id: String,
        final_stage: String,
        overall_confidence: f64,
    },
    AnalysisFailed {
        event_id: String,
        reason: String,
    },
    PlanBuilt {
        event_id: String,
        action_count: usize,
        execution_mode: String,
    },
    ActionStarted {
        event_id: String,
        action_id: String,
    },
    ActionCompleted {
        event_id: String,
        action_id: String,
    },
    ActionFailed {
        event_id: String,
        action_id: String,
        reason: String,
    },
    QueueEnqueued {
        queue_item_id: String,
    },
    QueueApproved {
        queue_item_id: String,
        option: String,
    },
    QueueRejected {
        queue_item_id: String,
        reason: String,
    },
    QueueUndone {
        queue_item_id: String,
    },
    CalibrationUpdated {
        source: String,
        action_class: String,
    },
}

/// An envelope wrapping every event kind with common metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub timestamp: DateTime<Utc>,
    /// `event_id` for per-event events; otherwise a caller-supplied id
    /// tying related events together (e.g. a queue item id).
    pub correlation_id: String,
    pub kind: EventKind,
}

impl EventEnvelope {
    pub fn new(correlation_id: impl Into<String>, kind: EventKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            correlation_id: correlation_id.into(),
            kind,
        }
    }
}

/// Typed pub/sub over [`EventEnvelope`]. Cloning the bus shares the same
/// underlying channel; every clone and every subscriber observes every
/// published event (subject to the per-subscriber capacity).
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Fire-and-forget: if there are no subscribers this
    /// is a no-op, never an error.
    pub fn publish(&self, event: EventEnvelope) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to the full event stream. A slow subscriber that falls
    /// behind the channel capacity will observe `Lagged` on its next recv,
    /// after which it resumes from the oldest still-buffered event.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}
