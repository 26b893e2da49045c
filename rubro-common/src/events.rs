//! Event types for the rubro event system
//!
//! Provides the shared event definitions and the EventBus used by the
//! pipeline kernel to broadcast progress. External collectors subscribe; the
//! kernel never waits on them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Structured pipeline events
///
/// Every event carries the batch it belongs to and a timestamp. Events are
/// broadcast via [`EventBus`] and can be serialized for external transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RubroEvent {
    /// A batch entered the pipeline
    BatchStarted {
        batch_id: Uuid,
        total_records: usize,
        timestamp: DateTime<Utc>,
    },

    /// A chunk was handed to the provider
    ChunkDispatched {
        batch_id: Uuid,
        chunk_index: usize,
        record_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// A chunk reached its terminal DONE state
    ChunkCompleted {
        batch_id: Uuid,
        chunk_index: usize,
        record_count: usize,
        tokens_used: u64,
        processing_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A chunk response needed count-mismatch or field-name repair
    ChunkRepaired {
        batch_id: Uuid,
        chunk_index: usize,
        repair_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// A chunk exhausted its retry budget
    ChunkFailed {
        batch_id: Uuid,
        chunk_index: usize,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// The batch checkpoint was persisted
    BatchCheckpointed {
        batch_id: Uuid,
        processed_chunks: usize,
        failed_chunks: usize,
        total_chunks: usize,
        timestamp: DateTime<Utc>,
    },

    /// An orphaned batch was picked up and its remaining chunks re-enqueued
    BatchRecovered {
        batch_id: Uuid,
        reenqueued_chunks: usize,
        timestamp: DateTime<Utc>,
    },

    /// A batch finished (possibly with failed-chunk placeholders)
    BatchCompleted {
        batch_id: Uuid,
        total: usize,
        ok: usize,
        repaired: usize,
        failed_placeholder: usize,
        timestamp: DateTime<Utc>,
    },

    /// A batch aborted on a fatal error
    BatchFailed {
        batch_id: Uuid,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Baseline and refined iterations were compared
    IterationCompared {
        batch_id: Uuid,
        baseline_iteration: u32,
        refined_iteration: u32,
        accuracy_delta: f64,
        ambiguity_delta: f64,
        timestamp: DateTime<Utc>,
    },
}

impl RubroEvent {
    /// Batch the event belongs to
    pub fn batch_id(&self) -> Uuid {
        match self {
            RubroEvent::BatchStarted { batch_id, .. }
            | RubroEvent::ChunkDispatched { batch_id, .. }
            | RubroEvent::ChunkCompleted { batch_id, .. }
            | RubroEvent::ChunkRepaired { batch_id, .. }
            | RubroEvent::ChunkFailed { batch_id, .. }
            | RubroEvent::BatchCheckpointed { batch_id, .. }
            | RubroEvent::BatchRecovered { batch_id, .. }
            | RubroEvent::BatchCompleted { batch_id, .. }
            | RubroEvent::BatchFailed { batch_id, .. }
            | RubroEvent::IterationCompared { batch_id, .. } => *batch_id,
        }
    }
}

/// Central event distribution bus
///
/// Wraps `tokio::broadcast`: non-blocking publish, multiple concurrent
/// subscribers, automatic cleanup when subscribers drop. Slow subscribers lag
/// and lose old events rather than blocking producers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RubroEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<RubroEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring the no-subscriber case
    ///
    /// Pipeline progress is advisory; nothing in the kernel depends on a
    /// listener being attached.
    pub fn emit_lossy(&self, event: RubroEvent) {
        let _ = self.tx.send(event);
    }

    /// Current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let batch_id = Uuid::new_v4();
        bus.emit_lossy(RubroEvent::ChunkDispatched {
            batch_id,
            chunk_index: 0,
            record_count: 50,
            timestamp: Utc::now(),
        });

        match rx.recv().await.unwrap() {
            RubroEvent::ChunkDispatched {
                batch_id: got,
                chunk_index,
                ..
            } => {
                assert_eq!(got, batch_id);
                assert_eq!(chunk_index, 0);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_lossy() {
        let bus = EventBus::new(4);
        bus.emit_lossy(RubroEvent::BatchFailed {
            batch_id: Uuid::new_v4(),
            reason: "no provider".to_string(),
            timestamp: Utc::now(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = RubroEvent::ChunkRepaired {
            batch_id: Uuid::new_v4(),
            chunk_index: 3,
            repair_count: 2,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"ChunkRepaired\""));
        assert!(json.contains("\"repair_count\":2"));
    }
}
