//! Dispatch checkpoint model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-batch dispatch progress, persisted after every chunk terminal state
///
/// The heartbeat marks the owning worker as alive; a stale heartbeat turns
/// the checkpoint into an orphan eligible for recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub batch_id: Uuid,
    pub worker_id: String,
    pub total_chunks: usize,
    pub processed_chunks: Vec<usize>,
    pub failed_chunks: Vec<usize>,
    /// Opaque resumption state (prompt id, iteration number, field list)
    pub state: Option<serde_json::Value>,
    pub last_heartbeat: DateTime<Utc>,
    pub recovered_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    pub fn new(batch_id: Uuid, worker_id: &str, total_chunks: usize) -> Self {
        Self {
            batch_id,
            worker_id: worker_id.to_string(),
            total_chunks,
            processed_chunks: Vec::new(),
            failed_chunks: Vec::new(),
            state: None,
            last_heartbeat: Utc::now(),
            recovered_at: None,
        }
    }

    /// Chunk indices with no terminal state yet: {0..total} minus processed
    /// minus failed
    pub fn remaining_chunks(&self) -> Vec<usize> {
        (0..self.total_chunks)
            .filter(|i| !self.processed_chunks.contains(i) && !self.failed_chunks.contains(i))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.processed_chunks.len() + self.failed_chunks.len() >= self.total_chunks
    }
}
