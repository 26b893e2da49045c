//! Refinement iteration model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One full classification pass over a batch's survivors
///
/// Iteration 1 is implicit on the first successful dispatch; later iterations
/// are created when a refined prompt triggers re-classification. Numbers are
/// unique per batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iteration {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub iteration_number: i64,
    pub prompt_id: Option<Uuid>,
    /// Human-readable summary of what changed versus the previous prompt
    pub prompt_changes: String,
    /// Metrics snapshot captured when the iteration finished
    pub metrics: Option<serde_json::Value>,
    pub accuracy_delta: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl Iteration {
    pub fn new(batch_id: Uuid, iteration_number: i64, prompt_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            batch_id,
            iteration_number,
            prompt_id,
            prompt_changes: String::new(),
            metrics: None,
            accuracy_delta: None,
            created_at: Utc::now(),
        }
    }
}
