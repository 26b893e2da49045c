//! Classification result model

use super::record::FieldValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Sentinel category for records the model could not place
pub const INDETERMINADO: &str = "Indeterminado";

/// Sentinel score marking an ambiguous/unclassifiable record; excluded from
/// accuracy statistics, counted in the ambiguity rate
pub const AMBIGUOUS_SCORE: f64 = -1.0;

/// One LLM verdict for one surviving record
///
/// `(batch_id, row_index)` is unique; re-running a chunk updates in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub row_index: i64,
    pub original_data: BTreeMap<String, FieldValue>,
    pub cleaned_data: BTreeMap<String, FieldValue>,
    pub category: String,
    pub reason: String,
    /// Confidence in [-1, 1]; -1 is the ambiguity sentinel
    pub score: f64,
    pub provider: String,
    pub model: String,
    pub tokens_used: i64,
    pub processing_time_ms: i64,
    pub created_at: DateTime<Utc>,
}

impl Classification {
    pub fn is_ambiguous(&self) -> bool {
        self.score == AMBIGUOUS_SCORE
    }

    /// Placeholder for a record no provider result could be aligned to
    pub fn placeholder(
        batch_id: Uuid,
        row_index: i64,
        original_data: BTreeMap<String, FieldValue>,
        cleaned_data: BTreeMap<String, FieldValue>,
        reason: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            batch_id,
            row_index,
            original_data,
            cleaned_data,
            category: INDETERMINADO.to_string(),
            reason: reason.to_string(),
            score: AMBIGUOUS_SCORE,
            provider: String::new(),
            model: String::new(),
            tokens_used: 0,
            processing_time_ms: 0,
            created_at: Utc::now(),
        }
    }
}
