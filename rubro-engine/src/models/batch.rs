//! Batch lifecycle model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Batch processing states
///
/// uploaded → cleaning → llm_processing → validating → completed
/// Any pre-completed state may transition to failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Uploaded,
    Cleaning,
    LlmProcessing,
    Validating,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Uploaded => "uploaded",
            BatchStatus::Cleaning => "cleaning",
            BatchStatus::LlmProcessing => "llm_processing",
            BatchStatus::Validating => "validating",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "uploaded" => Some(BatchStatus::Uploaded),
            "cleaning" => Some(BatchStatus::Cleaning),
            "llm_processing" => Some(BatchStatus::LlmProcessing),
            "validating" => Some(BatchStatus::Validating),
            "completed" => Some(BatchStatus::Completed),
            "failed" => Some(BatchStatus::Failed),
            _ => None,
        }
    }

    /// Legal forward transitions
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        use BatchStatus::*;
        match (self, next) {
            (Uploaded, Cleaning) => true,
            (Cleaning, LlmProcessing) => true,
            (LlmProcessing, Validating) => true,
            (LlmProcessing, Completed) => true,
            (Validating, LlmProcessing) => true, // new iteration re-dispatch
            (Validating, Completed) => true,
            (Completed, _) | (Failed, _) => false,
            (_, Failed) => true,
            _ => false,
        }
    }
}

/// A processing session over one uploaded file
///
/// The file hash makes re-uploads idempotent: a byte-identical upload resolves
/// to the existing batch instead of creating a new one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: Uuid,
    pub original_filename: String,
    pub file_hash: String,
    pub status: BatchStatus,
    pub total_records: i64,
    pub processed_records: i64,
    /// Pipeline configuration snapshot (selected columns, refinery version,
    /// dedup strategy, provider and model)
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Batch {
    pub fn new(original_filename: String, file_hash: String, config: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            batch_id: Uuid::new_v4(),
            original_filename,
            file_hash,
            status: BatchStatus::Uploaded,
            total_records: 0,
            processed_records: 0,
            config,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// Completion summary reported when a batch leaves the dispatcher
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub ok: usize,
    pub repaired: usize,
    pub failed_placeholder: usize,
}
