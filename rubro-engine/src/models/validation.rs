//! Human validation model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Human verdict on a classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feedback {
    Correct,
    Incorrect,
    Uncertain,
}

impl Feedback {
    pub fn as_str(&self) -> &'static str {
        match self {
            Feedback::Correct => "correct",
            Feedback::Incorrect => "incorrect",
            Feedback::Uncertain => "uncertain",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "correct" => Some(Feedback::Correct),
            "incorrect" => Some(Feedback::Incorrect),
            "uncertain" => Some(Feedback::Uncertain),
            _ => None,
        }
    }
}

/// One human verdict on one classification
///
/// Unique per classification; the optional idempotency key lets clients
/// retry submissions without double-recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Validation {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub classification_id: Uuid,
    /// Which sampler produced the row the human saw
    pub sampling_strategy: String,
    pub feedback: Feedback,
    pub corrected_category: Option<String>,
    pub notes: Option<String>,
    pub idempotency_key: Option<String>,
    pub validated_at: DateTime<Utc>,
}

impl Validation {
    pub fn new(
        batch_id: Uuid,
        classification_id: Uuid,
        feedback: Feedback,
        sampling_strategy: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            batch_id,
            classification_id,
            sampling_strategy: sampling_strategy.to_string(),
            feedback,
            corrected_category: None,
            notes: None,
            idempotency_key: None,
            validated_at: Utc::now(),
        }
    }
}
