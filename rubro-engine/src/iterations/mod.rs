//! Iteration tracking
//!
//! Accumulates human validations across refinement iterations. The tracker
//! answers two questions: which iteration is current, and which rows have
//! already been validated (so new samples exclude them).

use crate::models::{Feedback, Iteration};
use crate::refinement::ValidatedExample;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::collections::HashSet;
use uuid::Uuid;

/// Iteration bookkeeping over the shared store
pub struct IterationTracker {
    pool: SqlitePool,
}

impl IterationTracker {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Highest iteration number recorded for the batch (0 when none)
    pub async fn current_iteration(&self, batch_id: Uuid) -> Result<i64, sqlx::Error> {
        let max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(iteration_number) FROM iterations WHERE batch_id = ?",
        )
        .bind(batch_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(max.unwrap_or(0))
    }

    /// Open the next iteration; number 1 is the implicit first dispatch
    pub async fn begin_iteration(
        &self,
        batch_id: Uuid,
        prompt_id: Option<Uuid>,
        prompt_changes: &str,
    ) -> Result<Iteration, sqlx::Error> {
        let number = self.current_iteration(batch_id).await? + 1;
        let mut iteration = Iteration::new(batch_id, number, prompt_id);
        iteration.prompt_changes = prompt_changes.to_string();

        sqlx::query(
            "INSERT INTO iterations (id, batch_id, iteration_number, prompt_id, prompt_changes, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(iteration.id.to_string())
        .bind(batch_id.to_string())
        .bind(number)
        .bind(prompt_id.map(|p| p.to_string()))
        .bind(&iteration.prompt_changes)
        .bind(iteration.created_at)
        .execute(&self.pool)
        .await?;

        Ok(iteration)
    }

    /// Attach the finished iteration's metrics snapshot
    pub async fn record_metrics(
        &self,
        batch_id: Uuid,
        iteration_number: i64,
        metrics: &serde_json::Value,
        accuracy_delta: Option<f64>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE iterations SET metrics = ?, accuracy_delta = ?
             WHERE batch_id = ? AND iteration_number = ?",
        )
        .bind(metrics.to_string())
        .bind(accuracy_delta)
        .bind(batch_id.to_string())
        .bind(iteration_number)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Row indices already validated in any iteration of this batch
    ///
    /// This is the exclude set the samplers honor: a human never sees the
    /// same row twice across iterations.
    pub async fn validated_row_indices(
        &self,
        batch_id: Uuid,
    ) -> Result<HashSet<i64>, sqlx::Error> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT c.row_index
             FROM validations v
             JOIN classifications c ON c.id = v.classification_id
             WHERE v.batch_id = ?",
        )
        .bind(batch_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(i,)| i).collect())
    }

    /// Accumulated validated examples for prompt refinement
    ///
    /// Uncertain feedback teaches nothing and is filtered out.
    pub async fn validated_examples(
        &self,
        batch_id: Uuid,
        primary_field: &str,
    ) -> Result<Vec<ValidatedExample>, sqlx::Error> {
        let rows: Vec<(String, String, String, Option<String>)> = sqlx::query_as(
            "SELECT c.cleaned_data, c.category, v.feedback, v.corrected_category
             FROM validations v
             JOIN classifications c ON c.id = v.classification_id
             WHERE v.batch_id = ?
             ORDER BY c.row_index",
        )
        .bind(batch_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut examples = Vec::new();
        for (cleaned_json, category, feedback, corrected) in rows {
            let Some(feedback) = Feedback::parse(&feedback) else {
                continue;
            };
            if feedback == Feedback::Uncertain {
                continue;
            }
            let cleaned: serde_json::Value =
                serde_json::from_str(&cleaned_json).unwrap_or(serde_json::Value::Null);
            let text = cleaned
                .get(primary_field)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            if text.is_empty() {
                continue;
            }
            examples.push(ValidatedExample {
                text,
                predicted_category: category,
                corrected_category: corrected,
                feedback,
            });
        }
        Ok(examples)
    }

    /// Iterations of a batch, oldest first
    pub async fn list(&self, batch_id: Uuid) -> Result<Vec<Iteration>, sqlx::Error> {
        let rows: Vec<(
            String,
            String,
            i64,
            Option<String>,
            String,
            Option<String>,
            Option<f64>,
            DateTime<Utc>,
        )> = sqlx::query_as(
            "SELECT id, batch_id, iteration_number, prompt_id, prompt_changes, metrics,
                    accuracy_delta, created_at
             FROM iterations WHERE batch_id = ? ORDER BY iteration_number",
        )
        .bind(batch_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| Iteration {
                id: Uuid::parse_str(&row.0).unwrap_or_default(),
                batch_id: Uuid::parse_str(&row.1).unwrap_or_default(),
                iteration_number: row.2,
                prompt_id: row.3.and_then(|p| Uuid::parse_str(&p).ok()),
                prompt_changes: row.4,
                metrics: row.5.and_then(|m| serde_json::from_str(&m).ok()),
                accuracy_delta: row.6,
                created_at: row.7,
            })
            .collect())
    }
}
