//! Validation persistence
//!
//! One validation per classification, enforced by a unique index. Clients
//! may retry submissions with an idempotency key; replays resolve to the
//! original row instead of erroring.

use crate::models::Validation;
use rubro_common::Error;
use sqlx::SqlitePool;
use uuid::Uuid;

/// Record a human verdict
///
/// Returns the stored validation id. A replayed idempotency key returns the
/// existing id; a second verdict on the same classification without a key is
/// rejected.
pub async fn submit(pool: &SqlitePool, validation: &Validation) -> Result<Uuid, Error> {
    if let Some(key) = &validation.idempotency_key {
        let existing: Option<(String,)> =
            sqlx::query_as("SELECT id FROM validations WHERE idempotency_key = ?")
                .bind(key)
                .fetch_optional(pool)
                .await?;
        if let Some((id,)) = existing {
            tracing::debug!(idempotency_key = %key, "Validation replay resolved to existing row");
            return Ok(Uuid::parse_str(&id).unwrap_or_default());
        }
    }

    let result = sqlx::query(
        "INSERT INTO validations (id, batch_id, classification_id, sampling_strategy, feedback,
                                  corrected_category, notes, idempotency_key, validated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(validation.id.to_string())
    .bind(validation.batch_id.to_string())
    .bind(validation.classification_id.to_string())
    .bind(&validation.sampling_strategy)
    .bind(validation.feedback.as_str())
    .bind(&validation.corrected_category)
    .bind(&validation.notes)
    .bind(&validation.idempotency_key)
    .bind(validation.validated_at)
    .execute(pool)
    .await;

    match result {
        Ok(_) => Ok(validation.id),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(Error::InvalidInput(
            format!(
                "classification {} already validated",
                validation.classification_id
            ),
        )),
        Err(e) => Err(e.into()),
    }
}

/// Number of validations recorded for a batch
pub async fn count_for_batch(pool: &SqlitePool, batch_id: Uuid) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM validations WHERE batch_id = ?")
        .bind(batch_id.to_string())
        .fetch_one(pool)
        .await
}
