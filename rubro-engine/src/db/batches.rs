//! Batch persistence

use crate::models::{Batch, BatchStatus};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Insert a batch, idempotently on the file hash
///
/// A byte-identical re-upload resolves to the existing batch; the returned
/// flag says whether the row was created.
pub async fn create_batch(pool: &SqlitePool, batch: &Batch) -> Result<(Batch, bool), sqlx::Error> {
    if let Some(existing) = get_by_file_hash(pool, &batch.file_hash).await? {
        tracing::info!(
            batch_id = %existing.batch_id,
            file_hash = %batch.file_hash,
            "Re-upload matched existing batch"
        );
        return Ok((existing, false));
    }

    sqlx::query(
        "INSERT INTO batches (batch_id, original_filename, file_hash, status, total_records,
                              processed_records, config, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(batch.batch_id.to_string())
    .bind(&batch.original_filename)
    .bind(&batch.file_hash)
    .bind(batch.status.as_str())
    .bind(batch.total_records)
    .bind(batch.processed_records)
    .bind(batch.config.to_string())
    .bind(batch.created_at)
    .bind(batch.updated_at)
    .execute(pool)
    .await?;

    Ok((batch.clone(), true))
}

/// Move a batch to a new status
pub async fn update_status(
    pool: &SqlitePool,
    batch_id: Uuid,
    status: BatchStatus,
) -> Result<(), sqlx::Error> {
    let completed_at = matches!(status, BatchStatus::Completed | BatchStatus::Failed)
        .then(Utc::now);
    sqlx::query(
        "UPDATE batches SET status = ?, completed_at = COALESCE(?, completed_at), updated_at = ?
         WHERE batch_id = ?",
    )
    .bind(status.as_str())
    .bind(completed_at)
    .bind(Utc::now())
    .bind(batch_id.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

/// Refresh record counters
pub async fn update_counts(
    pool: &SqlitePool,
    batch_id: Uuid,
    total_records: i64,
    processed_records: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE batches SET total_records = ?, processed_records = ?, updated_at = ?
         WHERE batch_id = ?",
    )
    .bind(total_records)
    .bind(processed_records)
    .bind(Utc::now())
    .bind(batch_id.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get(pool: &SqlitePool, batch_id: Uuid) -> Result<Option<Batch>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT batch_id, original_filename, file_hash, status, total_records, processed_records,
                config, created_at, updated_at, completed_at
         FROM batches WHERE batch_id = ?",
    )
    .bind(batch_id.to_string())
    .fetch_optional(pool)
    .await?;
    row.map(row_to_batch).transpose()
}

pub async fn get_by_file_hash(
    pool: &SqlitePool,
    file_hash: &str,
) -> Result<Option<Batch>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT batch_id, original_filename, file_hash, status, total_records, processed_records,
                config, created_at, updated_at, completed_at
         FROM batches WHERE file_hash = ?",
    )
    .bind(file_hash)
    .fetch_optional(pool)
    .await?;
    row.map(row_to_batch).transpose()
}

/// Delete a batch; classifications, validations, iterations, and dedup
/// hashes cascade with it
pub async fn delete(pool: &SqlitePool, batch_id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM batches WHERE batch_id = ?")
        .bind(batch_id.to_string())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

fn row_to_batch(row: sqlx::sqlite::SqliteRow) -> Result<Batch, sqlx::Error> {
    let batch_id: String = row.get("batch_id");
    let status: String = row.get("status");
    let config: Option<String> = row.get("config");
    let created_at: DateTime<Utc> = row.get("created_at");
    let updated_at: DateTime<Utc> = row.get("updated_at");
    let completed_at: Option<DateTime<Utc>> = row.get("completed_at");

    Ok(Batch {
        batch_id: Uuid::parse_str(&batch_id).unwrap_or_default(),
        original_filename: row.get("original_filename"),
        file_hash: row.get("file_hash"),
        status: BatchStatus::parse(&status).unwrap_or(BatchStatus::Failed),
        total_records: row.get("total_records"),
        processed_records: row.get("processed_records"),
        config: config
            .and_then(|c| serde_json::from_str(&c).ok())
            .unwrap_or(serde_json::Value::Null),
        created_at,
        updated_at,
        completed_at,
    })
}
