//! Classification persistence
//!
//! Upserts key on `(batch_id, row_index)`: re-running a chunk after a retry
//! or a recovery updates the row in place and never duplicates it.

use crate::models::Classification;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Upsert a set of classifications in one transaction
pub async fn upsert_classifications(
    pool: &SqlitePool,
    classifications: &[Classification],
) -> Result<(), sqlx::Error> {
    if classifications.is_empty() {
        return Ok(());
    }

    let mut tx = pool.begin().await?;
    for c in classifications {
        sqlx::query(
            r#"
            INSERT INTO classifications (id, batch_id, row_index, original_data, cleaned_data,
                                         category, reason, score, provider, model, tokens_used,
                                         processing_time_ms, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(batch_id, row_index) DO UPDATE SET
                original_data = excluded.original_data,
                cleaned_data = excluded.cleaned_data,
                category = excluded.category,
                reason = excluded.reason,
                score = excluded.score,
                provider = excluded.provider,
                model = excluded.model,
                tokens_used = excluded.tokens_used,
                processing_time_ms = excluded.processing_time_ms,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(c.id.to_string())
        .bind(c.batch_id.to_string())
        .bind(c.row_index)
        .bind(serde_json::to_string(&c.original_data).unwrap_or_else(|_| "{}".to_string()))
        .bind(serde_json::to_string(&c.cleaned_data).unwrap_or_else(|_| "{}".to_string()))
        .bind(&c.category)
        .bind(&c.reason)
        .bind(c.score)
        .bind(&c.provider)
        .bind(&c.model)
        .bind(c.tokens_used)
        .bind(c.processing_time_ms)
        .bind(c.created_at)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await
}

/// All classifications of a batch, ordered by row index
pub async fn list_for_batch(
    pool: &SqlitePool,
    batch_id: Uuid,
) -> Result<Vec<Classification>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT id, batch_id, row_index, original_data, cleaned_data, category, reason, score,
                provider, model, tokens_used, processing_time_ms, created_at
         FROM classifications WHERE batch_id = ? ORDER BY row_index",
    )
    .bind(batch_id.to_string())
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(row_to_classification).collect())
}

pub async fn count_for_batch(pool: &SqlitePool, batch_id: Uuid) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM classifications WHERE batch_id = ?")
        .bind(batch_id.to_string())
        .fetch_one(pool)
        .await
}

fn row_to_classification(row: sqlx::sqlite::SqliteRow) -> Classification {
    let id: String = row.get("id");
    let batch_id: String = row.get("batch_id");
    let original: String = row.get("original_data");
    let cleaned: String = row.get("cleaned_data");
    let created_at: DateTime<Utc> = row.get("created_at");

    Classification {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        batch_id: Uuid::parse_str(&batch_id).unwrap_or_default(),
        row_index: row.get("row_index"),
        original_data: serde_json::from_str(&original).unwrap_or_default(),
        cleaned_data: serde_json::from_str(&cleaned).unwrap_or_default(),
        category: row.get("category"),
        reason: row.get("reason"),
        score: row.get("score"),
        provider: row.get("provider"),
        model: row.get("model"),
        tokens_used: row.get("tokens_used"),
        processing_time_ms: row.get("processing_time_ms"),
        created_at,
    }
}
