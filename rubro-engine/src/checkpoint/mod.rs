//! Checkpointed execution
//!
//! A checkpoint records which chunks of a batch have reached a terminal
//! state, owned by exactly one worker whose liveness is proven by heartbeats.
//! If the worker dies between chunk completion and batch completion, the
//! recovery monitor finds the stale heartbeat and re-enqueues the remaining
//! chunks; classification upserts make the reprocessing idempotent.

mod recovery;

pub use recovery::RecoveryMonitor;

use crate::models::Checkpoint;
use chrono::{DateTime, Utc};
use rubro_common::events::{EventBus, RubroEvent};
use sqlx::SqlitePool;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Persists and refreshes one batch's checkpoint
///
/// Single writer per batch: only the owning worker updates the row until a
/// recovery transfers ownership.
pub struct CheckpointManager {
    pool: SqlitePool,
    event_bus: EventBus,
    worker_id: String,
    heartbeat_interval: Duration,
}

impl CheckpointManager {
    pub fn new(
        pool: SqlitePool,
        event_bus: EventBus,
        worker_id: &str,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            pool,
            event_bus,
            worker_id: worker_id.to_string(),
            heartbeat_interval,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Create (or take over) the checkpoint as dispatch begins
    pub async fn begin(
        &self,
        batch_id: Uuid,
        total_chunks: usize,
        state: Option<serde_json::Value>,
    ) -> Result<Checkpoint, sqlx::Error> {
        let checkpoint = Checkpoint {
            batch_id,
            worker_id: self.worker_id.clone(),
            total_chunks,
            processed_chunks: Vec::new(),
            failed_chunks: Vec::new(),
            state,
            last_heartbeat: Utc::now(),
            recovered_at: None,
        };

        // A fresh dispatch resets progress; recovery reuses the existing row
        // through take_ownership instead
        sqlx::query(
            r#"
            INSERT INTO checkpoints (batch_id, worker_id, total_chunks, processed_chunks, failed_chunks, state, last_heartbeat)
            VALUES (?, ?, ?, '[]', '[]', ?, ?)
            ON CONFLICT(batch_id) DO UPDATE SET
                worker_id = excluded.worker_id,
                total_chunks = excluded.total_chunks,
                processed_chunks = '[]',
                failed_chunks = '[]',
                state = excluded.state,
                last_heartbeat = excluded.last_heartbeat,
                recovered_at = NULL
            "#,
        )
        .bind(batch_id.to_string())
        .bind(&self.worker_id)
        .bind(total_chunks as i64)
        .bind(checkpoint.state.as_ref().map(|s| s.to_string()))
        .bind(checkpoint.last_heartbeat)
        .execute(&self.pool)
        .await?;

        self.load(batch_id)
            .await
            .map(|cp| cp.expect("checkpoint row just written"))
    }

    /// Record one chunk's terminal state, transactionally
    pub async fn record_chunk(
        &self,
        batch_id: Uuid,
        chunk_index: usize,
        failed: bool,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(String, String, i64)> = sqlx::query_as(
            "SELECT processed_chunks, failed_chunks, total_chunks FROM checkpoints WHERE batch_id = ?",
        )
        .bind(batch_id.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        let Some((processed_json, failed_json, total)) = row else {
            tracing::warn!(batch_id = %batch_id, "No checkpoint to update");
            return Ok(());
        };

        let mut processed: Vec<usize> = serde_json::from_str(&processed_json).unwrap_or_default();
        let mut failed_list: Vec<usize> = serde_json::from_str(&failed_json).unwrap_or_default();

        let target = if failed { &mut failed_list } else { &mut processed };
        if !target.contains(&chunk_index) {
            target.push(chunk_index);
            target.sort_unstable();
        }

        sqlx::query(
            "UPDATE checkpoints
             SET processed_chunks = ?, failed_chunks = ?, last_heartbeat = ?
             WHERE batch_id = ?",
        )
        .bind(serde_json::to_string(&processed).expect("usize list serializes"))
        .bind(serde_json::to_string(&failed_list).expect("usize list serializes"))
        .bind(Utc::now())
        .bind(batch_id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.event_bus.emit_lossy(RubroEvent::BatchCheckpointed {
            batch_id,
            processed_chunks: processed.len(),
            failed_chunks: failed_list.len(),
            total_chunks: total as usize,
            timestamp: Utc::now(),
        });

        Ok(())
    }

    /// Transfer ownership of an orphaned checkpoint to this worker
    ///
    /// Keeps recorded progress; the previous owner's heartbeat already
    /// expired, so its writes have ceased.
    pub async fn take_ownership(&self, batch_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE checkpoints SET worker_id = ?, last_heartbeat = ? WHERE batch_id = ?",
        )
        .bind(&self.worker_id)
        .bind(Utc::now())
        .bind(batch_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Refresh the heartbeat immediately
    pub async fn heartbeat(&self, batch_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE checkpoints SET last_heartbeat = ? WHERE batch_id = ? AND worker_id = ?",
        )
        .bind(Utc::now())
        .bind(batch_id.to_string())
        .bind(&self.worker_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Spawn a background task refreshing the heartbeat until cancelled
    pub fn spawn_heartbeat(&self, batch_id: Uuid, cancel: CancellationToken) {
        let pool = self.pool.clone();
        let worker_id = self.worker_id.clone();
        let interval = self.heartbeat_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel.cancelled() => break,
                }
                let result = sqlx::query(
                    "UPDATE checkpoints SET last_heartbeat = ? WHERE batch_id = ? AND worker_id = ?",
                )
                .bind(Utc::now())
                .bind(batch_id.to_string())
                .bind(&worker_id)
                .execute(&pool)
                .await;
                if let Err(e) = result {
                    tracing::warn!(batch_id = %batch_id, error = %e, "Heartbeat write failed");
                }
            }
        });
    }

    /// Mark a clean shutdown so the monitor never treats this batch as an
    /// orphan
    pub async fn mark_shutdown(&self, batch_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE checkpoints SET recovered_at = ? WHERE batch_id = ?")
            .bind(Utc::now())
            .bind(batch_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Load a batch's checkpoint
    pub async fn load(&self, batch_id: Uuid) -> Result<Option<Checkpoint>, sqlx::Error> {
        load_checkpoint(&self.pool, batch_id).await
    }
}

/// Load a checkpoint row (shared with the recovery monitor)
pub(crate) async fn load_checkpoint(
    pool: &SqlitePool,
    batch_id: Uuid,
) -> Result<Option<Checkpoint>, sqlx::Error> {
    let row: Option<(
        String,
        String,
        i64,
        String,
        String,
        Option<String>,
        DateTime<Utc>,
        Option<DateTime<Utc>>,
    )> = sqlx::query_as(
        "SELECT batch_id, worker_id, total_chunks, processed_chunks, failed_chunks, state,
                last_heartbeat, recovered_at
         FROM checkpoints WHERE batch_id = ?",
    )
    .bind(batch_id.to_string())
    .fetch_optional(pool)
    .await?;

    Ok(row.map(row_to_checkpoint))
}

pub(crate) fn row_to_checkpoint(
    row: (
        String,
        String,
        i64,
        String,
        String,
        Option<String>,
        DateTime<Utc>,
        Option<DateTime<Utc>>,
    ),
) -> Checkpoint {
    Checkpoint {
        batch_id: Uuid::parse_str(&row.0).unwrap_or_default(),
        worker_id: row.1,
        total_chunks: row.2 as usize,
        processed_chunks: serde_json::from_str(&row.3).unwrap_or_default(),
        failed_chunks: serde_json::from_str(&row.4).unwrap_or_default(),
        state: row.5.and_then(|s| serde_json::from_str(&s).ok()),
        last_heartbeat: row.6,
        recovered_at: row.7,
    }
}
