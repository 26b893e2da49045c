//! Orphaned-batch recovery
//!
//! Scans for checkpoints whose heartbeat went stale, re-enqueues every chunk
//! that never reached a terminal state, and stamps the checkpoint recovered.
//! The uniqueness window on the queue makes repeated scans harmless.

use super::row_to_checkpoint;
use crate::models::Checkpoint;
use crate::queue::{chunk_unique_key, task_types, ChunkTaskPayload, QueuePriority, TaskQueue, TaskSpec};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use rubro_common::events::{EventBus, RubroEvent};
use sqlx::SqlitePool;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Detects stale checkpoints and re-enqueues their remaining work
pub struct RecoveryMonitor {
    pool: SqlitePool,
    queue: TaskQueue,
    event_bus: EventBus,
    /// Heartbeats older than this mark an orphan
    orphan_after: Duration,
    /// Scan interval
    scan_interval: Duration,
}

impl RecoveryMonitor {
    pub fn new(
        pool: SqlitePool,
        queue: TaskQueue,
        event_bus: EventBus,
        orphan_after: Duration,
        scan_interval: Duration,
    ) -> Self {
        Self {
            pool,
            queue,
            event_bus,
            orphan_after,
            scan_interval,
        }
    }

    /// Run one scan; returns how many batches were recovered
    pub async fn scan_once(&self) -> Result<usize, sqlx::Error> {
        // Jitter keeps multiple monitors from stampeding the same orphans
        let jitter_ms = rand::thread_rng().gen_range(0..1000);
        let threshold = Utc::now()
            - ChronoDuration::from_std(self.orphan_after).unwrap_or_default()
            - ChronoDuration::milliseconds(jitter_ms);

        let orphans = self.find_orphans(threshold).await?;
        let mut recovered = 0usize;

        for checkpoint in orphans {
            let remaining = checkpoint.remaining_chunks();
            if remaining.is_empty() {
                // All chunks terminal; just close the checkpoint out
                self.stamp_recovered(&checkpoint).await?;
                continue;
            }

            tracing::warn!(
                batch_id = %checkpoint.batch_id,
                worker_id = %checkpoint.worker_id,
                remaining = remaining.len(),
                "Recovering orphaned batch"
            );

            let mut reenqueued = 0usize;
            for chunk_index in &remaining {
                let payload = ChunkTaskPayload {
                    batch_id: checkpoint.batch_id,
                    chunk_index: *chunk_index,
                };
                let spec = TaskSpec::new(
                    task_types::CLASSIFY_CHUNK,
                    serde_json::to_value(&payload).expect("payload serializes"),
                )
                .with_queue(QueuePriority::High)
                .with_unique_key(chunk_unique_key(checkpoint.batch_id, *chunk_index));

                if self.queue.enqueue(spec).await?.is_some() {
                    reenqueued += 1;
                }
            }

            self.stamp_recovered(&checkpoint).await?;
            self.event_bus.emit_lossy(RubroEvent::BatchRecovered {
                batch_id: checkpoint.batch_id,
                reenqueued_chunks: reenqueued,
                timestamp: Utc::now(),
            });
            recovered += 1;
        }

        Ok(recovered)
    }

    /// Spawn the periodic scanner until cancelled
    pub fn spawn(self, cancel: CancellationToken) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.scan_interval) => {}
                    _ = cancel.cancelled() => break,
                }
                match self.scan_once().await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(recovered = n, "Recovery scan re-enqueued work"),
                    Err(e) => tracing::error!(error = %e, "Recovery scan failed"),
                }
            }
        });
    }

    async fn find_orphans(
        &self,
        threshold: DateTime<Utc>,
    ) -> Result<Vec<Checkpoint>, sqlx::Error> {
        let rows: Vec<(
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
             FROM checkpoints
             WHERE last_heartbeat < ? AND recovered_at IS NULL",
        )
        .bind(threshold)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_checkpoint).collect())
    }

    async fn stamp_recovered(&self, checkpoint: &Checkpoint) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE checkpoints SET recovered_at = ? WHERE batch_id = ?")
            .bind(Utc::now())
            .bind(checkpoint.batch_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointManager;
    use rubro_common::db::init_memory_database;
    use uuid::Uuid;

    async fn setup() -> (SqlitePool, TaskQueue, CheckpointManager, Uuid) {
        let pool = init_memory_database().await.unwrap();
        let batch_id = Uuid::new_v4();
        sqlx::query("INSERT INTO batches (batch_id, original_filename, file_hash) VALUES (?, 'f.csv', ?)")
            .bind(batch_id.to_string())
            .bind(Uuid::new_v4().to_string())
            .execute(&pool)
            .await
            .unwrap();

        let queue = TaskQueue::new(pool.clone(), Duration::from_secs(60));
        let manager = CheckpointManager::new(
            pool.clone(),
            EventBus::new(16),
            "worker-1",
            Duration::from_secs(30),
        );
        (pool, queue, manager, batch_id)
    }

    fn monitor(pool: SqlitePool, queue: TaskQueue) -> RecoveryMonitor {
        RecoveryMonitor::new(
            pool,
            queue,
            EventBus::new(16),
            Duration::from_secs(120),
            Duration::from_secs(60),
        )
    }

    async fn age_heartbeat(pool: &SqlitePool, batch_id: Uuid, seconds: i64) {
        sqlx::query("UPDATE checkpoints SET last_heartbeat = ? WHERE batch_id = ?")
            .bind(Utc::now() - ChronoDuration::seconds(seconds))
            .bind(batch_id.to_string())
            .execute(pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_orphan_reenqueues_exact_remaining_set() {
        let (pool, queue, manager, batch_id) = setup().await;

        manager.begin(batch_id, 10, None).await.unwrap();
        manager.record_chunk(batch_id, 3, false).await.unwrap();
        manager.record_chunk(batch_id, 7, false).await.unwrap();
        age_heartbeat(&pool, batch_id, 600).await;

        let recovered = monitor(pool.clone(), queue.clone()).scan_once().await.unwrap();
        assert_eq!(recovered, 1);

        // Exactly the chunks without a terminal state were re-enqueued
        let mut indices = Vec::new();
        while let Some(task) = queue.claim("w2").await.unwrap() {
            let payload: ChunkTaskPayload = serde_json::from_value(task.payload).unwrap();
            assert_eq!(payload.batch_id, batch_id);
            indices.push(payload.chunk_index);
        }
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2, 4, 5, 6, 8, 9]);

        // Checkpoint stamped recovered
        let cp = manager.load(batch_id).await.unwrap().unwrap();
        assert!(cp.recovered_at.is_some());
    }

    #[tokio::test]
    async fn test_fresh_heartbeat_not_recovered() {
        let (pool, queue, manager, batch_id) = setup().await;
        manager.begin(batch_id, 4, None).await.unwrap();

        let recovered = monitor(pool, queue.clone()).scan_once().await.unwrap();
        assert_eq!(recovered, 0);
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_repeated_scans_are_idempotent_within_window() {
        let (pool, queue, manager, batch_id) = setup().await;
        manager.begin(batch_id, 3, None).await.unwrap();
        age_heartbeat(&pool, batch_id, 600).await;

        let m = monitor(pool.clone(), queue.clone());
        assert_eq!(m.scan_once().await.unwrap(), 1);

        // Second scan: checkpoint already stamped recovered, nothing new
        assert_eq!(m.scan_once().await.unwrap(), 0);
        assert_eq!(queue.depth().await.unwrap(), 3);

        // Even if the stamp were cleared, the unique window suppresses dupes
        sqlx::query("UPDATE checkpoints SET recovered_at = NULL WHERE batch_id = ?")
            .bind(batch_id.to_string())
            .execute(&pool)
            .await
            .unwrap();
        age_heartbeat(&pool, batch_id, 600).await;
        m.scan_once().await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_complete_checkpoint_closed_without_enqueue() {
        let (pool, queue, manager, batch_id) = setup().await;
        manager.begin(batch_id, 2, None).await.unwrap();
        manager.record_chunk(batch_id, 0, false).await.unwrap();
        manager.record_chunk(batch_id, 1, true).await.unwrap();
        age_heartbeat(&pool, batch_id, 600).await;

        monitor(pool.clone(), queue.clone()).scan_once().await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 0);
        let cp = manager.load(batch_id).await.unwrap().unwrap();
        assert!(cp.recovered_at.is_some());
    }
}
