//! Task-queue adapter
//!
//! At-least-once delivery over the workspace SQLite store: `enqueue` with
//! three-tier priority and a uniqueness window, `claim` with a bounded lease,
//! explicit `ack` after result persistence, `nack` with exponential retry
//! scheduling. Expired leases return to the queue so a dead worker's tasks
//! are re-delivered.

use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::time::Duration;
use uuid::Uuid;

/// Queue priorities, highest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePriority {
    Critical,
    High,
    Default,
}

impl QueuePriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueuePriority::Critical => "critical",
            QueuePriority::High => "high",
            QueuePriority::Default => "default",
        }
    }
}

/// Task types the engine enqueues
pub mod task_types {
    /// Re-process one chunk (payload: batch_id, chunk_index)
    pub const CLASSIFY_CHUNK: &str = "llm:classify_chunk";
    /// Run a full batch through the pipeline (payload: batch_id)
    pub const PROCESS_BATCH: &str = "batch:process";
}

/// Enqueue request
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub task_type: String,
    pub payload: serde_json::Value,
    pub queue: QueuePriority,
    pub max_retries: u32,
    /// Duplicate enqueues sharing this key are suppressed inside the window
    pub unique_key: Option<String>,
}

impl TaskSpec {
    pub fn new(task_type: &str, payload: serde_json::Value) -> Self {
        Self {
            task_type: task_type.to_string(),
            payload,
            queue: QueuePriority::Default,
            max_retries: 3,
            unique_key: None,
        }
    }

    pub fn with_queue(mut self, queue: QueuePriority) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_unique_key(mut self, key: String) -> Self {
        self.unique_key = Some(key);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// A claimed task
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub id: Uuid,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub attempts: u32,
    pub max_retries: u32,
}

/// SQLite-backed task queue
#[derive(Clone)]
pub struct TaskQueue {
    pool: SqlitePool,
    unique_window: Duration,
    claim_ttl: Duration,
    retry_delay_base: Duration,
}

impl TaskQueue {
    pub fn new(pool: SqlitePool, unique_window: Duration) -> Self {
        Self {
            pool,
            unique_window,
            claim_ttl: Duration::from_secs(300),
            retry_delay_base: Duration::from_secs(2),
        }
    }

    /// Enqueue a task; returns None when suppressed by the uniqueness window
    pub async fn enqueue(&self, spec: TaskSpec) -> Result<Option<Uuid>, sqlx::Error> {
        if let Some(key) = &spec.unique_key {
            let window_start =
                Utc::now() - ChronoDuration::from_std(self.unique_window).unwrap_or_default();
            let duplicate: Option<(i64,)> = sqlx::query_as(
                "SELECT 1 FROM task_queue
                 WHERE unique_key = ? AND created_at > ? AND status IN ('queued', 'claimed')
                 LIMIT 1",
            )
            .bind(key)
            .bind(window_start)
            .fetch_optional(&self.pool)
            .await?;
            if duplicate.is_some() {
                tracing::debug!(unique_key = %key, "Duplicate enqueue suppressed");
                return Ok(None);
            }
        }

        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO task_queue (id, queue, task_type, unique_key, payload, status, max_retries, run_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, 'queued', ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(spec.queue.as_str())
        .bind(&spec.task_type)
        .bind(&spec.unique_key)
        .bind(spec.payload.to_string())
        .bind(spec.max_retries as i64)
        .bind(Utc::now())
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        tracing::debug!(task_id = %id, task_type = %spec.task_type, queue = spec.queue.as_str(), "Task enqueued");
        Ok(Some(id))
    }

    /// Claim the next runnable task, priority then age order
    pub async fn claim(&self, worker_id: &str) -> Result<Option<QueuedTask>, sqlx::Error> {
        let now = Utc::now();
        let expires = now + ChronoDuration::from_std(self.claim_ttl).unwrap_or_default();

        let row: Option<(String, String, String, i64, i64)> = sqlx::query_as(
            r#"
            UPDATE task_queue
            SET status = 'claimed', claimed_by = ?, claim_expires_at = ?, updated_at = ?
            WHERE id = (
                SELECT id FROM task_queue
                WHERE status = 'queued' AND run_at <= ?
                ORDER BY CASE queue
                    WHEN 'critical' THEN 0
                    WHEN 'high' THEN 1
                    ELSE 2
                END, run_at
                LIMIT 1
            )
            RETURNING id, task_type, payload, attempts, max_retries
            "#,
        )
        .bind(worker_id)
        .bind(expires)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, task_type, payload, attempts, max_retries)| QueuedTask {
            id: Uuid::parse_str(&id).unwrap_or_default(),
            task_type,
            payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
            attempts: attempts as u32,
            max_retries: max_retries as u32,
        }))
    }

    /// Acknowledge successful completion; the task is gone for good
    pub async fn ack(&self, task_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM task_queue WHERE id = ?")
            .bind(task_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Report failure; reschedules with exponential delay or parks the task
    /// as dead once retries are spent
    pub async fn nack(&self, task_id: Uuid, error: &str) -> Result<(), sqlx::Error> {
        let row: Option<(i64, i64)> =
            sqlx::query_as("SELECT attempts, max_retries FROM task_queue WHERE id = ?")
                .bind(task_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        let Some((attempts, max_retries)) = row else {
            return Ok(());
        };

        let attempts = attempts + 1;
        if attempts > max_retries {
            sqlx::query(
                "UPDATE task_queue
                 SET status = 'dead', attempts = ?, last_error = ?, claimed_by = NULL,
                     claim_expires_at = NULL, updated_at = ?
                 WHERE id = ?",
            )
            .bind(attempts)
            .bind(error)
            .bind(Utc::now())
            .bind(task_id.to_string())
            .execute(&self.pool)
            .await?;
            tracing::error!(task_id = %task_id, attempts, "Task dead after retry exhaustion");
        } else {
            let delay = self.retry_delay_base * 2u32.saturating_pow(attempts as u32 - 1);
            let run_at = Utc::now() + ChronoDuration::from_std(delay).unwrap_or_default();
            sqlx::query(
                "UPDATE task_queue
                 SET status = 'queued', attempts = ?, last_error = ?, claimed_by = NULL,
                     claim_expires_at = NULL, run_at = ?, updated_at = ?
                 WHERE id = ?",
            )
            .bind(attempts)
            .bind(error)
            .bind(run_at)
            .bind(Utc::now())
            .bind(task_id.to_string())
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Return expired claims to the queue (at-least-once delivery)
    pub async fn reclaim_expired(&self) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE task_queue
             SET status = 'queued', claimed_by = NULL, claim_expires_at = NULL, updated_at = ?
             WHERE status = 'claimed' AND claim_expires_at < ?",
        )
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        let reclaimed = result.rows_affected();
        if reclaimed > 0 {
            tracing::warn!(reclaimed, "Returned expired task claims to the queue");
        }
        Ok(reclaimed)
    }

    /// Current queued depth (backpressure input)
    pub async fn depth(&self) -> Result<usize, sqlx::Error> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM task_queue WHERE status = 'queued'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count as usize)
    }
}

/// Uniqueness key for one chunk of one batch
pub fn chunk_unique_key(batch_id: Uuid, chunk_index: usize) -> String {
    format!("chunk:{}:{}", batch_id, chunk_index)
}

/// Payload for CLASSIFY_CHUNK tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkTaskPayload {
    pub batch_id: Uuid,
    pub chunk_index: usize,
}
