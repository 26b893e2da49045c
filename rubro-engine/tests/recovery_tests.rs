//! Worker-loss recovery: stale checkpoints re-enqueue their remaining
//! chunks and a fresh worker finishes the batch to the same final state a
//! crash-free run would have produced.

mod helpers;

use chrono::{Duration as ChronoDuration, Utc};
use helpers::{insert_batch, records_of, test_pool, MockProvider};
use rubro_engine::checkpoint::{CheckpointManager, RecoveryMonitor};
use rubro_engine::db;
use rubro_engine::models::Record;
use rubro_engine::pipeline::PipelineConfig;
use rubro_engine::queue::TaskQueue;
use rubro_engine::refinery::{clean_records, get_refinery};
use rubro_engine::worker::Worker;
use rubro_common::events::EventBus;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Ten distinct cleaned survivor records
fn survivors() -> Vec<Record> {
    let mut records = records_of(&[
        "campana alfa",
        "campana beta",
        "campana gama",
        "campana delta",
        "campana omega",
        "renta espectacular",
        "revista digital",
        "libro mental",
        "diseno lona",
        "promo exhibidor",
    ]);
    let refinery = get_refinery("v1").unwrap();
    clean_records(&mut records, &["Descripcion".to_string()], refinery.as_ref()).unwrap();
    records
}

async fn seed_crashed_batch(pool: &SqlitePool, batch_id: Uuid, done: &[usize]) {
    let manager = CheckpointManager::new(
        pool.clone(),
        EventBus::new(16),
        "dead-worker",
        Duration::from_secs(30),
    );
    let state = serde_json::json!({
        "iteration": 1,
        "prompt_id": Uuid::new_v4(),
        "prompt_text": "Clasifica estos registros y responde JSON.",
        "fields": ["cleanDescripcion"],
        "chunk_size": 1,
        "survivors": survivors(),
    });
    manager.begin(batch_id, 10, Some(state)).await.unwrap();

    for chunk_index in done {
        manager.record_chunk(batch_id, *chunk_index, false).await.unwrap();
        // The dead worker persisted these chunks before crashing
        let row_index = *chunk_index as i64;
        sqlx::query(
            "INSERT INTO classifications (id, batch_id, row_index, original_data, cleaned_data, category, score, provider)
             VALUES (?, ?, ?, '{}', '{}', 'Pop', 0.9, 'mock')",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(batch_id.to_string())
        .bind(row_index)
        .execute(pool)
        .await
        .unwrap();
    }

    // Crash: the heartbeat goes stale
    sqlx::query("UPDATE checkpoints SET last_heartbeat = ? WHERE batch_id = ?")
        .bind(Utc::now() - ChronoDuration::seconds(600))
        .bind(batch_id.to_string())
        .execute(pool)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_orphan_recovery_completes_the_batch() {
    let pool = test_pool().await;
    let batch = insert_batch(&pool).await;
    seed_crashed_batch(&pool, batch.batch_id, &[1, 4, 7]).await;

    let queue = TaskQueue::new(pool.clone(), Duration::from_secs(60));
    let event_bus = EventBus::new(256);

    // The monitor spots the stale heartbeat and re-enqueues the rest
    let monitor = RecoveryMonitor::new(
        pool.clone(),
        queue.clone(),
        event_bus.clone(),
        Duration::from_secs(120),
        Duration::from_secs(60),
    );
    assert_eq!(monitor.scan_once().await.unwrap(), 1);
    assert_eq!(queue.depth().await.unwrap(), 7);

    // A fresh worker claims and finishes the re-enqueued chunks
    let provider = Arc::new(MockProvider::echo());
    let worker = Worker::new(
        pool.clone(),
        event_bus,
        provider,
        queue.clone(),
        "fresh-worker".to_string(),
        PipelineConfig::default(),
        Duration::from_secs(30),
    );
    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { worker.run(cancel).await }
    });

    // Wait for the queue to drain
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let depth = queue.depth().await.unwrap();
        let count = db::classifications::count_for_batch(&pool, batch.batch_id)
            .await
            .unwrap();
        if depth == 0 && count == 10 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "recovery did not finish: depth={}, classifications={}",
            depth,
            count
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    cancel.cancel();
    let _ = handle.await;

    // Final state matches a crash-free run: one classification per row,
    // all successfully categorized
    let stored = db::classifications::list_for_batch(&pool, batch.batch_id)
        .await
        .unwrap();
    assert_eq!(stored.len(), 10);
    let rows: Vec<i64> = stored.iter().map(|c| c.row_index).collect();
    assert_eq!(rows, (0..10).collect::<Vec<_>>());
    assert!(stored.iter().all(|c| c.category == "Pop"));

    // Checkpoint reflects completion and new ownership
    let manager = CheckpointManager::new(
        pool.clone(),
        EventBus::new(4),
        "probe",
        Duration::from_secs(30),
    );
    let cp = manager.load(batch.batch_id).await.unwrap().unwrap();
    assert!(cp.is_complete());
    assert_eq!(cp.worker_id, "fresh-worker");
}

#[tokio::test]
async fn test_reprocessing_done_chunk_is_a_noop() {
    let pool = test_pool().await;
    let batch = insert_batch(&pool).await;
    seed_crashed_batch(&pool, batch.batch_id, &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]).await;

    let queue = TaskQueue::new(pool.clone(), Duration::from_secs(60));
    let monitor = RecoveryMonitor::new(
        pool.clone(),
        queue.clone(),
        EventBus::new(16),
        Duration::from_secs(120),
        Duration::from_secs(60),
    );
    // Everything already terminal: checkpoint closes, nothing enqueued
    monitor.scan_once().await.unwrap();
    assert_eq!(queue.depth().await.unwrap(), 0);

    assert_eq!(
        db::classifications::count_for_batch(&pool, batch.batch_id)
            .await
            .unwrap(),
        10
    );
}
