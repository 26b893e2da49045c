//! End-to-end pipeline tests against the in-memory store and mock provider

mod helpers;

use helpers::{insert_batch, records_of, test_pool, MockProvider};
use rubro_engine::checkpoint::CheckpointManager;
use rubro_engine::db;
use rubro_engine::dedup::DedupStrategy;
use rubro_engine::models::{BatchStatus, Prompt, INDETERMINADO};
use rubro_engine::pipeline::{BatchPipeline, PipelineConfig};
use rubro_engine::providers::ProviderError;
use rubro_engine::queue::TaskQueue;
use rubro_common::events::EventBus;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn pipeline(
    pool: &SqlitePool,
    provider: Arc<MockProvider>,
    strategy: DedupStrategy,
    chunk_size: usize,
) -> BatchPipeline {
    let event_bus = EventBus::new(256);
    let queue = TaskQueue::new(pool.clone(), Duration::from_secs(60));
    let checkpoints = CheckpointManager::new(
        pool.clone(),
        event_bus.clone(),
        "test-worker",
        Duration::from_secs(30),
    );
    let config = PipelineConfig {
        columns: vec!["Descripcion".to_string()],
        dedup_strategy: strategy,
        chunk_size,
        ..PipelineConfig::default()
    };
    BatchPipeline::new(pool.clone(), event_bus, provider, queue, checkpoints, config)
}

fn test_prompt() -> Prompt {
    Prompt::new("gastos", "gastos-test", "Clasifica:\n{categories}", vec![])
}

fn three_way_rule() -> Arc<MockProvider> {
    Arc::new(MockProvider::with_rule(Box::new(|text| match text {
        "promo tv" => ("Pop".to_string(), 0.9),
        "revista digital" => ("Medios".to_string(), 0.8),
        "libro mental" => ("Otros".to_string(), 0.6),
        _ => ("Otros".to_string(), 0.5),
    })))
}

#[tokio::test]
async fn test_exact_match_one_to_one() {
    let pool = test_pool().await;
    let batch = insert_batch(&pool).await;
    let provider = three_way_rule();
    let p = pipeline(&pool, provider, DedupStrategy::ContentOnly, 50);

    let records = records_of(&["PROMO TV", "REVISTA DIGITAL", "LIBRO MENTAL"]);
    let report = p
        .run(&batch, records, &test_prompt(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(!report.cancelled);
    assert_eq!(report.summary.total, 3);
    assert_eq!(report.summary.ok, 3);
    assert_eq!(report.summary.failed_placeholder, 0);
    assert_eq!(report.iteration_number, 1);

    let stored = db::classifications::list_for_batch(&pool, batch.batch_id)
        .await
        .unwrap();
    assert_eq!(stored.len(), 3);
    let categories: Vec<&str> = stored.iter().map(|c| c.category.as_str()).collect();
    assert_eq!(categories, vec!["Pop", "Medios", "Otros"]);
    let rows: Vec<i64> = stored.iter().map(|c| c.row_index).collect();
    assert_eq!(rows, vec![0, 1, 2]);

    // Scores 0.9 and 0.8 clear the 0.7 accuracy bar, 0.6 does not; nothing
    // is ambiguous
    assert!((report.metrics.accuracy - 2.0 / 3.0).abs() < 1e-9);
    assert_eq!(report.metrics.ambiguity_rate, 0.0);

    let loaded = db::batches::get(&pool, batch.batch_id).await.unwrap().unwrap();
    assert_eq!(loaded.status, BatchStatus::Validating);
    assert_eq!(loaded.processed_records, 3);
}

#[tokio::test]
async fn test_undercount_repair_end_to_end() {
    let pool = test_pool().await;
    let batch = insert_batch(&pool).await;
    let provider = Arc::new(MockProvider::echo());
    // Provider answers for rows 0, 2, 4 only
    provider.push_reply(Ok(serde_json::json!({
        "results": [
            {"cleanDescripcion": "campana alfa", "category": "Pop", "score": 0.9},
            {"cleanDescripcion": "campana gama", "category": "Medios", "score": 0.8},
            {"cleanDescripcion": "campana kapa", "category": "Otros", "score": 0.6},
        ]
    })
    .to_string()));

    let p = pipeline(&pool, provider, DedupStrategy::ContentOnly, 50);
    let records = records_of(&[
        "CAMPANA ALFA",
        "CAMPANA BETA",
        "CAMPANA GAMA",
        "CAMPANA DELTA",
        "CAMPANA KAPA",
    ]);
    let report = p
        .run(&batch, records, &test_prompt(), &CancellationToken::new())
        .await
        .unwrap();

    let stored = db::classifications::list_for_batch(&pool, batch.batch_id)
        .await
        .unwrap();
    assert_eq!(stored.len(), 5);
    let categories: Vec<&str> = stored.iter().map(|c| c.category.as_str()).collect();
    assert_eq!(
        categories,
        vec!["Pop", INDETERMINADO, "Medios", INDETERMINADO, "Otros"]
    );
    assert_eq!(stored[1].score, -1.0);
    assert_eq!(stored[1].reason, "No classification returned");
    assert!(report.summary.repaired >= 2);

    // Ambiguous placeholders excluded from accuracy, counted in ambiguity
    assert!((report.metrics.ambiguity_rate - 0.4).abs() < 1e-9);
}

#[tokio::test]
async fn test_failed_chunk_becomes_placeholders() {
    let pool = test_pool().await;
    let batch = insert_batch(&pool).await;
    let provider = Arc::new(MockProvider::echo());
    // One chunk consumes the deterministic refusal; the other echoes
    provider.push_reply(Err(ProviderError::Api(400, "bad request".to_string())));

    let p = pipeline(&pool, provider, DedupStrategy::ContentOnly, 2);
    let records = records_of(&["campana alfa", "campana beta", "campana gama", "campana delta"]);
    let report = p
        .run(&batch, records, &test_prompt(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.summary.total, 4);
    assert_eq!(report.summary.failed_placeholder, 2);
    assert_eq!(report.summary.ok, 2);

    let stored = db::classifications::list_for_batch(&pool, batch.batch_id)
        .await
        .unwrap();
    assert_eq!(stored.len(), 4);
    let placeholders: Vec<&str> = stored
        .iter()
        .filter(|c| c.category == INDETERMINADO)
        .map(|c| c.reason.as_str())
        .collect();
    assert_eq!(placeholders, vec!["chunk failed", "chunk failed"]);

    // Partial completion is not failure
    let loaded = db::batches::get(&pool, batch.batch_id).await.unwrap().unwrap();
    assert_eq!(loaded.status, BatchStatus::Validating);
}

#[tokio::test]
async fn test_total_provider_loss_is_fatal() {
    let pool = test_pool().await;
    let batch = insert_batch(&pool).await;
    let provider = Arc::new(MockProvider::echo());
    provider.push_reply(Err(ProviderError::Auth("revoked".to_string())));

    let p = pipeline(&pool, provider, DedupStrategy::ContentOnly, 50);
    let records = records_of(&["campana alfa", "campana beta"]);
    let result = p
        .run(&batch, records, &test_prompt(), &CancellationToken::new())
        .await;

    assert!(result.is_err());
    let loaded = db::batches::get(&pool, batch.batch_id).await.unwrap().unwrap();
    assert_eq!(loaded.status, BatchStatus::Failed);
    assert_eq!(
        db::classifications::count_for_batch(&pool, batch.batch_id)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_cancellation_before_dispatch_writes_nothing() {
    let pool = test_pool().await;
    let batch = insert_batch(&pool).await;
    let provider = Arc::new(MockProvider::echo());
    let p = pipeline(&pool, provider.clone(), DedupStrategy::ContentOnly, 1);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let records = records_of(&["campana alfa", "campana beta", "campana gama"]);
    let report = p.run(&batch, records, &test_prompt(), &cancel).await.unwrap();

    assert!(report.cancelled);
    assert_eq!(report.summary.total, 0);
    assert_eq!(provider.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(
        db::classifications::count_for_batch(&pool, batch.batch_id)
            .await
            .unwrap(),
        0
    );

    // Checkpoint exists with no progress; the batch stays resumable
    let checkpoints = CheckpointManager::new(
        pool.clone(),
        EventBus::new(4),
        "probe",
        Duration::from_secs(30),
    );
    let cp = checkpoints.load(batch.batch_id).await.unwrap().unwrap();
    assert!(cp.processed_chunks.is_empty());
    let loaded = db::batches::get(&pool, batch.batch_id).await.unwrap().unwrap();
    assert_eq!(loaded.status, BatchStatus::LlmProcessing);
}

#[tokio::test]
async fn test_cross_batch_universal_dedup() {
    let pool = test_pool().await;
    let provider = three_way_rule();

    let first = insert_batch(&pool).await;
    let p1 = pipeline(&pool, provider.clone(), DedupStrategy::Universal, 50);
    p1.run(
        &first,
        records_of(&["PROMO TV", "REVISTA DIGITAL"]),
        &test_prompt(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let second = insert_batch(&pool).await;
    let p2 = pipeline(&pool, provider, DedupStrategy::Universal, 50);
    let report = p2
        .run(
            &second,
            records_of(&["PROMO TV", "REVISTA DIGITAL", "LIBRO MENTAL"]),
            &test_prompt(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.dedup.level2_removed, 2);
    assert_eq!(report.dedup.kept_count, 1);

    let stored = db::classifications::list_for_batch(&pool, second.batch_id)
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].category, "Otros");

    // Kept hashes from batch 1 never reappear as kept in batch 2
    let kept_twice: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM dedup_hashes d1
         JOIN dedup_hashes d2 ON d1.hash = d2.hash AND d1.batch_id != d2.batch_id
         WHERE d1.kept = 1 AND d2.kept = 1",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(kept_twice, 0);
}

#[tokio::test]
async fn test_empty_record_stream_completes_quietly() {
    let pool = test_pool().await;
    let batch = insert_batch(&pool).await;
    let provider = Arc::new(MockProvider::echo());
    let p = pipeline(&pool, provider.clone(), DedupStrategy::ContentOnly, 50);

    let report = p
        .run(&batch, Vec::new(), &test_prompt(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.summary.total, 0);
    assert_eq!(provider.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    let loaded = db::batches::get(&pool, batch.batch_id).await.unwrap().unwrap();
    assert_eq!(loaded.status, BatchStatus::Completed);
}

#[tokio::test]
async fn test_rerun_is_idempotent_per_row() {
    let pool = test_pool().await;
    let batch = insert_batch(&pool).await;
    let provider = three_way_rule();

    let records = records_of(&["PROMO TV", "REVISTA DIGITAL"]);
    let p = pipeline(&pool, provider.clone(), DedupStrategy::PreserveAll, 50);
    p.run(&batch, records.clone(), &test_prompt(), &CancellationToken::new())
        .await
        .unwrap();
    let p2 = pipeline(&pool, provider, DedupStrategy::PreserveAll, 50);
    let report = p2
        .run(&batch, records, &test_prompt(), &CancellationToken::new())
        .await
        .unwrap();

    // Second pass is iteration 2, and rows updated in place
    assert_eq!(report.iteration_number, 2);
    assert_eq!(
        db::classifications::count_for_batch(&pool, batch.batch_id)
            .await
            .unwrap(),
        2
    );
}
