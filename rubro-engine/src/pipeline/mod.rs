//! Batch pipeline orchestrator
//!
//! Drives one batch through the full flow: clean → dedupe → chunk →
//! dispatch → merge → persist, with checkpointing for crash recovery,
//! per-phase statistics, structured events, and cooperative cancellation.
//! Partial completion is normal; only total provider loss fails the batch.

mod statistics;

pub use statistics::{
    CleaningStats, DedupPhaseStats, DispatchStats, MergeStats, PipelineStatistics,
};

use crate::checkpoint::CheckpointManager;
use crate::db;
use crate::dedup::{Deduplicator, DedupStats, DedupStrategy, HashOptions};
use crate::dispatcher::{ChunkDispatcher, ChunkOutcome, DispatcherConfig};
use crate::error::EngineError;
use crate::iterations::IterationTracker;
use crate::llm_input::build_chunks;
use crate::merger::merge_results;
use crate::metrics::{compare, ComparisonReport, IterationMetrics};
use crate::models::{clean_column_name, Batch, BatchStatus, BatchSummary, Prompt, Record};
use crate::providers::LlmProvider;
use crate::queue::TaskQueue;
use crate::refinery::{clean_records, get_refinery};
use chrono::Utc;
use rubro_common::config::MetricsWeights;
use rubro_common::events::{EventBus, RubroEvent};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Per-batch pipeline settings, resolved from batch config and service
/// defaults before the run starts
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Source columns handed to the refinery
    pub columns: Vec<String>,
    pub refinery_version: String,
    pub dedup_strategy: DedupStrategy,
    pub hash_options: HashOptions,
    pub chunk_size: usize,
    pub dispatcher: DispatcherConfig,
    pub metrics_weights: MetricsWeights,
    /// Chunk emission pauses while queue depth exceeds this
    pub queue_high_water: usize,
    /// Emission resumes once depth falls below this
    pub queue_low_water: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            columns: Vec::new(),
            refinery_version: "v1".to_string(),
            dedup_strategy: DedupStrategy::ContentOnly,
            hash_options: HashOptions::default(),
            chunk_size: 50,
            dispatcher: DispatcherConfig::default(),
            metrics_weights: MetricsWeights::default(),
            queue_high_water: 200,
            queue_low_water: 50,
        }
    }
}

/// Everything a finished (or interrupted) run reports
#[derive(Debug)]
pub struct PipelineReport {
    pub summary: BatchSummary,
    pub dedup: DedupStats,
    pub metrics: IterationMetrics,
    pub iteration_number: i64,
    pub cancelled: bool,
}

/// The batch pipeline
pub struct BatchPipeline {
    pool: SqlitePool,
    event_bus: EventBus,
    provider: Arc<dyn LlmProvider>,
    queue: TaskQueue,
    checkpoints: CheckpointManager,
    config: PipelineConfig,
    statistics: PipelineStatistics,
}

impl BatchPipeline {
    pub fn new(
        pool: SqlitePool,
        event_bus: EventBus,
        provider: Arc<dyn LlmProvider>,
        queue: TaskQueue,
        checkpoints: CheckpointManager,
        config: PipelineConfig,
    ) -> Self {
        Self {
            pool,
            event_bus,
            provider,
            queue,
            checkpoints,
            config,
            statistics: PipelineStatistics::new(),
        }
    }

    pub fn statistics(&self) -> &PipelineStatistics {
        &self.statistics
    }

    /// Run one classification iteration over a batch's records
    ///
    /// Iteration numbering is automatic: the first run is iteration 1, a
    /// re-run with a refined prompt opens the next. On cancellation the
    /// batch keeps its checkpoint and stays in `llm_processing` so recovery
    /// or a later resume can finish it.
    pub async fn run(
        &self,
        batch: &Batch,
        mut records: Vec<Record>,
        prompt: &Prompt,
        cancel: &CancellationToken,
    ) -> Result<PipelineReport, EngineError> {
        let batch_id = batch.batch_id;
        let started = Instant::now();

        tracing::info!(
            batch_id = %batch_id,
            records = records.len(),
            provider = self.provider.provider_id(),
            "Starting pipeline run"
        );
        self.event_bus.emit_lossy(RubroEvent::BatchStarted {
            batch_id,
            total_records: records.len(),
            timestamp: Utc::now(),
        });

        // Provider access is checked once up front: losing it entirely is
        // the only fatal condition
        if let Err(e) = self.provider.validate_api_key().await {
            if !e.is_transient() {
                return self.fail_batch(batch_id, format!("provider access: {}", e)).await;
            }
            tracing::warn!(batch_id = %batch_id, error = %e, "Key validation flaky, continuing");
        }

        db::batches::update_counts(&self.pool, batch_id, records.len() as i64, 0).await?;

        // Phase 1: CLEANING
        db::batches::update_status(&self.pool, batch_id, BatchStatus::Cleaning).await?;
        let refinery = get_refinery(&self.config.refinery_version)?;
        clean_records(&mut records, &self.config.columns, refinery.as_ref())?;
        self.statistics
            .record_cleaning(records.len(), self.config.columns.len());

        // Phase 2: DEDUP
        let clean_fields: Vec<String> = self
            .config
            .columns
            .iter()
            .map(|c| clean_column_name(c))
            .collect();
        let deduplicator = Deduplicator::new(
            Some(self.pool.clone()),
            self.config.dedup_strategy,
            clean_fields.clone(),
            self.config.hash_options,
        );
        let dedup_outcome = deduplicator.dedupe(batch_id, records).await?;
        let survivors = dedup_outcome.records;
        let dedup_stats = dedup_outcome.stats;
        self.statistics.record_dedup(&dedup_stats);

        if survivors.is_empty() {
            // Everything was a duplicate; nothing to classify
            db::batches::update_status(&self.pool, batch_id, BatchStatus::Completed).await?;
            let iteration_number = self.open_iteration(batch_id, prompt).await?;
            return Ok(PipelineReport {
                summary: BatchSummary::default(),
                dedup: dedup_stats,
                metrics: IterationMetrics::compute(&[], 0),
                iteration_number,
                cancelled: false,
            });
        }

        // Phase 3: CHUNKING
        let chunks = build_chunks(batch_id, &survivors, &clean_fields, self.config.chunk_size)?;

        // Phase 4: DISPATCH
        db::batches::update_status(&self.pool, batch_id, BatchStatus::LlmProcessing).await?;
        let iteration_number = self.open_iteration(batch_id, prompt).await?;

        // The state blob carries everything a recovery worker needs to
        // rebuild and re-dispatch any chunk without the original upload
        self.checkpoints
            .begin(
                batch_id,
                chunks.len(),
                Some(serde_json::json!({
                    "iteration": iteration_number,
                    "prompt_id": prompt.id,
                    "prompt_text": prompt.compile(),
                    "fields": clean_fields,
                    "chunk_size": self.config.chunk_size,
                    "survivors": survivors,
                })),
            )
            .await?;
        let run_token = cancel.child_token();
        self.checkpoints.spawn_heartbeat(batch_id, run_token.clone());
        let recorder = self.spawn_checkpoint_recorder(batch_id, run_token.clone());

        self.wait_for_queue_headroom(cancel).await;

        let dispatcher = ChunkDispatcher::new(
            self.provider.clone(),
            prompt_model(batch),
            self.config.dispatcher.clone(),
            self.event_bus.clone(),
        );
        let summary = dispatcher
            .dispatch(&prompt.compile(), chunks.clone(), cancel)
            .await;

        run_token.cancel();
        let _ = recorder.await;

        // Reconcile the checkpoint with the final outcomes; the live
        // recorder is lossy by design and upserts make this idempotent
        for outcome in &summary.outcomes {
            match outcome {
                ChunkOutcome::Done { chunk_index, .. } => {
                    self.checkpoints.record_chunk(batch_id, *chunk_index, false).await?;
                }
                ChunkOutcome::Failed { chunk_index, .. } => {
                    self.checkpoints.record_chunk(batch_id, *chunk_index, true).await?;
                }
                ChunkOutcome::Skipped { .. } => {}
            }
        }

        self.statistics.record_dispatch(
            summary.outcomes.len(),
            summary.done_count(),
            summary.failed_count(),
            summary.skipped_count(),
            summary.total_repairs(),
            summary.total_tokens(),
        );

        // Total provider loss: nothing succeeded and nothing was skipped
        if summary.done_count() == 0 && summary.failed_count() > 0 && !summary.cancelled {
            return self
                .fail_batch(batch_id, "no chunk succeeded; provider unreachable or rejecting".to_string())
                .await;
        }

        // Phase 5: MERGE + PERSIST
        let classifications = merge_results(
            batch_id,
            &survivors,
            &chunks,
            &summary.outcomes,
            self.provider.provider_id(),
            &prompt_model(batch),
        );
        db::classifications::upsert_classifications(&self.pool, &classifications).await?;

        let failed_placeholder: usize = summary
            .outcomes
            .iter()
            .filter_map(|o| match o {
                ChunkOutcome::Failed { chunk_index, .. } => {
                    chunks.iter().find(|c| c.chunk_index == *chunk_index)
                }
                _ => None,
            })
            .map(|c| c.records.len())
            .sum();
        let repaired = summary.total_repairs();
        let batch_summary = BatchSummary {
            total: classifications.len(),
            ok: classifications
                .len()
                .saturating_sub(repaired)
                .saturating_sub(failed_placeholder),
            repaired,
            failed_placeholder,
        };
        self.statistics
            .record_merge(classifications.len(), failed_placeholder);
        db::batches::update_counts(
            &self.pool,
            batch_id,
            survivors.len() as i64,
            classifications.len() as i64,
        )
        .await?;

        let processing_ms = started.elapsed().as_millis() as u64;
        let metrics = IterationMetrics::compute(&classifications, processing_ms);
        let tracker = IterationTracker::new(self.pool.clone());
        tracker
            .record_metrics(
                batch_id,
                iteration_number,
                &serde_json::to_value(&metrics)?,
                None,
            )
            .await?;

        if summary.cancelled {
            // Keep status and checkpoint; recovery or resume finishes it
            tracing::warn!(batch_id = %batch_id, "Pipeline cancelled, leaving batch resumable");
            return Ok(PipelineReport {
                summary: batch_summary,
                dedup: dedup_stats,
                metrics,
                iteration_number,
                cancelled: true,
            });
        }

        self.checkpoints.mark_shutdown(batch_id).await?;
        db::batches::update_status(&self.pool, batch_id, BatchStatus::Validating).await?;
        self.event_bus.emit_lossy(RubroEvent::BatchCompleted {
            batch_id,
            total: batch_summary.total,
            ok: batch_summary.ok,
            repaired: batch_summary.repaired,
            failed_placeholder: batch_summary.failed_placeholder,
            timestamp: Utc::now(),
        });

        tracing::info!(
            batch_id = %batch_id,
            total = batch_summary.total,
            ok = batch_summary.ok,
            repaired = batch_summary.repaired,
            failed_placeholder = batch_summary.failed_placeholder,
            processing_ms,
            "Pipeline run finished"
        );

        Ok(PipelineReport {
            summary: batch_summary,
            dedup: dedup_stats,
            metrics,
            iteration_number,
            cancelled: false,
        })
    }

    /// Compare two stored iterations and emit the comparison event
    pub async fn compare_iterations(
        &self,
        batch_id: Uuid,
        baseline_number: i64,
        refined_number: i64,
    ) -> Result<ComparisonReport, EngineError> {
        let tracker = IterationTracker::new(self.pool.clone());
        let iterations = tracker.list(batch_id).await?;

        let metrics_of = |number: i64| -> Result<IterationMetrics, EngineError> {
            iterations
                .iter()
                .find(|i| i.iteration_number == number)
                .and_then(|i| i.metrics.clone())
                .and_then(|m| serde_json::from_value(m).ok())
                .ok_or_else(|| {
                    EngineError::DataQuality(format!(
                        "iteration {} of batch {} has no metrics",
                        number, batch_id
                    ))
                })
        };

        let baseline = metrics_of(baseline_number)?;
        let refined = metrics_of(refined_number)?;
        let report = compare(&baseline, &refined, &self.config.metrics_weights);

        tracker
            .record_metrics(
                batch_id,
                refined_number,
                &serde_json::to_value(&refined)?,
                Some(report.accuracy_delta),
            )
            .await?;

        self.event_bus.emit_lossy(RubroEvent::IterationCompared {
            batch_id,
            baseline_iteration: baseline_number as u32,
            refined_iteration: refined_number as u32,
            accuracy_delta: report.accuracy_delta,
            ambiguity_delta: report.ambiguity_delta,
            timestamp: Utc::now(),
        });

        Ok(report)
    }

    async fn open_iteration(&self, batch_id: Uuid, prompt: &Prompt) -> Result<i64, EngineError> {
        let tracker = IterationTracker::new(self.pool.clone());
        let iteration = tracker
            .begin_iteration(batch_id, Some(prompt.id), "")
            .await?;
        Ok(iteration.iteration_number)
    }

    /// Pause chunk emission while the queue is saturated
    ///
    /// Emission stops above the high-water mark and resumes only once depth
    /// falls below the low-water mark. A broken depth probe never stalls the
    /// batch.
    async fn wait_for_queue_headroom(&self, cancel: &CancellationToken) {
        let depth = match self.queue.depth().await {
            Ok(depth) => depth,
            Err(e) => {
                tracing::warn!(error = %e, "Queue depth probe failed");
                return;
            }
        };
        if depth <= self.config.queue_high_water {
            return;
        }

        tracing::warn!(
            depth,
            high_water = self.config.queue_high_water,
            "Queue above high-water mark, pausing chunk emission"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                _ = cancel.cancelled() => return,
            }
            match self.queue.depth().await {
                Ok(depth) if depth < self.config.queue_low_water => return,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Queue depth probe failed");
                    return;
                }
            }
        }
    }

    /// Bridge chunk events into checkpoint writes while dispatch runs
    fn spawn_checkpoint_recorder(
        &self,
        batch_id: Uuid,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let mut events = self.event_bus.subscribe();
        let checkpoints = CheckpointManager::new(
            self.pool.clone(),
            self.event_bus.clone(),
            self.checkpoints.worker_id(),
            Duration::from_secs(30),
        );
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = events.recv() => match received {
                        Ok(RubroEvent::ChunkCompleted { batch_id: b, chunk_index, .. }) if b == batch_id => {
                            if let Err(e) = checkpoints.record_chunk(batch_id, chunk_index, false).await {
                                tracing::warn!(error = %e, chunk_index, "Checkpoint write failed");
                            }
                        }
                        Ok(RubroEvent::ChunkFailed { batch_id: b, chunk_index, .. }) if b == batch_id => {
                            if let Err(e) = checkpoints.record_chunk(batch_id, chunk_index, true).await {
                                tracing::warn!(error = %e, chunk_index, "Checkpoint write failed");
                            }
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "Checkpoint recorder lagged; reconciliation will catch up");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }

    async fn fail_batch(
        &self,
        batch_id: Uuid,
        reason: String,
    ) -> Result<PipelineReport, EngineError> {
        tracing::error!(batch_id = %batch_id, reason = %reason, "Batch failed");
        db::batches::update_status(&self.pool, batch_id, BatchStatus::Failed).await?;
        self.event_bus.emit_lossy(RubroEvent::BatchFailed {
            batch_id,
            reason: reason.clone(),
            timestamp: Utc::now(),
        });
        Err(EngineError::Fatal(reason))
    }
}

/// Model name recorded on classifications, resolved from batch config
fn prompt_model(batch: &Batch) -> String {
    batch
        .config
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or("gpt-4o-mini")
        .to_string()
}
