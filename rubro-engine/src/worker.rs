//! Queue worker
//!
//! Claims tasks and executes them: full batch runs arrive as parsed record
//! payloads (the upstream parser boundary), and single-chunk re-processing
//! tasks arrive from the recovery monitor. Chunk re-processing rebuilds its
//! input from the checkpoint state blob, so no upload access is needed.

use crate::checkpoint::CheckpointManager;
use crate::db;
use crate::dispatcher::{ChunkDispatcher, ChunkOutcome};
use crate::error::EngineError;
use crate::llm_input::build_chunks;
use crate::merger::merge_results;
use crate::models::{Batch, Prompt, Record};
use crate::pipeline::{BatchPipeline, PipelineConfig};
use crate::providers::LlmProvider;
use crate::queue::{task_types, ChunkTaskPayload, QueuedTask, TaskQueue};
use rubro_common::events::EventBus;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Payload of a PROCESS_BATCH task: the parsed record stream plus the batch
/// configuration resolved at upload time
#[derive(Debug, Serialize, Deserialize)]
pub struct BatchTaskPayload {
    pub batch_id: Uuid,
    pub prompt_label: String,
    pub records: Vec<Record>,
}

/// Shape of the checkpoint state blob written at dispatch begin
#[derive(Debug, Deserialize)]
struct CheckpointState {
    prompt_text: String,
    fields: Vec<String>,
    chunk_size: usize,
    survivors: Vec<Record>,
}

/// One queue worker
pub struct Worker {
    pool: SqlitePool,
    event_bus: EventBus,
    provider: Arc<dyn LlmProvider>,
    queue: TaskQueue,
    worker_id: String,
    pipeline_config: PipelineConfig,
    heartbeat_interval: Duration,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        event_bus: EventBus,
        provider: Arc<dyn LlmProvider>,
        queue: TaskQueue,
        worker_id: String,
        pipeline_config: PipelineConfig,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            pool,
            event_bus,
            provider,
            queue,
            worker_id,
            pipeline_config,
            heartbeat_interval,
        }
    }

    /// Claim-and-process loop; returns on cancellation
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(worker_id = %self.worker_id, "Worker loop started");
        loop {
            if cancel.is_cancelled() {
                break;
            }

            if let Err(e) = self.queue.reclaim_expired().await {
                tracing::warn!(error = %e, "Reclaim pass failed");
            }

            let task = match self.queue.claim(&self.worker_id).await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                        _ = cancel.cancelled() => break,
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Claim failed");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
                        _ = cancel.cancelled() => break,
                    }
                }
            };

            let task_id = task.id;
            match self.process(task, &cancel).await {
                Ok(()) => {
                    if let Err(e) = self.queue.ack(task_id).await {
                        tracing::error!(task_id = %task_id, error = %e, "Ack failed");
                    }
                }
                Err(e) => {
                    tracing::error!(task_id = %task_id, error = %e, "Task failed");
                    if let Err(nack_err) = self.queue.nack(task_id, &e.to_string()).await {
                        tracing::error!(task_id = %task_id, error = %nack_err, "Nack failed");
                    }
                }
            }
        }
        tracing::info!(worker_id = %self.worker_id, "Worker loop stopped");
    }

    async fn process(&self, task: QueuedTask, cancel: &CancellationToken) -> Result<(), EngineError> {
        match task.task_type.as_str() {
            task_types::PROCESS_BATCH => {
                let payload: BatchTaskPayload = serde_json::from_value(task.payload)?;
                self.process_batch(payload, cancel).await
            }
            task_types::CLASSIFY_CHUNK => {
                let payload: ChunkTaskPayload = serde_json::from_value(task.payload)?;
                self.process_chunk(payload).await
            }
            other => Err(EngineError::DataQuality(format!(
                "unknown task type: {}",
                other
            ))),
        }
    }

    async fn process_batch(
        &self,
        payload: BatchTaskPayload,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let batch = db::batches::get(&self.pool, payload.batch_id)
            .await?
            .ok_or_else(|| {
                EngineError::DataQuality(format!("batch {} not found", payload.batch_id))
            })?;
        let prompt = db::prompts::get_by_label(&self.pool, &payload.prompt_label)
            .await?
            .ok_or_else(|| {
                EngineError::Fatal(format!("prompt {} not found", payload.prompt_label))
            })?;

        let config = self.config_for_batch(&batch);
        let checkpoints = CheckpointManager::new(
            self.pool.clone(),
            self.event_bus.clone(),
            &self.worker_id,
            self.heartbeat_interval,
        );
        let pipeline = BatchPipeline::new(
            self.pool.clone(),
            self.event_bus.clone(),
            self.provider.clone(),
            self.queue.clone(),
            checkpoints,
            config,
        );

        pipeline.run(&batch, payload.records, &prompt, cancel).await?;
        Ok(())
    }

    /// Re-process one chunk of an orphaned batch
    async fn process_chunk(&self, payload: ChunkTaskPayload) -> Result<(), EngineError> {
        let checkpoints = CheckpointManager::new(
            self.pool.clone(),
            self.event_bus.clone(),
            &self.worker_id,
            self.heartbeat_interval,
        );
        let checkpoint = checkpoints
            .load(payload.batch_id)
            .await?
            .ok_or_else(|| {
                EngineError::DataQuality(format!("no checkpoint for batch {}", payload.batch_id))
            })?;
        let state: CheckpointState = checkpoint
            .state
            .clone()
            .ok_or_else(|| {
                EngineError::DataQuality(format!(
                    "checkpoint for batch {} has no state blob",
                    payload.batch_id
                ))
            })
            .and_then(|s| {
                serde_json::from_value(s).map_err(|e| {
                    EngineError::DataQuality(format!("unreadable checkpoint state: {}", e))
                })
            })?;

        if checkpoint.processed_chunks.contains(&payload.chunk_index) {
            tracing::info!(
                batch_id = %payload.batch_id,
                chunk_index = payload.chunk_index,
                "Chunk already processed, nothing to do"
            );
            return Ok(());
        }

        // Ownership moves to whichever worker first claims a chunk
        checkpoints.take_ownership(payload.batch_id).await?;

        let chunks = build_chunks(
            payload.batch_id,
            &state.survivors,
            &state.fields,
            state.chunk_size,
        )?;
        let chunk = chunks
            .iter()
            .find(|c| c.chunk_index == payload.chunk_index)
            .ok_or_else(|| {
                EngineError::DataQuality(format!(
                    "chunk {} out of range for batch {}",
                    payload.chunk_index, payload.batch_id
                ))
            })?;

        let batch = db::batches::get(&self.pool, payload.batch_id)
            .await?
            .ok_or_else(|| {
                EngineError::DataQuality(format!("batch {} not found", payload.batch_id))
            })?;

        let dispatcher = ChunkDispatcher::new(
            self.provider.clone(),
            model_of(&batch),
            self.pipeline_config.dispatcher.clone(),
            self.event_bus.clone(),
        );
        let summary = dispatcher
            .dispatch(&state.prompt_text, vec![chunk.clone()], &CancellationToken::new())
            .await;

        let outcome = summary
            .outcomes
            .first()
            .ok_or_else(|| EngineError::Fatal("dispatcher returned no outcome".to_string()))?;
        let failed = matches!(outcome, ChunkOutcome::Failed { .. });

        // Upsert semantics keep reprocessing idempotent
        let classifications = merge_results(
            payload.batch_id,
            &state.survivors,
            std::slice::from_ref(chunk),
            &summary.outcomes,
            self.provider.provider_id(),
            &model_of(&batch),
        );
        db::classifications::upsert_classifications(&self.pool, &classifications).await?;
        checkpoints
            .record_chunk(payload.batch_id, payload.chunk_index, failed)
            .await?;

        Ok(())
    }

    fn config_for_batch(&self, batch: &Batch) -> PipelineConfig {
        let mut config = self.pipeline_config.clone();
        if let Some(columns) = batch.config.get("columns").and_then(|c| c.as_array()) {
            config.columns = columns
                .iter()
                .filter_map(|c| c.as_str().map(str::to_string))
                .collect();
        }
        if let Some(strategy) = batch
            .config
            .get("dedup_strategy")
            .and_then(|s| s.as_str())
            .and_then(crate::dedup::DedupStrategy::parse)
        {
            config.dedup_strategy = strategy;
        }
        if let Some(version) = batch.config.get("refinery_version").and_then(|v| v.as_str()) {
            config.refinery_version = version.to_string();
        }
        config
    }
}

/// Seed a default prompt when none exists yet (first boot convenience)
pub async fn ensure_default_prompt(pool: &SqlitePool) -> Result<Prompt, EngineError> {
    if let Some(prompt) = db::prompts::get_default(pool).await? {
        return Ok(prompt);
    }

    let prompt = default_prompt();
    db::prompts::insert(pool, &prompt).await?;
    db::prompts::set_default(pool, prompt.id).await?;
    tracing::info!(label = %prompt.label, "Seeded default prompt");
    Ok(prompt)
}

fn default_prompt() -> Prompt {
    use crate::models::Category;
    Prompt::new(
        "Clasificación de gastos",
        "gastos-default",
        "Eres un clasificador de partidas de gasto. Clasifica cada registro en una de estas categorias:\n{categories}\n\nResponde únicamente un objeto JSON con un arreglo `results`; cada elemento lleva el campo de texto original, `category`, `reason` y `score` entre 0 y 1 (usa -1 si es imposible clasificar).",
        vec![
            Category {
                id: 1,
                name: "Pop".to_string(),
                description: "Material de punto de venta y promociones".to_string(),
                priority: 1,
                keywords: vec!["promo".to_string(), "exhibidor".to_string()],
            },
            Category {
                id: 2,
                name: "Medios".to_string(),
                description: "Publicidad en medios impresos y digitales".to_string(),
                priority: 2,
                keywords: vec!["revista".to_string(), "radio".to_string(), "espectacular".to_string()],
            },
            Category {
                id: 3,
                name: "Otros".to_string(),
                description: "Gastos que no corresponden a las categorias anteriores".to_string(),
                priority: 3,
                keywords: vec![],
            },
        ],
    )
}

fn model_of(batch: &Batch) -> String {
    batch
        .config
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or("gpt-4o-mini")
        .to_string()
}
