//! Concurrent chunk dispatcher
//!
//! Executes chunks against a provider under a global concurrency cap, with
//! bounded exponential-backoff retries for transient failures and graceful
//! repair of malformed responses. Chunks share no mutable state; the
//! semaphore is the only coordination primitive. Order across chunks is not
//! preserved here; the merger restores total order by `row_index`.

mod chunk;
mod repair;

pub use chunk::{ChunkExecution, ChunkState};
pub use repair::{align_results, parse_results, AlignedResult};

use crate::llm_input::LlmChunk;
use crate::providers::{CompletionRequest, LlmProvider, Message};
use chrono::Utc;
use rubro_common::events::{EventBus, RubroEvent};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// First retry delay; doubles on every further retry
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Dispatcher tuning
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum in-flight provider requests (K)
    pub concurrency_limit: usize,
    /// Retries per chunk after the first attempt
    pub max_retries: u32,
    /// Per-request provider timeout
    pub request_timeout: Duration,
    /// How long in-flight chunks may run after cancellation
    pub cancel_grace: Duration,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 3,
            max_retries: 3,
            request_timeout: Duration::from_secs(30),
            cancel_grace: Duration::from_secs(25),
            temperature: 0.1,
            max_tokens: 4096,
        }
    }
}

/// Terminal outcome of one chunk
#[derive(Debug, Clone)]
pub enum ChunkOutcome {
    /// Reached DONE: one aligned result per input record
    Done {
        chunk_index: usize,
        results: Vec<AlignedResult>,
        tokens_used: u64,
        processing_ms: u64,
        repair_count: usize,
    },
    /// Retry budget exhausted or deterministic refusal
    Failed { chunk_index: usize, reason: String },
    /// Never dispatched (cancellation); left for recovery
    Skipped { chunk_index: usize },
}

impl ChunkOutcome {
    pub fn chunk_index(&self) -> usize {
        match self {
            ChunkOutcome::Done { chunk_index, .. }
            | ChunkOutcome::Failed { chunk_index, .. }
            | ChunkOutcome::Skipped { chunk_index } => *chunk_index,
        }
    }
}

/// What came back from dispatching a batch's chunks
#[derive(Debug, Default)]
pub struct DispatchSummary {
    /// Outcomes ordered by chunk index
    pub outcomes: Vec<ChunkOutcome>,
    /// Whether cancellation cut the run short
    pub cancelled: bool,
}

impl DispatchSummary {
    pub fn done_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, ChunkOutcome::Done { .. }))
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, ChunkOutcome::Failed { .. }))
            .count()
    }

    pub fn skipped_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, ChunkOutcome::Skipped { .. }))
            .count()
    }

    pub fn total_repairs(&self) -> usize {
        self.outcomes
            .iter()
            .map(|o| match o {
                ChunkOutcome::Done { repair_count, .. } => *repair_count,
                _ => 0,
            })
            .sum()
    }

    pub fn total_tokens(&self) -> u64 {
        self.outcomes
            .iter()
            .map(|o| match o {
                ChunkOutcome::Done { tokens_used, .. } => *tokens_used,
                _ => 0,
            })
            .sum()
    }
}

/// Per-task execution context, cloned into each spawned chunk task
#[derive(Clone)]
struct ExecutionContext {
    provider: Arc<dyn LlmProvider>,
    model: String,
    prompt: Arc<str>,
    config: DispatcherConfig,
    event_bus: EventBus,
}

/// The chunk dispatcher
pub struct ChunkDispatcher {
    provider: Arc<dyn LlmProvider>,
    model: String,
    config: DispatcherConfig,
    event_bus: EventBus,
}

impl ChunkDispatcher {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        model: String,
        config: DispatcherConfig,
        event_bus: EventBus,
    ) -> Self {
        Self {
            provider,
            model,
            config,
            event_bus,
        }
    }

    /// Dispatch every chunk, bounded by the concurrency cap
    ///
    /// Returns once all chunks are terminal or cancellation plus its grace
    /// period has passed. Chunks never dispatched due to cancellation come
    /// back as `Skipped`, not `Failed`.
    pub async fn dispatch(
        &self,
        prompt_text: &str,
        chunks: Vec<LlmChunk>,
        cancel: &CancellationToken,
    ) -> DispatchSummary {
        let chunk_indices: Vec<usize> = chunks.iter().map(|c| c.chunk_index).collect();
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency_limit));
        let ctx = ExecutionContext {
            provider: self.provider.clone(),
            model: self.model.clone(),
            prompt: Arc::from(prompt_text),
            config: self.config.clone(),
            event_bus: self.event_bus.clone(),
        };

        let mut join_set = JoinSet::new();
        for chunk in chunks {
            let task_ctx = ctx.clone();
            let task_cancel = cancel.clone();
            let task_semaphore = semaphore.clone();
            join_set.spawn(execute_chunk(task_ctx, chunk, task_cancel, task_semaphore));
        }

        let mut collected: HashMap<usize, ChunkOutcome> = HashMap::new();
        let mut cancelled = false;

        loop {
            if cancel.is_cancelled() && !cancelled {
                cancelled = true;
                // Bounded grace: let in-flight chunks finish, then abort
                let drain = tokio::time::timeout(self.config.cancel_grace, async {
                    while let Some(joined) = join_set.join_next().await {
                        if let Ok(outcome) = joined {
                            collected.insert(outcome.chunk_index(), outcome);
                        }
                    }
                })
                .await;
                if drain.is_err() {
                    tracing::warn!("Cancellation grace period elapsed, aborting in-flight chunks");
                    join_set.abort_all();
                    while join_set.join_next().await.is_some() {}
                }
                break;
            }

            tokio::select! {
                joined = join_set.join_next() => {
                    match joined {
                        Some(Ok(outcome)) => {
                            collected.insert(outcome.chunk_index(), outcome);
                        }
                        Some(Err(e)) => {
                            tracing::error!(error = %e, "Chunk task panicked");
                        }
                        None => break,
                    }
                }
                _ = cancel.cancelled() => {
                    // Loop head handles the grace drain
                }
            }
        }

        let outcomes = chunk_indices
            .into_iter()
            .map(|index| {
                collected
                    .remove(&index)
                    .unwrap_or(ChunkOutcome::Skipped { chunk_index: index })
            })
            .collect();

        DispatchSummary {
            outcomes,
            cancelled,
        }
    }
}

fn backoff_delay(retry_number: u32) -> Duration {
    BACKOFF_BASE * 2u32.saturating_pow(retry_number.saturating_sub(1))
}

/// Run one chunk through the state machine until terminal
async fn execute_chunk(
    ctx: ExecutionContext,
    chunk: LlmChunk,
    cancel: CancellationToken,
    semaphore: Arc<Semaphore>,
) -> ChunkOutcome {
    let chunk_index = chunk.chunk_index;
    let batch_id = chunk.batch_id;
    let mut execution = ChunkExecution::new(chunk_index);
    let started = Instant::now();

    loop {
        if cancel.is_cancelled() {
            return ChunkOutcome::Skipped { chunk_index };
        }

        let permit = tokio::select! {
            permit = semaphore.clone().acquire_owned() => {
                permit.expect("dispatcher semaphore never closes")
            }
            _ = cancel.cancelled() => return ChunkOutcome::Skipped { chunk_index },
        };
        if cancel.is_cancelled() {
            return ChunkOutcome::Skipped { chunk_index };
        }

        execution.advance(ChunkState::Dispatched);
        execution.attempts += 1;
        ctx.event_bus.emit_lossy(RubroEvent::ChunkDispatched {
            batch_id,
            chunk_index,
            record_count: chunk.records.len(),
            timestamp: Utc::now(),
        });

        let request = CompletionRequest {
            messages: vec![Message::user(format!(
                "{}\n\n{}",
                ctx.prompt,
                chunk.to_payload_json()
            ))],
            model: ctx.model.clone(),
            temperature: ctx.config.temperature,
            max_tokens: ctx.config.max_tokens,
            timeout: ctx.config.request_timeout,
        };

        let attempt = ctx.provider.complete(&request).await;
        drop(permit); // free the slot before parsing or sleeping

        let failure_reason = match attempt {
            Ok(response) => {
                execution.advance(ChunkState::ResponseReceived);
                match parse_results(&response.content) {
                    Ok(raw_results) => {
                        execution.advance(ChunkState::Parsed);
                        execution.advance(ChunkState::Validated);
                        let (results, repair_count) = align_results(&chunk, &raw_results);
                        execution.advance(ChunkState::Aligned);
                        execution.advance(ChunkState::Done);

                        let processing_ms = started.elapsed().as_millis() as u64;
                        if repair_count > 0 {
                            tracing::warn!(
                                batch_id = %batch_id,
                                chunk_index,
                                repair_count,
                                "Chunk response repaired"
                            );
                            ctx.event_bus.emit_lossy(RubroEvent::ChunkRepaired {
                                batch_id,
                                chunk_index,
                                repair_count,
                                timestamp: Utc::now(),
                            });
                        }
                        ctx.event_bus.emit_lossy(RubroEvent::ChunkCompleted {
                            batch_id,
                            chunk_index,
                            record_count: results.len(),
                            tokens_used: response.tokens_used,
                            processing_ms,
                            timestamp: Utc::now(),
                        });

                        return ChunkOutcome::Done {
                            chunk_index,
                            results,
                            tokens_used: response.tokens_used,
                            processing_ms,
                            repair_count,
                        };
                    }
                    Err(parse_error) => {
                        tracing::warn!(
                            batch_id = %batch_id,
                            chunk_index,
                            attempt = execution.attempts,
                            error = %parse_error,
                            "Chunk response unparseable"
                        );
                        parse_error
                    }
                }
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(
                    batch_id = %batch_id,
                    chunk_index,
                    attempt = execution.attempts,
                    error = %e,
                    "Transient provider failure"
                );
                e.to_string()
            }
            Err(e) => {
                // Deterministic refusal: retrying cannot help
                execution.advance(ChunkState::FailedChunk);
                tracing::error!(
                    batch_id = %batch_id,
                    chunk_index,
                    error = %e,
                    "Provider rejected chunk"
                );
                ctx.event_bus.emit_lossy(RubroEvent::ChunkFailed {
                    batch_id,
                    chunk_index,
                    reason: e.to_string(),
                    timestamp: Utc::now(),
                });
                return ChunkOutcome::Failed {
                    chunk_index,
                    reason: e.to_string(),
                };
            }
        };

        if execution.attempts > ctx.config.max_retries {
            execution.advance(ChunkState::FailedChunk);
            let reason = format!(
                "failed after {} attempts: {}",
                execution.attempts, failure_reason
            );
            ctx.event_bus.emit_lossy(RubroEvent::ChunkFailed {
                batch_id,
                chunk_index,
                reason: reason.clone(),
                timestamp: Utc::now(),
            });
            return ChunkOutcome::Failed {
                chunk_index,
                reason,
            };
        }

        execution.advance(ChunkState::RetryScheduled);
        let delay = backoff_delay(execution.attempts);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            // Cancellation mid-retry skips the backoff sleep
            _ = cancel.cancelled() => return ChunkOutcome::Skipped { chunk_index },
        }
        execution.advance(ChunkState::Pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_input::build_chunks;
    use crate::models::{FieldValue, Record};
    use crate::providers::{CompletionResponse, ProviderError};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use uuid::Uuid;

    fn records(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| {
                let mut r = Record::new(i as i64, BTreeMap::new());
                r.cleaned.insert(
                    "cleanDescripcion".to_string(),
                    FieldValue::Text(format!("item {}", i)),
                );
                r
            })
            .collect()
    }

    /// Scripted provider: pops one canned reply per call
    struct ScriptedProvider {
        replies: Mutex<Vec<Result<String, ProviderError>>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(replies: Vec<Result<String, ProviderError>>) -> Self {
            Self {
                replies: Mutex::new(replies),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }

        /// Provider that always echoes a full result set for any chunk size
        fn echoing() -> Self {
            Self::new(Vec::new())
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn provider_id(&self) -> &'static str {
            "scripted"
        }

        async fn complete(
            &self,
            request: &CompletionRequest,
        ) -> Result<CompletionResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let scripted = self.replies.lock().unwrap().pop();
            let content = match scripted {
                Some(Ok(content)) => content,
                Some(Err(e)) => return Err(e),
                None => {
                    // Echo mode: classify every payload record as Pop
                    let payload_start = request.messages[0].content.find("[{").unwrap_or(0);
                    let payload: Vec<serde_json::Value> =
                        serde_json::from_str(&request.messages[0].content[payload_start..])
                            .unwrap_or_default();
                    let results: Vec<serde_json::Value> = payload
                        .iter()
                        .map(|r| {
                            serde_json::json!({
                                "cleanDescripcion": r["data"]["cleanDescripcion"],
                                "category": "Pop",
                                "reason": "echo",
                                "score": 0.9
                            })
                        })
                        .collect();
                    serde_json::json!({ "results": results }).to_string()
                }
            };

            Ok(CompletionResponse {
                content,
                tokens_used: 10,
                id: "test".to_string(),
            })
        }

        async fn validate_api_key(&self) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    fn dispatcher(provider: Arc<ScriptedProvider>, k: usize) -> ChunkDispatcher {
        let config = DispatcherConfig {
            concurrency_limit: k,
            ..DispatcherConfig::default()
        };
        ChunkDispatcher::new(provider, "test-model".to_string(), config, EventBus::new(64))
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_cap_respected() {
        let provider = Arc::new(ScriptedProvider::echoing());
        let chunks = build_chunks(Uuid::new_v4(), &records(30), &[], 1).unwrap();
        assert_eq!(chunks.len(), 30);

        let d = dispatcher(provider.clone(), 3);
        let summary = d.dispatch("classify", chunks, &CancellationToken::new()).await;

        assert_eq!(summary.done_count(), 30);
        assert!(provider.max_in_flight.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retried_to_success() {
        // Replies pop from the back: two transients, then success
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(r#"{"results": [{"cleanDescripcion": "item 0", "category": "Pop", "score": 0.8}]}"#
                .to_string()),
            Err(ProviderError::RateLimited),
            Err(ProviderError::Network("reset".into())),
        ]));
        let chunks = build_chunks(Uuid::new_v4(), &records(1), &[], 50).unwrap();

        let summary = dispatcher(provider.clone(), 3)
            .dispatch("classify", chunks, &CancellationToken::new())
            .await;

        assert_eq!(summary.done_count(), 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhaustion_fails_chunk() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(ProviderError::Timeout),
            Err(ProviderError::Timeout),
            Err(ProviderError::Timeout),
            Err(ProviderError::Timeout),
            Err(ProviderError::Timeout),
        ]));
        let chunks = build_chunks(Uuid::new_v4(), &records(2), &[], 50).unwrap();

        let summary = dispatcher(provider.clone(), 3)
            .dispatch("classify", chunks, &CancellationToken::new())
            .await;

        assert_eq!(summary.failed_count(), 1);
        // 1 initial attempt + 3 retries
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deterministic_refusal_not_retried() {
        let provider = Arc::new(ScriptedProvider::new(vec![Err(ProviderError::Auth(
            "bad key".into(),
        ))]));
        let chunks = build_chunks(Uuid::new_v4(), &records(1), &[], 50).unwrap();

        let summary = dispatcher(provider.clone(), 3)
            .dispatch("classify", chunks, &CancellationToken::new())
            .await;

        assert_eq!(summary.failed_count(), 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_json_retried() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(r#"{"results": [{"cleanDescripcion": "item 0", "category": "Pop", "score": 0.8}]}"#
                .to_string()),
            Ok("I could not classify these records.".to_string()),
        ]));
        let chunks = build_chunks(Uuid::new_v4(), &records(1), &[], 50).unwrap();

        let summary = dispatcher(provider.clone(), 3)
            .dispatch("classify", chunks, &CancellationToken::new())
            .await;

        assert_eq!(summary.done_count(), 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_before_dispatch_skips_all() {
        let provider = Arc::new(ScriptedProvider::echoing());
        let chunks = build_chunks(Uuid::new_v4(), &records(10), &[], 1).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = dispatcher(provider.clone(), 3)
            .dispatch("classify", chunks, &cancel)
            .await;

        assert!(summary.cancelled);
        assert_eq!(summary.skipped_count(), 10);
        assert_eq!(summary.done_count(), 0);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcomes_ordered_by_chunk_index() {
        let provider = Arc::new(ScriptedProvider::echoing());
        let chunks = build_chunks(Uuid::new_v4(), &records(12), &[], 2).unwrap();

        let summary = dispatcher(provider, 4)
            .dispatch("classify", chunks, &CancellationToken::new())
            .await;

        let indices: Vec<usize> = summary.outcomes.iter().map(|o| o.chunk_index()).collect();
        assert_eq!(indices, (0..6).collect::<Vec<_>>());
    }

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff_delay(1), Duration::from_millis(500));
        assert_eq!(backoff_delay(2), Duration::from_millis(1000));
        assert_eq!(backoff_delay(3), Duration::from_millis(2000));
    }
}
