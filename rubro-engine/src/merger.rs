//! Result merging
//!
//! Rejoins chunk outcomes to the pre-dispatch record list with a single left
//! join on `row_index`. Records of failed chunks become `Indeterminado`
//! placeholders; nothing is ever dropped. Records of chunks skipped by
//! cancellation are withheld entirely so recovery can finish them later.

use crate::dispatcher::{AlignedResult, ChunkOutcome};
use crate::llm_input::LlmChunk;
use crate::models::{Classification, Record};
use chrono::Utc;
use std::collections::HashMap;
use uuid::Uuid;

/// Reason recorded on placeholders for whole-chunk failures
const CHUNK_FAILED_REASON: &str = "chunk failed";

/// Join dispatch outcomes back onto the survivor records
///
/// Output is ordered by `row_index`. Every record whose chunk reached a
/// terminal state appears exactly once; skipped chunks contribute nothing.
pub fn merge_results(
    batch_id: Uuid,
    records: &[Record],
    chunks: &[LlmChunk],
    outcomes: &[ChunkOutcome],
    provider: &str,
    model: &str,
) -> Vec<Classification> {
    let record_by_index: HashMap<i64, &Record> =
        records.iter().map(|r| (r.row_index, r)).collect();
    let chunk_by_index: HashMap<usize, &LlmChunk> =
        chunks.iter().map(|c| (c.chunk_index, c)).collect();

    let mut classifications = Vec::with_capacity(records.len());

    for outcome in outcomes {
        match outcome {
            ChunkOutcome::Done {
                results,
                tokens_used,
                processing_ms,
                ..
            } => {
                let per_record_tokens = if results.is_empty() {
                    0
                } else {
                    *tokens_used as i64 / results.len() as i64
                };
                for result in results {
                    classifications.push(from_aligned(
                        batch_id,
                        result,
                        record_by_index.get(&result.row_index).copied(),
                        provider,
                        model,
                        per_record_tokens,
                        *processing_ms as i64,
                    ));
                }
            }
            ChunkOutcome::Failed { chunk_index, .. } => {
                let Some(chunk) = chunk_by_index.get(chunk_index) else {
                    continue;
                };
                for chunk_record in &chunk.records {
                    let record = record_by_index.get(&chunk_record.row_index).copied();
                    classifications.push(Classification::placeholder(
                        batch_id,
                        chunk_record.row_index,
                        record.map(|r| r.original.clone()).unwrap_or_default(),
                        record.map(|r| r.cleaned.clone()).unwrap_or_default(),
                        CHUNK_FAILED_REASON,
                    ));
                }
            }
            ChunkOutcome::Skipped { .. } => {}
        }
    }

    classifications.sort_by_key(|c| c.row_index);
    classifications
}

fn from_aligned(
    batch_id: Uuid,
    result: &AlignedResult,
    record: Option<&Record>,
    provider: &str,
    model: &str,
    tokens_used: i64,
    processing_time_ms: i64,
) -> Classification {
    Classification {
        id: Uuid::new_v4(),
        batch_id,
        row_index: result.row_index,
        original_data: record.map(|r| r.original.clone()).unwrap_or_default(),
        cleaned_data: record.map(|r| r.cleaned.clone()).unwrap_or_default(),
        category: result.category.clone(),
        reason: result.reason.clone(),
        score: result.score,
        provider: provider.to_string(),
        model: model.to_string(),
        tokens_used,
        processing_time_ms,
        created_at: Utc::now(),
    }
}
