//! LLM input assembly
//!
//! Builds token-lean chunk payloads from survivor records: only clean fields
//! enter the payload, null/empty cells become empty strings, and every record
//! carries its `row_index` verbatim. The token estimate guides dispatch but
//! never caps it.

use crate::error::EngineError;
use crate::models::{FieldValue, Record};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

/// Fixed token allowance for prompt instructions around the data payload
const PROMPT_OVERHEAD_TOKENS: usize = 300;

/// One record as sent to the provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub row_index: i64,
    /// Clean-field values, keyed by field name
    pub data: BTreeMap<String, String>,
}

/// A bounded slice of records dispatched as one LLM call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmChunk {
    pub batch_id: Uuid,
    pub chunk_index: usize,
    pub total_chunks: usize,
    /// Participating clean-field names; the first is the primary field used
    /// for count-mismatch repair
    pub fields: Vec<String>,
    pub records: Vec<ChunkRecord>,
}

impl LlmChunk {
    /// The field repair keys on
    pub fn primary_field(&self) -> &str {
        &self.fields[0]
    }

    /// Rough token estimate: serialized length / 4 plus prompt overhead
    pub fn estimated_tokens(&self) -> usize {
        let payload_len = serde_json::to_string(self).map(|s| s.len()).unwrap_or(0);
        payload_len / 4 + PROMPT_OVERHEAD_TOKENS
    }

    /// Serialized payload appended to the compiled prompt
    pub fn to_payload_json(&self) -> String {
        serde_json::to_string(&self.records).unwrap_or_else(|_| "[]".to_string())
    }
}

/// Detect clean fields on a record, case-insensitive on the `clean` prefix
pub fn detect_clean_fields(record: &Record) -> Vec<String> {
    let mut fields = record.clean_field_names();
    if fields.is_empty() {
        fields = record
            .original
            .keys()
            .filter(|k| k.to_lowercase().starts_with("clean"))
            .cloned()
            .collect();
    }
    fields.sort();
    fields
}

/// Split survivor records into ordered chunks of at most `chunk_size`
///
/// Rejects empty input, missing clean fields, non-positive chunk sizes, and
/// duplicate `row_index` values before anything reaches a provider.
pub fn build_chunks(
    batch_id: Uuid,
    records: &[Record],
    fields: &[String],
    chunk_size: usize,
) -> Result<Vec<LlmChunk>, EngineError> {
    if chunk_size == 0 {
        return Err(EngineError::DataQuality(
            "chunk size must be positive".to_string(),
        ));
    }
    if records.is_empty() {
        return Err(EngineError::DataQuality("no records to chunk".to_string()));
    }

    let fields: Vec<String> = if fields.is_empty() {
        detect_clean_fields(&records[0])
    } else {
        fields.to_vec()
    };
    if fields.is_empty() {
        return Err(EngineError::DataQuality(
            "no clean fields detected".to_string(),
        ));
    }

    let mut seen_indices: HashSet<i64> = HashSet::with_capacity(records.len());
    for record in records {
        if !seen_indices.insert(record.row_index) {
            return Err(EngineError::DataQuality(format!(
                "duplicate row_index: {}",
                record.row_index
            )));
        }
    }

    let total_chunks = records.len().div_ceil(chunk_size);
    let mut chunks = Vec::with_capacity(total_chunks);

    for (chunk_index, window) in records.chunks(chunk_size).enumerate() {
        let chunk_records = window
            .iter()
            .map(|record| {
                let mut data = BTreeMap::new();
                for field in &fields {
                    let value = record
                        .cleaned
                        .get(field)
                        .map(FieldValue::as_text)
                        .unwrap_or_default();
                    data.insert(field.clone(), value);
                }
                ChunkRecord {
                    row_index: record.row_index,
                    data,
                }
            })
            .collect();

        chunks.push(LlmChunk {
            batch_id,
            chunk_index,
            total_chunks,
            fields: fields.clone(),
            records: chunk_records,
        });
    }

    tracing::debug!(
        batch_id = %batch_id,
        total_records = records.len(),
        chunk_size,
        total_chunks,
        "Built LLM input chunks"
    );

    Ok(chunks)
}
