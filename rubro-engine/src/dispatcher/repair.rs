//! Response normalization and count-mismatch repair
//!
//! Providers answer in loosely agreed shapes: field names drift between
//! languages (`clase`/`categoria`/`category`), counts drift when the model
//! skips or invents rows, and the JSON often arrives wrapped in markdown
//! fences. This module forces every response into exactly one aligned result
//! per input record, synthesizing `Indeterminado` placeholders where nothing
//! usable came back.

use crate::llm_input::LlmChunk;
use crate::models::{AMBIGUOUS_SCORE, INDETERMINADO};
use serde_json::Value;
use std::collections::HashMap;

/// Reason text attached to synthesized placeholder entries
const NO_RESULT_REASON: &str = "No classification returned";

/// One provider result aligned to one input record
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedResult {
    pub row_index: i64,
    pub category: String,
    pub reason: String,
    pub score: f64,
    /// Whether this entry was synthesized or otherwise repaired
    pub repaired: bool,
}

/// Parse the provider's content into raw result objects
///
/// Accepts a top-level `{"results": [...]}` object; tolerates markdown code
/// fences and a bare top-level array.
pub fn parse_results(content: &str) -> Result<Vec<Value>, String> {
    let trimmed = strip_code_fences(content);

    let parsed: Value =
        serde_json::from_str(trimmed).map_err(|e| format!("malformed JSON: {}", e))?;

    match parsed {
        Value::Object(mut obj) => match obj.remove("results") {
            Some(Value::Array(items)) => Ok(items),
            Some(_) => Err("`results` is not an array".to_string()),
            None => Err("response object has no `results` array".to_string()),
        },
        Value::Array(items) => Ok(items),
        _ => Err("response is neither an object nor an array".to_string()),
    }
}

/// Strip a leading/trailing markdown code fence if present
fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        // Drop the info string ("json", "JSON", ...) up to the first newline
        let body = match rest.find('\n') {
            Some(pos) => &rest[pos + 1..],
            None => rest,
        };
        body.trim_end().strip_suffix("```").unwrap_or(body).trim()
    } else {
        trimmed
    }
}

/// Normalized view of one raw result object
#[derive(Debug, Clone, Default)]
struct NormalizedResult {
    category: Option<String>,
    reason: Option<String>,
    score: Option<f64>,
    /// Value of the chunk's primary clean field, if the model echoed it
    primary_value: Option<String>,
}

/// Map vendor/language field-name variants onto the canonical keys
fn normalize_result(raw: &Value, primary_field: &str) -> NormalizedResult {
    let obj = match raw.as_object() {
        Some(obj) => obj,
        None => return NormalizedResult::default(),
    };

    let mut normalized = NormalizedResult::default();

    for (key, value) in obj {
        let key_lower = key.to_lowercase();
        match key_lower.as_str() {
            "clase" | "categoria" | "category" | "classification" => {
                if normalized.category.is_none() {
                    normalized.category = value.as_str().map(str::to_string);
                }
            }
            "razon" | "reason" | "rationale" => {
                if normalized.reason.is_none() {
                    normalized.reason = value.as_str().map(str::to_string);
                }
            }
            "puntaje" | "confidence" | "score" => {
                if normalized.score.is_none() {
                    normalized.score = parse_score(value);
                }
            }
            _ => {}
        }
        if key.eq_ignore_ascii_case(primary_field) && normalized.primary_value.is_none() {
            normalized.primary_value = value.as_str().map(str::to_string);
        }
    }

    normalized
}

fn parse_score(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .map(|s| s.clamp(AMBIGUOUS_SCORE, 1.0))
}

/// Key used to match results back to inputs when counts disagree
fn match_key(value: &str) -> String {
    value.trim().to_lowercase()
}

fn placeholder(row_index: i64) -> AlignedResult {
    AlignedResult {
        row_index,
        category: INDETERMINADO.to_string(),
        reason: NO_RESULT_REASON.to_string(),
        score: AMBIGUOUS_SCORE,
        repaired: true,
    }
}

/// Force |results| = |chunk| and stamp row indices
///
/// Equal counts align positionally. Unequal counts align through a map keyed
/// on the normalized primary-field value (first occurrence wins); inputs with
/// no match get a synthesized placeholder. Either way the i-th output carries
/// the i-th input's `row_index` and the repair count reports every entry that
/// had to be synthesized or re-keyed.
pub fn align_results(chunk: &LlmChunk, raw_results: &[Value]) -> (Vec<AlignedResult>, usize) {
    let primary_field = chunk.primary_field();
    let normalized: Vec<NormalizedResult> = raw_results
        .iter()
        .map(|raw| normalize_result(raw, primary_field))
        .collect();

    let mut repair_count = 0usize;
    let mut aligned = Vec::with_capacity(chunk.records.len());

    if normalized.len() == chunk.records.len() {
        // Positional alignment
        for (record, result) in chunk.records.iter().zip(normalized) {
            match result.category {
                Some(category) => aligned.push(AlignedResult {
                    row_index: record.row_index,
                    category,
                    reason: result.reason.unwrap_or_default(),
                    score: result.score.unwrap_or(0.0),
                    repaired: false,
                }),
                None => {
                    repair_count += 1;
                    aligned.push(placeholder(record.row_index));
                }
            }
        }
        return (aligned, repair_count);
    }

    // Count mismatch: match by primary value, first occurrence wins
    let mut by_primary: HashMap<String, &NormalizedResult> = HashMap::new();
    for result in &normalized {
        if let Some(value) = &result.primary_value {
            by_primary.entry(match_key(value)).or_insert(result);
        }
    }

    for record in &chunk.records {
        let input_value = record.data.get(primary_field).cloned().unwrap_or_default();
        let matched = by_primary
            .get(&match_key(&input_value))
            .filter(|r| r.category.is_some());
        match matched {
            Some(result) => aligned.push(AlignedResult {
                row_index: record.row_index,
                category: result.category.clone().expect("filtered above"),
                reason: result.reason.clone().unwrap_or_default(),
                score: result.score.unwrap_or(0.0),
                repaired: true,
            }),
            None => {
                aligned.push(placeholder(record.row_index));
            }
        }
        repair_count += 1;
    }

    (aligned, repair_count)
}
