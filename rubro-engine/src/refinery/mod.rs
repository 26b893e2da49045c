//! Text refinery: version-pinned, ordered, deterministic cleaning
//!
//! A refinery version selects an exact sequence of transformation steps.
//! The registry is populated at startup and read-mostly afterwards; choosing
//! `"v1"` always yields the same pipeline, so cleaned output is reproducible
//! across processes and re-runs.

mod steps;
mod v1_spanish;

pub use steps::{ProcessingSteps, RefineryConfig};
pub use v1_spanish::RefineryV1Spanish;

use crate::error::EngineError;
use crate::models::{FieldValue, Record};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Arc;

/// A version-pinned text cleaning pipeline
///
/// `process` is pure and deterministic for a given version and
/// configuration. Null/empty input yields the empty string; no step may
/// raise on normal text.
pub trait Refinery: Send + Sync {
    fn version(&self) -> &str;
    fn name(&self) -> &str;
    fn process(&self, text: &str) -> String;
    fn step_names(&self) -> Vec<&'static str>;
}

static REGISTRY: Lazy<HashMap<&'static str, Arc<dyn Refinery>>> = Lazy::new(|| {
    let mut registry: HashMap<&'static str, Arc<dyn Refinery>> = HashMap::new();
    registry.insert("v1", Arc::new(RefineryV1Spanish::new()));
    registry
});

/// Resolve a refinery version id to its pipeline
pub fn get_refinery(version: &str) -> Result<Arc<dyn Refinery>, EngineError> {
    REGISTRY
        .get(version)
        .cloned()
        .ok_or_else(|| EngineError::Fatal(format!("unknown refinery version: {}", version)))
}

/// Registered version ids
pub fn registered_versions() -> Vec<&'static str> {
    let mut versions: Vec<&'static str> = REGISTRY.keys().copied().collect();
    versions.sort_unstable();
    versions
}

/// Clean the selected columns of every record in place
///
/// For each selected source column `X`, writes the sibling column `cleanX`
/// (literal prefix, source casing preserved) into `record.cleaned`. Missing
/// and null cells clean to the empty string. `row_index` is untouched.
pub fn clean_records(
    records: &mut [Record],
    columns: &[String],
    refinery: &dyn Refinery,
) -> Result<(), EngineError> {
    if columns.is_empty() {
        return Err(EngineError::DataQuality(
            "no columns selected for cleaning".to_string(),
        ));
    }

    for record in records.iter_mut() {
        for column in columns {
            let raw = record
                .original
                .get(column)
                .map(FieldValue::as_text)
                .unwrap_or_default();
            let cleaned = if raw.is_empty() {
                String::new()
            } else {
                refinery.process(&raw)
            };
            record.cleaned.insert(
                crate::models::clean_column_name(column),
                FieldValue::Text(cleaned),
            );
        }
    }

    Ok(())
}
