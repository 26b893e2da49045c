//! Record and scalar field value types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Scalar cell value
///
/// The parser boundary guarantees records are flat string→scalar mappings;
/// nested JSON never enters the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Bool(bool),
    Null,
}

impl FieldValue {
    /// String view used for cleaning and hashing; non-text scalars render
    /// through their display form, null as empty
    pub fn as_text(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() {
                    format!("{}", *n as i64)
                } else {
                    format!("{}", n)
                }
            }
            FieldValue::Bool(b) => b.to_string(),
            FieldValue::Null => String::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Text(s) => s.is_empty(),
            FieldValue::Null => true,
            _ => false,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

/// One ledger row moving through the pipeline
///
/// `row_index` is assigned once, unique within the batch and monotonic from
/// zero, and is preserved verbatim through cleaning, dedup, chunking,
/// dispatch, and merge. Reordering is allowed; identity is not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub row_index: i64,
    /// Immutable source cells keyed by column name
    pub original: BTreeMap<String, FieldValue>,
    /// Refinery output, keyed by the clean-prefixed column names
    #[serde(default)]
    pub cleaned: BTreeMap<String, FieldValue>,
}

impl Record {
    pub fn new(row_index: i64, original: BTreeMap<String, FieldValue>) -> Self {
        Self {
            row_index,
            original,
            cleaned: BTreeMap::new(),
        }
    }

    /// Cleaned value for a field, as text
    pub fn cleaned_text(&self, field: &str) -> Option<String> {
        self.cleaned.get(field).map(FieldValue::as_text)
    }

    /// Names of cleaned fields, detected case-insensitively on the `clean`
    /// prefix. Emission always uses the documented `clean<Source>` form; the
    /// case-insensitive match is for records that arrive pre-cleaned.
    pub fn clean_field_names(&self) -> Vec<String> {
        self.cleaned
            .keys()
            .filter(|k| k.to_lowercase().starts_with("clean"))
            .cloned()
            .collect()
    }
}

/// Sibling column name for a cleaned source column
///
/// The literal prefix `clean` is prepended, preserving the source casing:
/// `LineDescription` → `cleanLineDescription`.
pub fn clean_column_name(source: &str) -> String {
    format!("clean{}", source)
}
