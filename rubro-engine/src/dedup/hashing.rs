//! Canonical record hashing
//!
//! Two records that serialize identically under the canonical form must hash
//! identically, across processes and runs: values are normalized (trim,
//! optional case-fold), keyed into a BTreeMap so JSON keys come out in
//! lexicographic order, then SHA-256 hashed and hex-encoded.

use crate::models::{FieldValue, Record};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Normalization options applied to values before hashing
#[derive(Debug, Clone, Copy)]
pub struct HashOptions {
    pub case_sensitive: bool,
    pub trim_whitespace: bool,
}

impl Default for HashOptions {
    fn default() -> Self {
        Self {
            case_sensitive: false,
            trim_whitespace: true,
        }
    }
}

/// Hash a record over the given clean fields
pub fn content_hash(record: &Record, fields: &[String], options: HashOptions) -> String {
    let mut canonical: BTreeMap<&str, String> = BTreeMap::new();
    for field in fields {
        if let Some(value) = record.cleaned.get(field) {
            canonical.insert(field.as_str(), normalize(value, options));
        }
    }
    digest(&canonical)
}

/// Hash a record over every field it carries, original and cleaned
pub fn full_hash(record: &Record, options: HashOptions) -> String {
    let mut canonical: BTreeMap<&str, String> = BTreeMap::new();
    for (key, value) in &record.original {
        canonical.insert(key.as_str(), normalize(value, options));
    }
    for (key, value) in &record.cleaned {
        canonical.insert(key.as_str(), normalize(value, options));
    }
    digest(&canonical)
}

fn normalize(value: &FieldValue, options: HashOptions) -> String {
    let mut text = value.as_text();
    if options.trim_whitespace {
        text = text.trim().to_string();
    }
    if !options.case_sensitive {
        text = text.to_lowercase();
    }
    text
}

fn digest(canonical: &BTreeMap<&str, String>) -> String {
    // BTreeMap serializes with keys already in lexicographic order
    let json = serde_json::to_string(canonical).expect("string map serializes");
    format!("{:x}", Sha256::digest(json.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_with(field: &str, value: &str) -> Record {
        let mut record = Record::new(0, BTreeMap::new());
        record
            .cleaned
            .insert(field.to_string(), FieldValue::Text(value.to_string()));
        record
    }

    #[test]
    fn test_identical_content_hashes_equal() {
        let fields = vec!["cleanDescripcion".to_string()];
        let a = record_with("cleanDescripcion", "promo tv");
        let b = record_with("cleanDescripcion", "promo tv");
        assert_eq!(
            content_hash(&a, &fields, HashOptions::default()),
            content_hash(&b, &fields, HashOptions::default())
        );
    }

    #[test]
    fn test_normalization_folds_case_and_whitespace() {
        let fields = vec!["cleanDescripcion".to_string()];
        let a = record_with("cleanDescripcion", "  PROMO TV ");
        let b = record_with("cleanDescripcion", "promo tv");
        assert_eq!(
            content_hash(&a, &fields, HashOptions::default()),
            content_hash(&b, &fields, HashOptions::default())
        );

        let strict = HashOptions {
            case_sensitive: true,
            trim_whitespace: false,
        };
        assert_ne!(
            content_hash(&a, &fields, strict),
            content_hash(&b, &fields, strict)
        );
    }

    #[test]
    fn test_hash_is_hex_sha256() {
        let fields = vec!["cleanDescripcion".to_string()];
        let hash = content_hash(
            &record_with("cleanDescripcion", "x"),
            &fields,
            HashOptions::default(),
        );
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_full_hash_sees_all_fields() {
        let mut a = record_with("cleanDescripcion", "promo tv");
        a.original
            .insert("Amount".to_string(), FieldValue::Number(10.0));
        let mut b = record_with("cleanDescripcion", "promo tv");
        b.original
            .insert("Amount".to_string(), FieldValue::Number(11.0));

        let options = HashOptions::default();
        assert_ne!(full_hash(&a, options), full_hash(&b, options));

        let fields = vec!["cleanDescripcion".to_string()];
        assert_eq!(
            content_hash(&a, &fields, options),
            content_hash(&b, &fields, options)
        );
    }
}
