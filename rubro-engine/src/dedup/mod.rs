//! Two-level record deduplication
//!
//! Level 1 collapses duplicates within a batch (first-seen wins). Level 2,
//! enabled by the `universal` strategy, additionally rejects records whose
//! hash was kept by any prior batch. Every input row's hash is persisted with
//! its kept flag so later batches can run level-2 lookups; survivors feed the
//! LLM.

pub mod hashing;

pub use hashing::{content_hash, full_hash, HashOptions};

use crate::error::EngineError;
use crate::models::Record;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::time::Instant;
use uuid::Uuid;

/// How records are collapsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupStrategy {
    /// Identity: every record survives
    PreserveAll,
    /// Collapse by equality on the clean-field tuple, within the batch
    ContentOnly,
    /// Collapse by equality on all fields, within the batch
    Aggressive,
    /// ContentOnly plus rejection of hashes kept by prior batches
    Universal,
}

impl DedupStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "preserve_all" => Some(DedupStrategy::PreserveAll),
            "content_only" => Some(DedupStrategy::ContentOnly),
            "aggressive" => Some(DedupStrategy::Aggressive),
            "universal" => Some(DedupStrategy::Universal),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DedupStrategy::PreserveAll => "preserve_all",
            DedupStrategy::ContentOnly => "content_only",
            DedupStrategy::Aggressive => "aggressive",
            DedupStrategy::Universal => "universal",
        }
    }
}

/// Deduplication report
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupStats {
    pub original_count: usize,
    pub kept_count: usize,
    pub level1_removed: usize,
    pub level2_removed: usize,
    pub processing_ms: u64,
}

/// Outcome of a dedup pass: surviving records plus the report
#[derive(Debug)]
pub struct DedupOutcome {
    pub records: Vec<Record>,
    pub stats: DedupStats,
}

/// Deduplication service
///
/// The pool is optional: without one, level 2 is skipped and hashes are not
/// persisted (in-memory dedup only). Hash persistence failures are logged and
/// do not fail the batch.
pub struct Deduplicator {
    pool: Option<SqlitePool>,
    strategy: DedupStrategy,
    clean_fields: Vec<String>,
    options: HashOptions,
}

impl Deduplicator {
    pub fn new(
        pool: Option<SqlitePool>,
        strategy: DedupStrategy,
        clean_fields: Vec<String>,
        options: HashOptions,
    ) -> Self {
        Self {
            pool,
            strategy,
            clean_fields,
            options,
        }
    }

    /// Deduplicate a batch's records
    ///
    /// Survivors keep their `row_index` unchanged and their first-seen order.
    pub async fn dedupe(
        &self,
        batch_id: Uuid,
        records: Vec<Record>,
    ) -> Result<DedupOutcome, EngineError> {
        let start = Instant::now();
        let original_count = records.len();

        if records.is_empty() {
            return Ok(DedupOutcome {
                records,
                stats: DedupStats::default(),
            });
        }

        if self.strategy == DedupStrategy::PreserveAll {
            let kept_count = records.len();
            return Ok(DedupOutcome {
                records,
                stats: DedupStats {
                    original_count,
                    kept_count,
                    level1_removed: 0,
                    level2_removed: 0,
                    processing_ms: start.elapsed().as_millis() as u64,
                },
            });
        }

        tracing::info!(
            batch_id = %batch_id,
            record_count = original_count,
            strategy = self.strategy.as_str(),
            "Starting deduplication"
        );

        let hashes: Vec<String> = records.iter().map(|r| self.hash_record(r)).collect();

        // Level 1: within-batch collapse, first-seen wins
        let mut seen: HashSet<&str> = HashSet::new();
        let mut level1_survivor = vec![false; records.len()];
        let mut level1_removed = 0usize;
        for (i, hash) in hashes.iter().enumerate() {
            if seen.insert(hash.as_str()) {
                level1_survivor[i] = true;
            } else {
                level1_removed += 1;
                tracing::debug!(
                    batch_id = %batch_id,
                    row_index = records[i].row_index,
                    "Within-batch duplicate"
                );
            }
        }

        // Level 2: reject hashes kept by prior batches
        let mut level2_removed = 0usize;
        let mut kept = vec![false; records.len()];
        if let (DedupStrategy::Universal, Some(pool)) = (self.strategy, &self.pool) {
            for i in 0..records.len() {
                if !level1_survivor[i] {
                    continue;
                }
                match self.hash_seen_before(pool, batch_id, &hashes[i]).await {
                    Ok(true) => {
                        level2_removed += 1;
                        tracing::debug!(
                            batch_id = %batch_id,
                            row_index = records[i].row_index,
                            "Cross-batch duplicate"
                        );
                    }
                    Ok(false) => kept[i] = true,
                    Err(e) => {
                        // Fail open: an unavailable hash store must not drop data
                        tracing::error!(batch_id = %batch_id, error = %e, "Level-2 lookup failed");
                        kept[i] = true;
                    }
                }
            }
        } else {
            kept.copy_from_slice(&level1_survivor);
        }

        if let Some(pool) = &self.pool {
            if let Err(e) = self.store_hashes(pool, batch_id, &records, &hashes, &kept).await {
                tracing::error!(batch_id = %batch_id, error = %e, "Hash persistence failed, continuing with in-memory dedup");
            }
        }

        let survivors: Vec<Record> = records
            .into_iter()
            .zip(kept.iter())
            .filter(|(_, keep)| **keep)
            .map(|(r, _)| r)
            .collect();

        let stats = DedupStats {
            original_count,
            kept_count: survivors.len(),
            level1_removed,
            level2_removed,
            processing_ms: start.elapsed().as_millis() as u64,
        };

        tracing::info!(
            batch_id = %batch_id,
            original_count = stats.original_count,
            kept_count = stats.kept_count,
            level1_removed = stats.level1_removed,
            level2_removed = stats.level2_removed,
            "Deduplication completed"
        );

        Ok(DedupOutcome {
            records: survivors,
            stats,
        })
    }

    fn hash_record(&self, record: &Record) -> String {
        match self.strategy {
            DedupStrategy::Aggressive => full_hash(record, self.options),
            _ => content_hash(record, &self.clean_fields, self.options),
        }
    }

    async fn hash_seen_before(
        &self,
        pool: &SqlitePool,
        batch_id: Uuid,
        hash: &str,
    ) -> Result<bool, sqlx::Error> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM dedup_hashes WHERE hash = ? AND kept = 1 AND batch_id != ? LIMIT 1",
        )
        .bind(hash)
        .bind(batch_id.to_string())
        .fetch_optional(pool)
        .await?;
        Ok(row.is_some())
    }

    async fn store_hashes(
        &self,
        pool: &SqlitePool,
        batch_id: Uuid,
        records: &[Record],
        hashes: &[String],
        kept: &[bool],
    ) -> Result<(), sqlx::Error> {
        let mut tx = pool.begin().await?;
        for i in 0..records.len() {
            sqlx::query(
                "INSERT INTO dedup_hashes (id, batch_id, hash, original_row_index, kept)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(batch_id.to_string())
            .bind(&hashes[i])
            .bind(records[i].row_index)
            .bind(kept[i])
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FieldValue;
    use std::collections::BTreeMap;

    fn record(row_index: i64, text: &str) -> Record {
        let mut r = Record::new(row_index, BTreeMap::new());
        r.cleaned
            .insert("cleanDescripcion".to_string(), FieldValue::Text(text.into()));
        r
    }

    fn fields() -> Vec<String> {
        vec!["cleanDescripcion".to_string()]
    }

    #[tokio::test]
    async fn test_preserve_all_is_identity() {
        let dedup = Deduplicator::new(
            None,
            DedupStrategy::PreserveAll,
            fields(),
            HashOptions::default(),
        );
        let records = vec![record(0, "a"), record(1, "a"), record(2, "a")];
        let outcome = dedup.dedupe(Uuid::new_v4(), records).await.unwrap();
        assert_eq!(outcome.records.len(), 3);
        assert_eq!(outcome.stats.level1_removed, 0);
    }

    #[tokio::test]
    async fn test_content_only_first_seen_wins() {
        let dedup = Deduplicator::new(
            None,
            DedupStrategy::ContentOnly,
            fields(),
            HashOptions::default(),
        );
        let records = vec![
            record(0, "promo tv"),
            record(1, "revista"),
            record(2, "promo tv"),
            record(3, "PROMO TV "),
        ];
        let outcome = dedup.dedupe(Uuid::new_v4(), records).await.unwrap();

        let indices: Vec<i64> = outcome.records.iter().map(|r| r.row_index).collect();
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(outcome.stats.level1_removed, 2);
        assert_eq!(outcome.stats.kept_count, 2);
        assert_eq!(outcome.stats.original_count, 4);
    }

    #[tokio::test]
    async fn test_empty_input_no_error() {
        let dedup = Deduplicator::new(
            None,
            DedupStrategy::ContentOnly,
            fields(),
            HashOptions::default(),
        );
        let outcome = dedup.dedupe(Uuid::new_v4(), Vec::new()).await.unwrap();
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.stats, DedupStats::default());
    }

    #[tokio::test]
    async fn test_aggressive_uses_all_fields() {
        let dedup = Deduplicator::new(
            None,
            DedupStrategy::Aggressive,
            fields(),
            HashOptions::default(),
        );
        let mut a = record(0, "promo tv");
        a.original
            .insert("Amount".to_string(), FieldValue::Number(1.0));
        let mut b = record(1, "promo tv");
        b.original
            .insert("Amount".to_string(), FieldValue::Number(2.0));

        let outcome = dedup.dedupe(Uuid::new_v4(), vec![a, b]).await.unwrap();
        // Same clean text, different amounts: both survive under aggressive
        assert_eq!(outcome.records.len(), 2);
    }
}
