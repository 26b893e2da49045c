//! Per-phase pipeline statistics
//!
//! Thread-safe counters for UI-facing progress summaries. Each phase owns a
//! small stats struct with a display string; the aggregate container hands
//! out locked updates.

use crate::dedup::DedupStats;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// CLEANING phase
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleaningStats {
    pub records_cleaned: usize,
    pub columns: usize,
}

impl CleaningStats {
    pub fn display_string(&self) -> String {
        format!(
            "{} records cleaned across {} columns",
            self.records_cleaned, self.columns
        )
    }
}

/// DEDUP phase
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DedupPhaseStats {
    pub original_count: usize,
    pub kept_count: usize,
    pub level1_removed: usize,
    pub level2_removed: usize,
}

impl DedupPhaseStats {
    pub fn display_string(&self) -> String {
        format!(
            "{} of {} records kept, {} batch duplicates, {} cross-batch duplicates",
            self.kept_count, self.original_count, self.level1_removed, self.level2_removed
        )
    }
}

impl From<&DedupStats> for DedupPhaseStats {
    fn from(stats: &DedupStats) -> Self {
        Self {
            original_count: stats.original_count,
            kept_count: stats.kept_count,
            level1_removed: stats.level1_removed,
            level2_removed: stats.level2_removed,
        }
    }
}

/// DISPATCH phase
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchStats {
    pub chunks_total: usize,
    pub chunks_done: usize,
    pub chunks_failed: usize,
    pub chunks_skipped: usize,
    pub repairs: usize,
    pub tokens_used: u64,
}

impl DispatchStats {
    pub fn display_string(&self) -> String {
        format!(
            "{} of {} chunks done, {} failed, {} skipped, {} repairs",
            self.chunks_done, self.chunks_total, self.chunks_failed, self.chunks_skipped, self.repairs
        )
    }
}

/// MERGE phase
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeStats {
    pub classifications_written: usize,
    pub placeholders: usize,
}

impl MergeStats {
    pub fn display_string(&self) -> String {
        format!(
            "{} classifications written, {} placeholders",
            self.classifications_written, self.placeholders
        )
    }
}

/// Aggregate statistics for one pipeline run
#[derive(Debug, Clone, Default)]
pub struct PipelineStatistics {
    pub cleaning: Arc<Mutex<CleaningStats>>,
    pub dedup: Arc<Mutex<DedupPhaseStats>>,
    pub dispatch: Arc<Mutex<DispatchStats>>,
    pub merge: Arc<Mutex<MergeStats>>,
}

impl PipelineStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cleaning(&self, records: usize, columns: usize) {
        let mut stats = self.cleaning.lock().unwrap();
        stats.records_cleaned = records;
        stats.columns = columns;
    }

    pub fn record_dedup(&self, dedup: &DedupStats) {
        *self.dedup.lock().unwrap() = DedupPhaseStats::from(dedup);
    }

    pub fn record_dispatch(
        &self,
        total: usize,
        done: usize,
        failed: usize,
        skipped: usize,
        repairs: usize,
        tokens_used: u64,
    ) {
        let mut stats = self.dispatch.lock().unwrap();
        stats.chunks_total = total;
        stats.chunks_done = done;
        stats.chunks_failed = failed;
        stats.chunks_skipped = skipped;
        stats.repairs = repairs;
        stats.tokens_used = tokens_used;
    }

    pub fn record_merge(&self, written: usize, placeholders: usize) {
        let mut stats = self.merge.lock().unwrap();
        stats.classifications_written = written;
        stats.placeholders = placeholders;
    }
}
