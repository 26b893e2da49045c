//! Comparative iteration metrics
//!
//! Accuracy is computed over the non-ambiguous set only: records carrying
//! the -1 sentinel are excluded from accuracy and counted in the ambiguity
//! rate instead. Comparisons weigh accuracy, ambiguity reduction, and time
//! into one configurable improvement score.

use crate::models::Classification;
use rubro_common::config::MetricsWeights;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Score at or above which a non-ambiguous classification counts as accurate
pub const ACCURACY_THRESHOLD: f64 = 0.7;

/// Snapshot of one iteration's classification quality
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationMetrics {
    pub total: usize,
    /// |score ≥ 0.7| / |score ≠ -1|; zero when everything is ambiguous
    pub accuracy: f64,
    /// |score = -1| / total
    pub ambiguity_rate: f64,
    pub category_distribution: BTreeMap<String, usize>,
    pub processing_ms: u64,
}

impl IterationMetrics {
    pub fn compute(classifications: &[Classification], processing_ms: u64) -> Self {
        let total = classifications.len();
        let ambiguous = classifications.iter().filter(|c| c.is_ambiguous()).count();
        let scored = total - ambiguous;
        let accurate = classifications
            .iter()
            .filter(|c| !c.is_ambiguous() && c.score >= ACCURACY_THRESHOLD)
            .count();

        let mut category_distribution: BTreeMap<String, usize> = BTreeMap::new();
        for c in classifications {
            *category_distribution.entry(c.category.clone()).or_default() += 1;
        }

        Self {
            total,
            accuracy: if scored > 0 {
                accurate as f64 / scored as f64
            } else {
                0.0
            },
            ambiguity_rate: if total > 0 {
                ambiguous as f64 / total as f64
            } else {
                0.0
            },
            category_distribution,
            processing_ms,
        }
    }
}

/// Baseline-vs-refined comparison
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub accuracy_delta: f64,
    pub ambiguity_delta: f64,
    pub time_delta_ms: i64,
    /// category → (baseline count, refined count)
    pub distribution_shift: BTreeMap<String, (usize, usize)>,
    /// Weighted sum of accuracy gain, ambiguity reduction, and time gain
    pub overall_improvement: f64,
    /// Informational only; never control flow
    pub recommendations: Vec<String>,
}

/// Compare a refined iteration against its baseline
pub fn compare(
    baseline: &IterationMetrics,
    refined: &IterationMetrics,
    weights: &MetricsWeights,
) -> ComparisonReport {
    let accuracy_delta = refined.accuracy - baseline.accuracy;
    let ambiguity_delta = refined.ambiguity_rate - baseline.ambiguity_rate;
    let time_delta_ms = refined.processing_ms as i64 - baseline.processing_ms as i64;

    let mut categories: BTreeMap<String, (usize, usize)> = BTreeMap::new();
    for (category, count) in &baseline.category_distribution {
        categories.entry(category.clone()).or_insert((0, 0)).0 = *count;
    }
    for (category, count) in &refined.category_distribution {
        categories.entry(category.clone()).or_insert((0, 0)).1 = *count;
    }

    // Time gain normalized to the baseline duration, clamped to [-1, 1]
    let time_gain = if baseline.processing_ms > 0 {
        (-(time_delta_ms as f64) / baseline.processing_ms as f64).clamp(-1.0, 1.0)
    } else {
        0.0
    };

    let overall_improvement = weights.accuracy * accuracy_delta
        + weights.ambiguity_reduction * (-ambiguity_delta)
        + weights.time * time_gain;

    let mut recommendations = Vec::new();
    if accuracy_delta >= 0.05 {
        recommendations.push("Accuracy improved significantly".to_string());
    } else if accuracy_delta <= -0.05 {
        recommendations.push("Accuracy regressed; review the new counter-examples".to_string());
    }
    if ambiguity_delta <= -0.05 {
        recommendations.push("Ambiguity reduced significantly".to_string());
    } else if ambiguity_delta >= 0.05 {
        recommendations.push("Ambiguity increased; categories may be overlapping".to_string());
    }
    if overall_improvement > 0.0 {
        recommendations.push("Refined prompt recommended".to_string());
    } else {
        recommendations.push("Keep the baseline prompt".to_string());
    }

    ComparisonReport {
        accuracy_delta,
        ambiguity_delta,
        time_delta_ms,
        distribution_shift: categories,
        overall_improvement,
        recommendations,
    }
}
