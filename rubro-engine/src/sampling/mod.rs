//! Validation sample generation
//!
//! Two strategies feed the human review queue: stratified sampling keeps the
//! sample's category mix proportional to the classification snapshot, and
//! confidence-filtered sampling surfaces the rows the model was least sure
//! about. Both honor an exclude set of already-validated rows so no human
//! sees the same row twice.

use crate::models::Classification;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{BTreeMap, HashSet};

/// Strategy labels recorded on validations
pub const STRATEGY_STRATIFIED: &str = "stratified";
pub const STRATEGY_CONFIDENCE: &str = "confidence_filtered";

/// Default confidence threshold below which a row is "low confidence"
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;

/// Proportional sample across categories
///
/// Each category contributes `round(target × count / total)` rows, drawn
/// without replacement. Rounding excess is reconciled against the largest
/// strata first so the sample lands exactly on `target` (or on the eligible
/// population when it is smaller).
pub fn stratified_sample<R: Rng>(
    classifications: &[Classification],
    target: usize,
    exclude: &HashSet<i64>,
    rng: &mut R,
) -> Vec<Classification> {
    let eligible: Vec<&Classification> = classifications
        .iter()
        .filter(|c| !exclude.contains(&c.row_index))
        .collect();
    if target == 0 || eligible.is_empty() {
        return Vec::new();
    }
    let target = target.min(eligible.len());
    let total = eligible.len() as f64;

    // Group by category; BTreeMap keeps quota assignment deterministic
    let mut strata: BTreeMap<&str, Vec<&Classification>> = BTreeMap::new();
    for c in &eligible {
        strata.entry(c.category.as_str()).or_default().push(c);
    }

    let mut quotas: BTreeMap<&str, usize> = strata
        .iter()
        .map(|(category, members)| {
            let share = target as f64 * members.len() as f64 / total;
            (*category, share.round() as usize)
        })
        .collect();

    // Rounding reconciliation: shrink the largest allocations, then grow the
    // largest strata that still have spare rows
    let mut allocated: usize = quotas.values().sum();
    while allocated > target {
        let largest = quotas
            .iter()
            .max_by_key(|(category, quota)| (**quota, std::cmp::Reverse(*category)))
            .map(|(category, _)| *category)
            .expect("non-empty quotas");
        *quotas.get_mut(largest).expect("key exists") -= 1;
        allocated -= 1;
    }
    while allocated < target {
        let growable = quotas
            .iter()
            .filter(|(category, quota)| strata[*category].len() > **quota)
            .max_by_key(|(category, _)| (strata[*category].len(), std::cmp::Reverse(*category)))
            .map(|(category, _)| *category);
        match growable {
            Some(category) => {
                *quotas.get_mut(category).expect("key exists") += 1;
                allocated += 1;
            }
            None => break,
        }
    }

    let mut sample = Vec::with_capacity(target);
    for (category, members) in &strata {
        let quota = quotas.get(category).copied().unwrap_or(0).min(members.len());
        sample.extend(
            members
                .choose_multiple(rng, quota)
                .map(|c| (*c).clone()),
        );
    }
    sample.sort_by_key(|c| c.row_index);
    sample
}

/// Low-confidence-first sample
///
/// Takes up to `target` rows with `score < threshold`; if that runs short,
/// pads with random rows from the confident remainder.
pub fn confidence_filtered_sample<R: Rng>(
    classifications: &[Classification],
    target: usize,
    threshold: f64,
    exclude: &HashSet<i64>,
    rng: &mut R,
) -> Vec<Classification> {
    let eligible: Vec<&Classification> = classifications
        .iter()
        .filter(|c| !exclude.contains(&c.row_index))
        .collect();
    if target == 0 || eligible.is_empty() {
        return Vec::new();
    }

    let (low, high): (Vec<&Classification>, Vec<&Classification>) =
        eligible.into_iter().partition(|c| c.score < threshold);

    let mut sample: Vec<Classification> = low
        .choose_multiple(rng, target.min(low.len()))
        .map(|c| (*c).clone())
        .collect();

    if sample.len() < target {
        let pad = target - sample.len();
        sample.extend(
            high.choose_multiple(rng, pad.min(high.len()))
                .map(|c| (*c).clone()),
        );
    }

    sample.sort_by_key(|c| c.row_index);
    sample
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeMap as Map;
    use uuid::Uuid;

    fn classification(row_index: i64, category: &str, score: f64) -> Classification {
        Classification {
            id: Uuid::new_v4(),
            batch_id: Uuid::nil(),
            row_index,
            original_data: Map::new(),
            cleaned_data: Map::new(),
            category: category.to_string(),
            reason: String::new(),
            score,
            provider: String::new(),
            model: String::new(),
            tokens_used: 0,
            processing_time_ms: 0,
            created_at: Utc::now(),
        }
    }

    /// 60 Pop, 30 Medios, 10 Otros
    fn snapshot() -> Vec<Classification> {
        let mut all = Vec::new();
        for i in 0..60 {
            all.push(classification(i, "Pop", 0.9));
        }
        for i in 60..90 {
            all.push(classification(i, "Medios", 0.8));
        }
        for i in 90..100 {
            all.push(classification(i, "Otros", 0.6));
        }
        all
    }

    #[test]
    fn test_stratified_proportions() {
        let mut rng = StdRng::seed_from_u64(7);
        let sample = stratified_sample(&snapshot(), 10, &HashSet::new(), &mut rng);

        assert_eq!(sample.len(), 10);
        let mut counts: Map<&str, usize> = Map::new();
        for c in &sample {
            *counts.entry(c.category.as_str()).or_default() += 1;
        }
        assert_eq!(counts["Pop"], 6);
        assert_eq!(counts["Medios"], 3);
        assert_eq!(counts["Otros"], 1);
    }

    #[test]
    fn test_stratified_rounding_reconciled_exactly() {
        // 3 categories of 1 each, target 2: naive rounding gives 3
        let all = vec![
            classification(0, "A", 0.9),
            classification(1, "B", 0.9),
            classification(2, "C", 0.9),
        ];
        let mut rng = StdRng::seed_from_u64(1);
        let sample = stratified_sample(&all, 2, &HashSet::new(), &mut rng);
        assert_eq!(sample.len(), 2);
    }

    #[test]
    fn test_stratified_honors_exclude_set() {
        let mut rng = StdRng::seed_from_u64(3);
        let exclude: HashSet<i64> = (0..60).collect(); // every Pop row
        let sample = stratified_sample(&snapshot(), 10, &exclude, &mut rng);

        assert_eq!(sample.len(), 10);
        assert!(sample.iter().all(|c| c.category != "Pop"));
        assert!(sample.iter().all(|c| !exclude.contains(&c.row_index)));
    }

    #[test]
    fn test_stratified_without_replacement() {
        let mut rng = StdRng::seed_from_u64(11);
        let sample = stratified_sample(&snapshot(), 100, &HashSet::new(), &mut rng);
        let unique: HashSet<i64> = sample.iter().map(|c| c.row_index).collect();
        assert_eq!(unique.len(), sample.len());
    }

    #[test]
    fn test_stratified_target_larger_than_population() {
        let all = vec![classification(0, "Pop", 0.9), classification(1, "Pop", 0.9)];
        let mut rng = StdRng::seed_from_u64(5);
        let sample = stratified_sample(&all, 50, &HashSet::new(), &mut rng);
        assert_eq!(sample.len(), 2);
    }

    #[test]
    fn test_confidence_filter_prefers_low_scores() {
        let mut all = snapshot(); // all scores >= 0.6
        all.push(classification(100, "Pop", 0.2));
        all.push(classification(101, "Medios", -1.0));

        let mut rng = StdRng::seed_from_u64(9);
        let sample = confidence_filtered_sample(
            &all,
            3,
            DEFAULT_CONFIDENCE_THRESHOLD,
            &HashSet::new(),
            &mut rng,
        );

        assert_eq!(sample.len(), 3);
        // The three sub-threshold rows are 0.6-scored Otros, 0.2, and -1.0;
        // all picks must come from below the threshold
        assert!(sample.iter().all(|c| c.score < 0.7));
    }

    #[test]
    fn test_confidence_filter_pads_from_confident_remainder() {
        let all = vec![
            classification(0, "Pop", 0.2),
            classification(1, "Pop", 0.95),
            classification(2, "Pop", 0.96),
        ];
        let mut rng = StdRng::seed_from_u64(2);
        let sample =
            confidence_filtered_sample(&all, 3, 0.7, &HashSet::new(), &mut rng);

        assert_eq!(sample.len(), 3);
        assert!(sample.iter().any(|c| c.score == 0.2));
    }

    #[test]
    fn test_empty_inputs() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(stratified_sample(&[], 10, &HashSet::new(), &mut rng).is_empty());
        assert!(confidence_filtered_sample(&[], 10, 0.7, &HashSet::new(), &mut rng).is_empty());
        assert!(stratified_sample(&snapshot(), 0, &HashSet::new(), &mut rng).is_empty());
    }
}
