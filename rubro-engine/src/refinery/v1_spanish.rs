//! Version 1 Spanish refinery
//!
//! Cleans Mexican expense-ledger line items: mojibake repair, code and
//! solicitor stripping, accent folding, token-level noise filters. The
//! preserve list exempts business terms from the token filters.

use super::steps::{ProcessingSteps, RefineryConfig};
use super::Refinery;

type StepFn = fn(&ProcessingSteps, &str) -> String;

/// The v1 pipeline: an ordered, named sequence of steps
pub struct RefineryV1Spanish {
    steps: ProcessingSteps,
    pipeline: Vec<(&'static str, StepFn)>,
}

impl RefineryV1Spanish {
    pub fn new() -> Self {
        Self::with_config(RefineryConfig::default())
    }

    pub fn with_config(config: RefineryConfig) -> Self {
        let pipeline: Vec<(&'static str, StepFn)> = vec![
            ("fix_mojibake", |s, t| s.fix_mojibake(t)),
            ("remove_prefixed_codes", |s, t| s.remove_prefixed_codes(t)),
            ("normalize_accents", |s, t| s.normalize_accents(t)),
            ("uppercase", |s, t| s.uppercase(t)),
            ("remove_trailing_solicitor", |s, t| {
                s.remove_trailing_solicitor(t)
            }),
            ("replace_separators", |s, t| s.replace_separators(t)),
            ("collapse_whitespace", |s, t| s.collapse_whitespace(t)),
            ("strip_to_charset", |s, t| s.strip_to_charset(t)),
            ("remove_stopwords", |s, t| s.remove_stopwords(t)),
            ("remove_period_codes", |s, t| s.remove_period_codes(t)),
            ("remove_alphanumeric_tokens", |s, t| {
                s.remove_alphanumeric_tokens(t)
            }),
            ("remove_numeric_tokens", |s, t| s.remove_numeric_tokens(t)),
            ("remove_short_tokens", |s, t| s.remove_short_tokens(t)),
            ("remove_vowelless_tokens", |s, t| s.remove_vowelless_tokens(t)),
            ("lowercase", |s, t| s.lowercase(t)),
        ];

        Self {
            steps: ProcessingSteps::new(config),
            pipeline,
        }
    }
}

impl Default for RefineryV1Spanish {
    fn default() -> Self {
        Self::new()
    }
}

impl Refinery for RefineryV1Spanish {
    fn version(&self) -> &str {
        "v1"
    }

    fn name(&self) -> &str {
        "Spanish expense-ledger cleaning"
    }

    fn process(&self, text: &str) -> String {
        let mut current = text.to_string();
        for (_, step) in &self.pipeline {
            current = step(&self.steps, &current);
        }
        current
    }

    fn step_names(&self) -> Vec<&'static str> {
        self.pipeline.iter().map(|(name, _)| *name).collect()
    }
}
