//! Prompt refinement from validated examples
//!
//! Pure compilation: `(prompt, validated examples) → refined prompt text`.
//! Incorrect verdicts become counter-examples labeled with their corrected
//! category; correct verdicts become positive examples. Identical inputs
//! always produce byte-identical output, so re-running refinement is safe.

use crate::models::{Feedback, Prompt};

/// One validated classification, reduced to what the prompt needs
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedExample {
    /// Primary clean-field text the human saw
    pub text: String,
    /// Category the model predicted
    pub predicted_category: String,
    /// Category the human assigned, when the prediction was wrong
    pub corrected_category: Option<String>,
    pub feedback: Feedback,
}

/// Compile a refined prompt from the base prompt and validated examples
pub fn refine_prompt(prompt: &Prompt, examples: &[ValidatedExample]) -> String {
    let mut text = prompt.compile();

    let mut correct: Vec<&ValidatedExample> = examples
        .iter()
        .filter(|e| e.feedback == Feedback::Correct)
        .collect();
    let mut incorrect: Vec<&ValidatedExample> = examples
        .iter()
        .filter(|e| e.feedback == Feedback::Incorrect && e.corrected_category.is_some())
        .collect();

    // Deterministic ordering regardless of validation arrival order
    correct.sort_by(|a, b| a.text.cmp(&b.text));
    correct.dedup_by(|a, b| a.text == b.text);
    incorrect.sort_by(|a, b| a.text.cmp(&b.text));
    incorrect.dedup_by(|a, b| a.text == b.text);

    if !correct.is_empty() {
        text.push_str("\n\nEjemplos confirmados:\n");
        for example in &correct {
            text.push_str(&format!(
                "- \"{}\" → {}\n",
                example.text, example.predicted_category
            ));
        }
    }

    if !incorrect.is_empty() {
        text.push_str("\n\nErrores a evitar:\n");
        for example in &incorrect {
            let corrected = example
                .corrected_category
                .as_deref()
                .expect("filtered on corrected_category");
            text.push_str(&format!(
                "- \"{}\" NO es {}; clasificar como {}\n",
                example.text, example.predicted_category, corrected
            ));
        }
    }

    text
}

/// Short human-readable summary of what refinement changed
pub fn describe_changes(examples: &[ValidatedExample]) -> String {
    let correct = examples
        .iter()
        .filter(|e| e.feedback == Feedback::Correct)
        .count();
    let incorrect = examples
        .iter()
        .filter(|e| e.feedback == Feedback::Incorrect)
        .count();
    format!(
        "{} positive examples, {} counter-examples from validation",
        correct, incorrect
    )
}
