//! Reusable text processing steps
//!
//! Each method is one transformation `&str -> String`, independently
//! testable. A version pipeline composes an ordered subset of them.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

/// Common UTF-8 byte sequences misdecoded as Latin-1/Windows-1252, paired
/// with the character they originally encoded. Longest sequences first so
/// partial matches never shadow full ones.
const MOJIBAKE_TABLE: &[(&str, &str)] = &[
    ("\u{c3}\u{a1}", "á"),
    ("\u{c3}\u{a9}", "é"),
    ("\u{c3}\u{ad}", "í"),
    ("\u{c3}\u{b3}", "ó"),
    ("\u{c3}\u{ba}", "ú"),
    ("\u{c3}\u{b1}", "ñ"),
    ("\u{c3}\u{bc}", "ü"),
    ("\u{c3}\u{81}", "Á"),
    ("\u{c3}\u{89}", "É"),
    ("\u{c3}\u{8d}", "Í"),
    ("\u{c3}\u{93}", "Ó"),
    ("\u{c3}\u{9a}", "Ú"),
    ("\u{c3}\u{91}", "Ñ"),
    ("\u{c3}\u{9c}", "Ü"),
];

static PREFIXED_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^[A-Z]+\d+-\d+\s*").unwrap());
static PERIOD_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^P\d+(-\d+)?$").unwrap());
static MULTI_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static TRAILING_DOTS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.\s]+$").unwrap());

/// Configuration for the processing steps
///
/// The keep/remove word lists, separator set, and solicitor patterns are
/// business configuration; the step order is owned by the version pipeline.
#[derive(Debug, Clone)]
pub struct RefineryConfig {
    /// Characters that survive the charset filter
    pub allowed_chars: String,
    /// Tokens exempt from the token-level removal filters
    pub to_keep: Vec<String>,
    /// Stopwords removed outright (months, short connectors)
    pub to_remove: Vec<String>,
    /// Minimum token length
    pub min_len: usize,
    /// Characters replaced by spaces
    pub sep_chars: String,
    pub separator_replacement: String,
    /// Characters counting as vowels for the vowel-less filter
    pub vowels: String,
    /// Trailing solicitor clauses, as regex sources applied in order
    pub solicitor_patterns: Vec<String>,
}

impl Default for RefineryConfig {
    fn default() -> Self {
        Self {
            allowed_chars:
                "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyzÑñ0123456789 ".to_string(),
            to_keep: [
                "SI", "NO", "GPS", "MPLS", "DSL", "MXN", "MXP", "USD", "RX", "TC", "TG", "TV",
                "POP", "MEDIOS", "36ROJBRINDIS",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            to_remove: [
                "ENERO",
                "FEBRERO",
                "MARZO",
                "ABRIL",
                "MAYO",
                "JUNIO",
                "JULIO",
                "AGOSTO",
                "SEPTIEMBRE",
                "OCTUBRE",
                "NOVIEMBRE",
                "DICIEMBRE",
                "ENE",
                "FEB",
                "MAR",
                "ABR",
                "MAY",
                "JUN",
                "JUL",
                "AGO",
                "SEP",
                "OCT",
                "NOV",
                "DIC",
                "DE",
                "DEL",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            min_len: 3,
            sep_chars: ".,-/+&|".to_string(),
            separator_replacement: " ".to_string(),
            vowels: "AEIOUaeiouYy".to_string(),
            solicitor_patterns: vec![
                // Named solicitor clauses run to end of line
                r"(?i)\.SOL\.\s*JESUS\s+TREVI\S*.*".to_string(),
                r"(?i)\.SOL\.\s*SUSANA\b.*".to_string(),
                r"(?i)\.SOL\.\s*DULCE\s+GUILLEN.*".to_string(),
                r"(?i)\.SOL\.\s*LIGIA\s+LOPEZ.*".to_string(),
                r"(?i)[.\s]SOL\s+JESUS\s+TREVI\S*.*".to_string(),
                r"(?i)[.\s]SOL\s+SUSANA\s+SILVA.*".to_string(),
                r"(?i)[.\s]SOL\s+DULCE\s+GUILLEN.*".to_string(),
                r"(?i)[.\s]SOL\s+LIGIA\s+LOPEZ.*".to_string(),
                r"(?i)\.P\d{1,2}\.SOL\b".to_string(),
                // Generic marker cleanup
                r"(?i)\.SOL\.\s*".to_string(),
                r"(?i)\.\s+SOL\s*".to_string(),
            ],
        }
    }
}

/// Compiled processing steps bound to one configuration
pub struct ProcessingSteps {
    config: RefineryConfig,
    to_keep: HashSet<String>,
    to_remove: HashSet<String>,
    solicitor: Vec<Regex>,
}

impl ProcessingSteps {
    pub fn new(config: RefineryConfig) -> Self {
        let to_keep = config.to_keep.iter().map(|w| w.to_uppercase()).collect();
        let to_remove = config.to_remove.iter().map(|w| w.to_uppercase()).collect();
        let solicitor = config
            .solicitor_patterns
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect();
        Self {
            config,
            to_keep,
            to_remove,
            solicitor,
        }
    }

    pub fn config(&self) -> &RefineryConfig {
        &self.config
    }

    fn is_kept(&self, word: &str) -> bool {
        self.to_keep.contains(&word.to_uppercase())
    }

    /// Repair UTF-8 text that was decoded as Latin-1 somewhere upstream
    pub fn fix_mojibake(&self, text: &str) -> String {
        if !text.contains('\u{c3}') {
            return text.to_string();
        }
        let mut result = text.to_string();
        for (bad, good) in MOJIBAKE_TABLE {
            result = result.replace(bad, good);
        }
        result
    }

    /// Remove prefixed codes like `PF047-0187` at the head of the text
    pub fn remove_prefixed_codes(&self, text: &str) -> String {
        PREFIXED_CODE.replace(text, "").trim().to_string()
    }

    /// Fold Spanish accents to their base vowels, preserving `ñ`/`Ñ`
    pub fn normalize_accents(&self, text: &str) -> String {
        text.chars()
            .map(|c| match c {
                'á' | 'à' => 'a',
                'é' | 'è' => 'e',
                'í' | 'ì' => 'i',
                'ó' | 'ò' => 'o',
                'ú' | 'ù' | 'ü' => 'u',
                'Á' | 'À' => 'A',
                'É' | 'È' => 'E',
                'Í' | 'Ì' => 'I',
                'Ó' | 'Ò' => 'O',
                'Ú' | 'Ù' | 'Ü' => 'U',
                other => other,
            })
            .collect()
    }

    pub fn uppercase(&self, text: &str) -> String {
        text.to_uppercase()
    }

    pub fn lowercase(&self, text: &str) -> String {
        text.to_lowercase()
    }

    /// Strip trailing solicitor clauses (configured pattern set)
    pub fn remove_trailing_solicitor(&self, text: &str) -> String {
        let mut result = text.to_string();
        if result.to_uppercase().contains("SOL") {
            for re in &self.solicitor {
                result = re.replace_all(&result, "").trim().to_string();
            }
        }
        TRAILING_DOTS.replace(&result, "").trim().to_string()
    }

    /// Replace separator characters with spaces
    pub fn replace_separators(&self, text: &str) -> String {
        text.chars()
            .map(|c| {
                if self.config.sep_chars.contains(c) {
                    self.config
                        .separator_replacement
                        .chars()
                        .next()
                        .unwrap_or(' ')
                } else {
                    c
                }
            })
            .collect()
    }

    /// Collapse runs of whitespace into single spaces
    pub fn collapse_whitespace(&self, text: &str) -> String {
        MULTI_WHITESPACE.replace_all(text, " ").trim().to_string()
    }

    /// Drop characters outside the allowed set
    pub fn strip_to_charset(&self, text: &str) -> String {
        text.chars()
            .filter(|c| self.config.allowed_chars.contains(*c))
            .collect()
    }

    /// Remove stopwords (months, short connectors)
    pub fn remove_stopwords(&self, text: &str) -> String {
        self.filter_tokens(text, |word| !self.to_remove.contains(&word.to_uppercase()))
    }

    /// Remove period/project codes like P1, P2024, P1-2
    pub fn remove_period_codes(&self, text: &str) -> String {
        self.filter_tokens(text, |word| {
            !PERIOD_CODE.is_match(word) || self.is_kept(word)
        })
    }

    /// Remove tokens mixing letters and digits
    pub fn remove_alphanumeric_tokens(&self, text: &str) -> String {
        self.filter_tokens(text, |word| !is_alphanumeric(word) || self.is_kept(word))
    }

    /// Remove purely numeric tokens
    pub fn remove_numeric_tokens(&self, text: &str) -> String {
        self.filter_tokens(text, |word| !is_numeric(word) || self.is_kept(word))
    }

    /// Remove tokens shorter than the configured minimum
    pub fn remove_short_tokens(&self, text: &str) -> String {
        self.filter_tokens(text, |word| {
            word.chars().count() >= self.config.min_len || self.is_kept(word)
        })
    }

    /// Remove tokens with no vowel at all
    pub fn remove_vowelless_tokens(&self, text: &str) -> String {
        self.filter_tokens(text, |word| {
            word.chars().any(|c| self.config.vowels.contains(c)) || self.is_kept(word)
        })
    }

    fn filter_tokens<F: Fn(&str) -> bool>(&self, text: &str, keep: F) -> String {
        text.split_whitespace()
            .filter(|w| keep(w))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn is_alphanumeric(word: &str) -> bool {
    let has_letter = word.chars().any(|c| c.is_alphabetic());
    let has_digit = word.chars().any(|c| c.is_ascii_digit());
    has_letter && has_digit
}

fn is_numeric(word: &str) -> bool {
    !word.is_empty() && word.chars().all(|c| c.is_ascii_digit())
}
