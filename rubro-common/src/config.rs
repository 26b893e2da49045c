//! Configuration loading for rubro services
//!
//! Settings resolve with ENV over TOML over compiled defaults. The TOML file
//! is optional; a missing file yields the defaults with a log line, never an
//! error.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

/// LLM dispatch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Records per chunk
    pub chunk_size: usize,
    /// Maximum in-flight provider requests per batch
    pub concurrency_limit: usize,
    /// Retry budget per chunk before it is declared failed
    pub max_retries: u32,
    /// Per-request provider timeout in seconds
    pub timeout_s: u64,
    /// Provider identifier resolved by the factory ("openai", "gemini")
    pub provider: String,
    /// Model name passed through to the provider
    pub model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            chunk_size: 50,
            concurrency_limit: 3,
            max_retries: 3,
            timeout_s: 30,
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
        }
    }
}

/// Deduplication settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// preserve_all | content_only | aggressive | universal
    pub strategy: String,
    pub case_sensitive: bool,
    pub trim_whitespace: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            strategy: "content_only".to_string(),
            case_sensitive: false,
            trim_whitespace: true,
        }
    }
}

/// Refinery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefineryConfigSection {
    /// Registered refinery version id
    pub version: String,
}

impl Default for RefineryConfigSection {
    fn default() -> Self {
        Self {
            version: "v1".to_string(),
        }
    }
}

/// Checkpoint / recovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Heartbeat refresh interval in seconds
    pub heartbeat_s: u64,
    /// Checkpoints with heartbeats older than this are orphans
    pub orphan_after_s: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            heartbeat_s: 30,
            orphan_after_s: 120,
        }
    }
}

/// Weights for the overall improvement score
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsWeights {
    pub accuracy: f64,
    pub ambiguity_reduction: f64,
    pub time: f64,
}

impl Default for MetricsWeights {
    fn default() -> Self {
        Self {
            accuracy: 0.6,
            ambiguity_reduction: 0.3,
            time: 0.1,
        }
    }
}

/// Queue backpressure settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Chunk emission pauses while depth exceeds this
    pub high_water_mark: usize,
    /// Emission resumes once depth falls below this
    pub low_water_mark: usize,
    /// Seconds a duplicate enqueue of the same task key is suppressed
    pub unique_window_s: u64,
    /// Graceful shutdown budget for in-flight tasks
    pub shutdown_timeout_s: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            high_water_mark: 200,
            low_water_mark: 50,
            unique_window_s: 60,
            shutdown_timeout_s: 25,
        }
    }
}

/// Top-level service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RubroConfig {
    /// SQLite database path ("sqlite::memory:" allowed for tests)
    pub database_path: Option<String>,
    pub llm: LlmConfig,
    pub dedup: DedupConfig,
    pub refinery: RefineryConfigSection,
    pub checkpoint: CheckpointConfig,
    pub metrics: MetricsWeights,
    pub queue: QueueConfig,
    /// Provider API keys by provider id; env vars take priority
    pub api_keys: HashMap<String, String>,
}

impl RubroConfig {
    /// Load configuration from a TOML file, falling back to defaults when the
    /// file is absent. Parse failures are real errors; a missing file is not.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let parsed: RubroConfig = toml::from_str(&content)
                .map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))?;
            info!(path = %path.display(), "Configuration loaded from TOML");
            parsed
        } else {
            info!(path = %path.display(), "No config file, using defaults");
            RubroConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Resolve a provider API key: ENV (`RUBRO_<PROVIDER>_API_KEY`) over TOML.
    pub fn api_key(&self, provider: &str) -> Option<String> {
        let env_name = format!("RUBRO_{}_API_KEY", provider.to_uppercase());
        if let Ok(key) = std::env::var(&env_name) {
            if !key.trim().is_empty() {
                return Some(key);
            }
        }
        self.api_keys
            .get(provider)
            .filter(|k| !k.trim().is_empty())
            .cloned()
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse::<usize>("RUBRO_LLM_CHUNK_SIZE") {
            self.llm.chunk_size = v;
        }
        if let Some(v) = env_parse::<usize>("RUBRO_LLM_CONCURRENCY_LIMIT") {
            self.llm.concurrency_limit = v;
        }
        if let Some(v) = env_parse::<u32>("RUBRO_LLM_MAX_RETRIES") {
            self.llm.max_retries = v;
        }
        if let Some(v) = env_parse::<u64>("RUBRO_LLM_TIMEOUT_S") {
            self.llm.timeout_s = v;
        }
        if let Ok(v) = std::env::var("RUBRO_LLM_PROVIDER") {
            self.llm.provider = v;
        }
        if let Ok(v) = std::env::var("RUBRO_LLM_MODEL") {
            self.llm.model = v;
        }
        if let Ok(v) = std::env::var("RUBRO_DEDUP_STRATEGY") {
            self.dedup.strategy = v;
        }
        if let Ok(v) = std::env::var("RUBRO_DATABASE_PATH") {
            self.database_path = Some(v);
        }
        if let Some(v) = env_parse::<u64>("RUBRO_CHECKPOINT_HEARTBEAT_S") {
            self.checkpoint.heartbeat_s = v;
        }
        if let Some(v) = env_parse::<u64>("RUBRO_CHECKPOINT_ORPHAN_AFTER_S") {
            self.checkpoint.orphan_after_s = v;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.llm.chunk_size == 0 {
            return Err(Error::Config("llm.chunk_size must be positive".to_string()));
        }
        if self.llm.concurrency_limit == 0 {
            return Err(Error::Config(
                "llm.concurrency_limit must be positive".to_string(),
            ));
        }
        if self.queue.low_water_mark >= self.queue.high_water_mark {
            return Err(Error::Config(
                "queue.low_water_mark must be below queue.high_water_mark".to_string(),
            ));
        }
        match self.dedup.strategy.as_str() {
            "preserve_all" | "content_only" | "aggressive" | "universal" => {}
            other => {
                return Err(Error::Config(format!(
                    "unknown dedup.strategy: {}",
                    other
                )))
            }
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    match std::env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(var = name, value = %raw, "Ignoring unparseable env override");
                None
            }
        },
        Err(_) => None,
    }
}
