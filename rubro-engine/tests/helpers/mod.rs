//! Shared test fixtures: in-memory store setup and a mock LLM provider
#![allow(dead_code)]

use async_trait::async_trait;
use rubro_engine::models::{Batch, FieldValue, Record};
use rubro_engine::providers::{
    CompletionRequest, CompletionResponse, LlmProvider, ProviderError,
};
use sqlx::SqlitePool;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

/// Classification rule: clean text → (category, score)
pub type ClassifyFn = Box<dyn Fn(&str) -> (String, f64) + Send + Sync>;

/// Mock provider
///
/// By default it echoes a well-formed result per payload record using the
/// classify rule. Scripted replies (popped front first) override whole
/// responses to exercise failure and repair paths.
pub struct MockProvider {
    classify: ClassifyFn,
    scripted: Mutex<VecDeque<Result<String, ProviderError>>>,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl MockProvider {
    pub fn echo() -> Self {
        Self::with_rule(Box::new(|_| ("Pop".to_string(), 0.9)))
    }

    pub fn with_rule(classify: ClassifyFn) -> Self {
        Self {
            classify,
            scripted: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Queue one scripted reply; consumed before the echo rule applies
    pub fn push_reply(&self, reply: Result<String, ProviderError>) {
        self.scripted.lock().unwrap().push_back(reply);
    }

    fn payload_records(content: &str) -> Vec<serde_json::Value> {
        let start = match content.find("[{") {
            Some(start) => start,
            None => return Vec::new(),
        };
        serde_json::from_str(&content[start..]).unwrap_or_default()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn provider_id(&self) -> &'static str {
        "mock"
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(reply) = self.scripted.lock().unwrap().pop_front() {
            return reply.map(|content| CompletionResponse {
                content,
                tokens_used: 10,
                id: "scripted".to_string(),
            });
        }

        let records = Self::payload_records(&request.messages[0].content);
        let results: Vec<serde_json::Value> = records
            .iter()
            .map(|record| {
                let text = record["data"]
                    .as_object()
                    .and_then(|data| data.values().next())
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let (category, score) = (self.classify)(text);
                let field = record["data"]
                    .as_object()
                    .and_then(|data| data.keys().next().cloned())
                    .unwrap_or_else(|| "cleanDescripcion".to_string());
                serde_json::json!({
                    field: text,
                    "category": category,
                    "reason": format!("clasificado como {}", category),
                    "score": score,
                })
            })
            .collect();

        Ok(CompletionResponse {
            content: serde_json::json!({ "results": results }).to_string(),
            tokens_used: 10 * results.len().max(1) as u64,
            id: "mock".to_string(),
        })
    }

    async fn validate_api_key(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// In-memory database with the full schema
pub async fn test_pool() -> SqlitePool {
    rubro_common::db::init_memory_database().await.unwrap()
}

/// Insert a batch row configured for one clean column
pub async fn insert_batch(pool: &SqlitePool) -> Batch {
    let batch = Batch::new(
        "gastos.xlsx".to_string(),
        Uuid::new_v4().to_string(),
        serde_json::json!({
            "columns": ["Descripcion"],
            "model": "mock-model",
        }),
    );
    sqlx::query(
        "INSERT INTO batches (batch_id, original_filename, file_hash, status, config)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(batch.batch_id.to_string())
    .bind(&batch.original_filename)
    .bind(&batch.file_hash)
    .bind(batch.status.as_str())
    .bind(batch.config.to_string())
    .execute(pool)
    .await
    .unwrap();
    batch
}

/// Records carrying one source column
pub fn records_of(texts: &[&str]) -> Vec<Record> {
    texts
        .iter()
        .enumerate()
        .map(|(i, text)| {
            let mut original = BTreeMap::new();
            original.insert("Descripcion".to_string(), FieldValue::Text(text.to_string()));
            Record::new(i as i64, original)
        })
        .collect()
}
