//! Engine error taxonomy
//!
//! Failures split into four families with different propagation rules:
//! transient provider errors are retried inside the dispatcher and never
//! escape it; chunk failures surface as placeholder classifications;
//! data-quality errors reject a chunk before dispatch; fatal errors abort
//! the batch.

use thiserror::Error;

/// Batch-level engine errors
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed input caught before dispatch (empty clean fields,
    /// duplicate row_index within a chunk, bad chunk size)
    #[error("data quality: {0}")]
    DataQuality(String),

    /// Aborts the batch: auth failure, missing configuration,
    /// unresolved provider
    #[error("fatal: {0}")]
    Fatal(String),

    #[error(transparent)]
    Common(#[from] rubro_common::Error),
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        EngineError::Common(rubro_common::Error::Database(e))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Common(rubro_common::Error::Serialization(e))
    }
}
