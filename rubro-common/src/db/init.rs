//! Database initialization
//!
//! Creates the SQLite schema on first run. All statements are idempotent
//! (`CREATE TABLE IF NOT EXISTS`), so calling this on an existing database is
//! safe.

use crate::Result;
use sqlx::SqlitePool;
use std::path::Path;
use tracing::info;

/// Initialize the database connection pool and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePool::connect(&db_url).await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    create_schema(&pool).await?;

    Ok(pool)
}

/// Initialize an in-memory database with the full schema (tests)
///
/// In-memory SQLite is per-connection, so the pool is pinned to a single
/// never-expiring connection; otherwise a second pooled connection would see
/// an empty database.
pub async fn init_memory_database() -> Result<SqlitePool> {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
    create_schema(&pool).await?;
    Ok(pool)
}

/// Create all tables and indexes (idempotent)
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_batches_table(pool).await?;
    create_classifications_table(pool).await?;
    create_dedup_hashes_table(pool).await?;
    create_validations_table(pool).await?;
    create_iterations_table(pool).await?;
    create_prompts_table(pool).await?;
    create_checkpoints_table(pool).await?;
    create_task_queue_table(pool).await?;
    Ok(())
}

async fn create_batches_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS batches (
            batch_id TEXT PRIMARY KEY,
            original_filename TEXT NOT NULL,
            file_hash TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL DEFAULT 'uploaded',
            total_records INTEGER NOT NULL DEFAULT 0,
            processed_records INTEGER NOT NULL DEFAULT 0,
            config TEXT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            completed_at TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_classifications_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS classifications (
            id TEXT PRIMARY KEY,
            batch_id TEXT NOT NULL REFERENCES batches(batch_id) ON DELETE CASCADE,
            row_index INTEGER NOT NULL,
            original_data TEXT NOT NULL,
            cleaned_data TEXT NOT NULL,
            category TEXT NOT NULL,
            reason TEXT NOT NULL DEFAULT '',
            score REAL NOT NULL,
            provider TEXT NOT NULL DEFAULT '',
            model TEXT NOT NULL DEFAULT '',
            tokens_used INTEGER NOT NULL DEFAULT 0,
            processing_time_ms INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (batch_id, row_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_classifications_category
         ON classifications (batch_id, category)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_dedup_hashes_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dedup_hashes (
            id TEXT PRIMARY KEY,
            batch_id TEXT NOT NULL REFERENCES batches(batch_id) ON DELETE CASCADE,
            hash TEXT NOT NULL,
            original_row_index INTEGER NOT NULL,
            kept INTEGER NOT NULL DEFAULT 1,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Universal-dedup lookups only ever ask about kept hashes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_dedup_hashes_kept
         ON dedup_hashes (hash) WHERE kept = 1",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_validations_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS validations (
            id TEXT PRIMARY KEY,
            batch_id TEXT NOT NULL REFERENCES batches(batch_id) ON DELETE CASCADE,
            classification_id TEXT NOT NULL UNIQUE
                REFERENCES classifications(id) ON DELETE CASCADE,
            sampling_strategy TEXT NOT NULL DEFAULT '',
            feedback TEXT NOT NULL,
            corrected_category TEXT,
            notes TEXT,
            idempotency_key TEXT UNIQUE,
            validated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_iterations_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS iterations (
            id TEXT PRIMARY KEY,
            batch_id TEXT NOT NULL REFERENCES batches(batch_id) ON DELETE CASCADE,
            iteration_number INTEGER NOT NULL,
            prompt_id TEXT,
            prompt_changes TEXT NOT NULL DEFAULT '',
            metrics TEXT,
            accuracy_delta REAL,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (batch_id, iteration_number)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_prompts_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS prompts (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            label TEXT NOT NULL UNIQUE,
            template TEXT NOT NULL,
            categories TEXT NOT NULL,
            is_default INTEGER NOT NULL DEFAULT 0,
            version INTEGER NOT NULL DEFAULT 1,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_checkpoints_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            batch_id TEXT PRIMARY KEY REFERENCES batches(batch_id) ON DELETE CASCADE,
            worker_id TEXT NOT NULL,
            total_chunks INTEGER NOT NULL,
            processed_chunks TEXT NOT NULL DEFAULT '[]',
            failed_chunks TEXT NOT NULL DEFAULT '[]',
            state TEXT,
            last_heartbeat TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            recovered_at TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_task_queue_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS task_queue (
            id TEXT PRIMARY KEY,
            queue TEXT NOT NULL DEFAULT 'default',
            task_type TEXT NOT NULL,
            unique_key TEXT,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'queued',
            attempts INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            run_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            claimed_by TEXT,
            claim_expires_at TIMESTAMP,
            last_error TEXT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_task_queue_claim
         ON task_queue (status, queue, run_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
