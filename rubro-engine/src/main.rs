//! rubro-engine worker binary
//!
//! Wires configuration, database, event bus, task queue, recovery monitor,
//! and the claim/process worker loop. Batches arrive as queue tasks carrying
//! parsed record streams; results land in the classifications table.

use anyhow::Result;
use rubro_common::config::RubroConfig;
use rubro_common::events::EventBus;
use rubro_engine::dispatcher::DispatcherConfig;
use rubro_engine::checkpoint::RecoveryMonitor;
use rubro_engine::dedup::{DedupStrategy, HashOptions};
use rubro_engine::pipeline::PipelineConfig;
use rubro_engine::providers::ProviderFactory;
use rubro_engine::queue::TaskQueue;
use rubro_engine::worker::{ensure_default_prompt, Worker};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting rubro-engine worker");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::var("RUBRO_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("rubro.toml"));
    let config = RubroConfig::load(&config_path)?;

    let db_path = config
        .database_path
        .clone()
        .unwrap_or_else(|| "rubro.db".to_string());
    info!("Database: {}", db_path);
    let pool = rubro_common::db::init_database(&PathBuf::from(&db_path)).await?;

    let event_bus = EventBus::new(1000);
    let queue = TaskQueue::new(
        pool.clone(),
        Duration::from_secs(config.queue.unique_window_s),
    );

    let provider = ProviderFactory::create(
        &config.llm.provider,
        config.api_key(&config.llm.provider),
    )?;
    info!(provider = provider.provider_id(), model = %config.llm.model, "Provider resolved");

    ensure_default_prompt(&pool).await?;

    let worker_id = format!(
        "{}-{}",
        hostname(),
        &Uuid::new_v4().to_string()[..8]
    );
    info!(worker_id = %worker_id, "Worker identity assigned");

    let shutdown = CancellationToken::new();

    // Recovery monitor: finds stale checkpoints and re-enqueues their work
    let monitor = RecoveryMonitor::new(
        pool.clone(),
        queue.clone(),
        event_bus.clone(),
        Duration::from_secs(config.checkpoint.orphan_after_s),
        Duration::from_secs(config.checkpoint.heartbeat_s),
    );
    monitor.spawn(shutdown.clone());

    let pipeline_config = PipelineConfig {
        columns: Vec::new(), // resolved per batch from its config
        refinery_version: config.refinery.version.clone(),
        dedup_strategy: DedupStrategy::parse(&config.dedup.strategy)
            .unwrap_or(DedupStrategy::ContentOnly),
        hash_options: HashOptions {
            case_sensitive: config.dedup.case_sensitive,
            trim_whitespace: config.dedup.trim_whitespace,
        },
        chunk_size: config.llm.chunk_size,
        dispatcher: DispatcherConfig {
            concurrency_limit: config.llm.concurrency_limit,
            max_retries: config.llm.max_retries,
            request_timeout: Duration::from_secs(config.llm.timeout_s),
            ..DispatcherConfig::default()
        },
        metrics_weights: config.metrics.clone(),
        queue_high_water: config.queue.high_water_mark,
        queue_low_water: config.queue.low_water_mark,
    };

    let worker = Worker::new(
        pool,
        event_bus,
        provider,
        queue,
        worker_id,
        pipeline_config,
        Duration::from_secs(config.checkpoint.heartbeat_s),
    );

    let worker_token = shutdown.clone();
    let worker_handle = tokio::spawn(async move { worker.run(worker_token).await });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, draining");
    shutdown.cancel();

    // Bounded drain so in-flight work can checkpoint
    let drain = tokio::time::timeout(
        Duration::from_secs(config.queue.shutdown_timeout_s),
        worker_handle,
    )
    .await;
    if drain.is_err() {
        tracing::warn!("Drain timeout elapsed, exiting with work left on the queue");
    }

    info!("rubro-engine worker stopped");
    Ok(())
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "rubro-worker".to_string())
}
