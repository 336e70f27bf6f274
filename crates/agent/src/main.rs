use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent::checkpoint::CheckpointStore;
use agent::config::{load_pipeline_configs, AgentConfig};
use agent::meta::{ContainerMetaCache, ContainerMetaProvider};
use agent::pipeline::{Pipeline, PipelineRegistry};
use agent::plugin::PluginRegistry;
use agent::queue::{ProcessQueueManager, Sender, SenderQueue, WorkerPool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agent=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting log collection agent v0.0.1");

    let config = AgentConfig::load().map_err(|e| anyhow::anyhow!(e.to_string()))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!(e))
        .context("invalid agent configuration")?;
    info!(
        "Loaded configuration: config_dir={}, process_threads={}",
        config.config_dir, config.process_threads
    );

    // Plugin registry: natives plus whatever the plugin directory holds
    let mut plugins = PluginRegistry::with_natives();
    let loaded = plugins.load_dynamic_plugins(Path::new(&config.plugin_dir));
    if loaded > 0 {
        info!("Loaded {} dynamic processor(s)", loaded);
    }
    let plugins = Arc::new(plugins);

    // Checkpoints from the previous run
    let checkpoints = Arc::new(CheckpointStore::new(
        &config.checkpoint_path,
        config.exactly_once_concurrency,
    ));
    match checkpoints.load() {
        Ok(n) if n > 0 => info!("Restored {} file checkpoint(s)", n),
        Ok(_) => {}
        Err(e) => warn!("Checkpoint restore failed, starting clean: {}", e),
    }

    // Container metadata cache; the runtime client feeding it sits
    // outside the core, taggers resolve container ids against it
    let container_meta = Arc::new(ContainerMetaCache::new(Duration::from_secs(30)));

    // Compile and install pipelines; a bad document never evicts a good one
    let pipelines = Arc::new(PipelineRegistry::new());
    let mut installed = 0usize;
    for (path, parsed) in load_pipeline_configs(Path::new(&config.config_dir)) {
        let doc = match parsed {
            Ok(doc) => doc,
            Err(e) => {
                error!("Rejected config {}: {}", path.display(), e);
                continue;
            }
        };
        let provider = Arc::clone(&container_meta) as Arc<dyn ContainerMetaProvider>;
        match Pipeline::build_with_meta(&doc, &plugins, &config, Some(provider)) {
            Ok(pipeline) => {
                pipelines.install(Arc::new(pipeline));
                installed += 1;
            }
            Err(e) => error!("Rejected config {}: {}", path.display(), e),
        }
    }
    if installed == 0 {
        anyhow::bail!("no pipeline could be installed from {}", config.config_dir);
    }
    info!("Installed {} pipeline(s)", installed);

    // Queues, workers, sender
    let manager = Arc::new(ProcessQueueManager::new(
        config.process_threads,
        config.process_queue_capacity,
    ));
    for name in pipelines.names() {
        if let Some(pipeline) = pipelines.get(&name) {
            manager.ensure_queue(pipeline.queue_key(), pipeline.priority(), None);
        }
    }
    let sender_queue = Arc::new(SenderQueue::new(config.sender_queue_capacity));
    let pool = WorkerPool::spawn(
        Arc::clone(&manager),
        Arc::clone(&pipelines),
        Arc::clone(&sender_queue),
        Arc::clone(&checkpoints),
    );
    let sender = Sender::spawn(
        Arc::clone(&sender_queue),
        Arc::clone(&pipelines),
        Arc::clone(&checkpoints),
    );

    // Background ticks: flusher flush and checkpoint dump/eviction
    let flush_pipelines = Arc::clone(&pipelines);
    let batch_interval = config.batch_send_interval_secs;
    let flush_task = tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(batch_interval));
        loop {
            tick.tick().await;
            flush_pipelines.flush_all();
        }
    });
    let dump_checkpoints = Arc::clone(&checkpoints);
    let dump_interval = config.checkpoint_dump_interval_secs;
    let checkpoint_task = tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(dump_interval));
        loop {
            tick.tick().await;
            dump_checkpoints.evict(chrono::Utc::now().timestamp());
            if let Err(e) = dump_checkpoints.dump() {
                warn!("Checkpoint dump failed: {}", e);
            }
        }
    });

    info!("Agent is ready, press Ctrl+C to shut down");
    shutdown_signal().await;

    // Orderly drain: stop timers, quiesce workers, flush everything out
    flush_task.abort();
    checkpoint_task.abort();
    info!("Draining process queues...");
    pool.shutdown(Duration::from_millis(config.flush_timeout_ms));
    sender.shutdown();
    pipelines.flush_all();
    if let Err(e) = checkpoints.dump() {
        warn!("Final checkpoint dump failed: {}", e);
    }

    info!("Agent shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler.
/// Listens for SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM signal, initiating graceful shutdown...");
        },
    }
}
