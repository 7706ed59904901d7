//! Autoswarm daemon entry point.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::signal;
use tokio::sync::watch;

use autoswarm::config::Config;
use autoswarm::metadata::{DokployClient, MetadataStore};
use autoswarm::orchestrator::{DockerOrchestrator, Orchestrator};
use autoswarm::reconciler::Reconciler;
use autoswarm::scheduler::{DedupWindow, Scheduler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting autoswarm daemon with config: {:?}", cfg);

    // Docker daemon
    let orchestrator: Arc<dyn Orchestrator> = Arc::new(DockerOrchestrator::connect()?);
    let node_id = orchestrator
        .node_id()
        .await
        .map_err(|e| anyhow::anyhow!("This node is not part of a swarm cluster: {e}"))?;
    info!("Local swarm node: {node_id}");

    let ingress_network_id = orchestrator.resolve_network(&cfg.traefik_network).await?;
    if ingress_network_id.is_none() {
        warn!(
            "Ingress network '{}' not found; services will not be auto-attached.",
            cfg.traefik_network
        );
    }

    // Metadata store
    let metadata = Arc::new(DokployClient::new(
        &cfg.dokploy_url,
        cfg.dokploy_api_key.clone(),
        Duration::from_secs(cfg.cache_ttl_secs),
    )?);
    if !metadata.is_enabled() {
        warn!("No Dokploy API key configured; metadata reconciliation disabled.");
    }

    // Engine + scheduler
    let engine = Arc::new(Reconciler::new(
        Arc::clone(&orchestrator),
        metadata,
        cfg.traefik_network.clone(),
        ingress_network_id,
        node_id,
    ));
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&engine),
        Arc::clone(&orchestrator),
        DedupWindow::new(
            Duration::from_secs(cfg.dedup_window_secs),
            cfg.dedup_capacity,
        ),
        Duration::from_secs(cfg.reconcile_interval_secs),
    ));

    // Convert anything already running before the event stream takes over.
    if let Err(err) = engine.initial_sweep().await {
        error!("Initial sweep failed: {err}");
    }

    let (stop_tx, stop_rx) = watch::channel(false);

    let watcher = {
        let scheduler = Arc::clone(&scheduler);
        let stop = stop_rx.clone();
        tokio::spawn(async move { scheduler.run_event_watcher(stop).await })
    };
    let sweeper = {
        let scheduler = Arc::clone(&scheduler);
        let stop = stop_rx;
        tokio::spawn(async move { scheduler.run_sweeper(stop).await })
    };

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    let _ = stop_tx.send(true);
    let _ = watcher.await;
    let _ = sweeper.await;

    info!("Shutdown complete.");
    Ok(())
}
