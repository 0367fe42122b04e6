//! # Grocery Dispatch
//!
//! Runs the dispatch engine as a service: restores the last snapshot (or loads
//! the seed file), starts the batching worker, the forecast refresher and the
//! lifecycle event ingester, and serves the HTTP API until Ctrl-C. On shutdown
//! the engine state is written back to the snapshot file.

use anyhow::Context;
use grocery_dispatch::utils::logger::setup_logger;
use grocery_dispatch::*;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_logger().map_err(|e| anyhow::anyhow!("failed to initialise logger: {}", e))?;
    info!("Starting Grocery Dispatch v{}", VERSION);

    let config = EngineConfig::load().context("loading configuration")?;
    let engine = Arc::new(DispatchEngine::new(
        config.clone(),
        Arc::new(MetricsCollector::new()),
    ));
    bootstrap(&engine, &config)?;

    let (event_tx, event_rx) = mpsc::channel::<LifecycleEvent>(config.server.event_buffer);
    let mut ingester = EventIngester::new(event_rx, Arc::clone(&engine));
    let ingestion_stats = ingester.stats();
    let ingester_handle = tokio::spawn(async move {
        ingester.run().await;
    });
    info!("Event ingester spawned, buffer {}", config.server.event_buffer);

    let workers = BackgroundWorkers::spawn(Arc::clone(&engine));

    let ctx = ApiContext::new(Arc::clone(&engine), workers.nudge())
        .with_ingestion(ingestion_stats)
        .with_events(event_tx);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid bind address")?;
    let (bound, server) = warp::serve(routes(ctx))
        .try_bind_with_graceful_shutdown(addr, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Shutdown requested");
        })
        .context("binding HTTP server")?;

    info!("API server ready at http://{}", bound);
    info!("Available endpoints:");
    info!("  POST  /carts, /carts/{{id}}/items, /carts/{{id}}/assign");
    info!("  GET   /carts/{{id}}, /orders/{{id}}");
    info!("  PATCH /suborders/{{id}}/status");
    info!("  GET   /stores/load, /stores/{{id}}/load, /demand/{{area}}/{{category}}");
    info!("  POST  /riders, /events");
    info!("  GET   /metrics, /health");
    server.await;

    // The server owned the last event sender; the ingester drains and exits
    match tokio::time::timeout(Duration::from_secs(5), ingester_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Event ingester ended abnormally: {}", e),
        Err(_) => warn!("Event ingester did not drain in time"),
    }
    workers.shutdown().await;

    if let Some(path) = &config.server.snapshot_path {
        StateSnapshot::capture(&engine)?
            .save(path)
            .with_context(|| format!("saving snapshot to {}", path.display()))?;
    }
    info!("Grocery Dispatch stopped");
    Ok(())
}

/// Restores the snapshot when one exists, otherwise applies the seed file
fn bootstrap(engine: &DispatchEngine, config: &EngineConfig) -> anyhow::Result<()> {
    if let Some(path) = config.server.snapshot_path.as_deref().filter(|p| p.exists()) {
        StateSnapshot::load(path)
            .and_then(|snapshot| snapshot.restore_into(engine))
            .with_context(|| format!("restoring snapshot {}", path.display()))?;
        return Ok(());
    }
    match config.server.seed_path.as_deref() {
        Some(path) if path.exists() => {
            let seed = load_seed(path).with_context(|| format!("loading seed {}", path.display()))?;
            apply_seed(engine, seed)?;
        }
        Some(path) => warn!("Seed file {} not found, starting empty", path.display()),
        None => warn!("No snapshot or seed configured, starting empty"),
    }
    Ok(())
}
