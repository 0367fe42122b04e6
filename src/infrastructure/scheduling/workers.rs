use crate::domain::dispatch::DispatchEngine;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info};

/// Runs a batching cycle whenever one is due, checked on every tick and on
/// every nudge. Exits when `shutdown` flips to true.
pub async fn run_batching_worker(
    engine: Arc<DispatchEngine>,
    nudge: Arc<Notify>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Batching worker started, tick every {:?}", period);
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = nudge.notified() => debug!("Batching worker nudged"),
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let now = Utc::now();
        match engine.batching_due(now) {
            Ok(true) => {
                if let Err(e) = engine.run_batching_cycle(now) {
                    error!("Batching cycle failed: {}", e);
                }
            }
            Ok(false) => {}
            Err(e) => error!("Batching check failed: {}", e),
        }
    }
    info!("Batching worker stopped");
}

/// Refreshes forecast-driven load projections every `period`
pub async fn run_forecast_refresher(
    engine: Arc<DispatchEngine>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Forecast refresher started, every {:?}", period);
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = engine.refresh_load_projections(Utc::now()) {
                    error!("Forecast refresh failed: {}", e);
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("Forecast refresher stopped");
}

/// Handles to the running background tasks
pub struct BackgroundWorkers {
    nudge: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundWorkers {
    /// Spawns the batching worker and the forecast refresher using the
    /// intervals from the engine configuration
    pub fn spawn(engine: Arc<DispatchEngine>) -> Self {
        let config = engine.config().clone();
        let nudge = Arc::new(Notify::new());
        let (shutdown, rx) = watch::channel(false);

        let handles = vec![
            tokio::spawn(run_batching_worker(
                Arc::clone(&engine),
                Arc::clone(&nudge),
                Duration::from_millis(config.batching.interval_ms.max(1)),
                rx.clone(),
            )),
            tokio::spawn(run_forecast_refresher(
                engine,
                Duration::from_secs(config.forecast.refresh_secs.max(1)),
                rx,
            )),
        ];

        Self {
            nudge,
            shutdown,
            handles,
        }
    }

    /// Handle used to request an early batching check
    pub fn nudge(&self) -> Arc<Notify> {
        Arc::clone(&self.nudge)
    }

    /// Signals every task to stop and waits for them
    pub async fn shutdown(self) {
        if self.shutdown.send(true).is_err() {
            debug!("Background workers already gone");
        }
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Background worker panicked: {}", e);
            }
        }
        info!("Background workers shut down");
    }
}
