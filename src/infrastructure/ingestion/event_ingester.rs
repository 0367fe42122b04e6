use crate::domain::{dispatch::DispatchEngine, events::LifecycleEvent};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Event statistics for lifecycle ingestion
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestionStats {
    /// Total number of events processed
    pub total_events: u64,
    /// Number of successfully processed events
    pub successful_events: u64,
    /// Number of events that failed processing
    pub failed_events: u64,
    /// Failures by error kind
    pub failures_by_kind: BTreeMap<String, u64>,
    /// Timestamp of the last processed event
    pub last_event_timestamp: Option<chrono::DateTime<chrono::Utc>>,
    /// Timestamp when ingestion started
    pub start_time: chrono::DateTime<chrono::Utc>,
}

impl IngestionStats {
    /// Creates new ingestion statistics
    pub fn new() -> Self {
        Self {
            start_time: chrono::Utc::now(),
            ..Default::default()
        }
    }

    /// Records an event outcome; `failure` carries the error kind
    pub fn record_event(&mut self, failure: Option<&str>) {
        self.total_events += 1;
        self.last_event_timestamp = Some(chrono::Utc::now());
        match failure {
            None => self.successful_events += 1,
            Some(kind) => {
                self.failed_events += 1;
                *self.failures_by_kind.entry(kind.to_string()).or_insert(0) += 1;
            }
        }
    }

    /// Calculates the success rate as a percentage
    pub fn success_rate(&self) -> f64 {
        if self.total_events > 0 {
            (self.successful_events as f64 / self.total_events as f64) * 100.0
        } else {
            0.0
        }
    }

    /// Calculates the error rate as a percentage
    pub fn error_rate(&self) -> f64 {
        if self.total_events > 0 {
            (self.failed_events as f64 / self.total_events as f64) * 100.0
        } else {
            0.0
        }
    }
}

/// Shared view of ingestion statistics
pub type SharedStats = Arc<RwLock<IngestionStats>>;

/// Applies lifecycle events from one channel to the engine.
///
/// Delivery is at-least-once upstream; a failed event is logged and counted,
/// never retried here.
pub struct EventIngester {
    receiver: mpsc::Receiver<LifecycleEvent>,
    engine: Arc<DispatchEngine>,
    stats: SharedStats,
    report_interval: u64,
}

impl EventIngester {
    /// Creates an ingester with its own statistics
    pub fn new(receiver: mpsc::Receiver<LifecycleEvent>, engine: Arc<DispatchEngine>) -> Self {
        Self::with_stats(receiver, engine, Arc::new(RwLock::new(IngestionStats::new())))
    }

    /// Creates an ingester that reports into shared statistics
    pub fn with_stats(
        receiver: mpsc::Receiver<LifecycleEvent>,
        engine: Arc<DispatchEngine>,
        stats: SharedStats,
    ) -> Self {
        Self {
            receiver,
            engine,
            stats,
            report_interval: 1000,
        }
    }

    /// Handle to the statistics
    pub fn stats(&self) -> SharedStats {
        Arc::clone(&self.stats)
    }

    /// Runs until every sender is dropped
    pub async fn run(&mut self) {
        info!("Starting lifecycle event ingester");

        while let Some(event) = self.receiver.recv().await {
            let subject = event.subject();
            let failure = match self.engine.process_event(event) {
                Ok(()) => None,
                Err(e) => {
                    error!("Failed to process {}: {}", subject, e);
                    Some(e.kind())
                }
            };

            let total = match self.stats.write() {
                Ok(mut stats) => {
                    stats.record_event(failure);
                    stats.total_events
                }
                Err(_) => {
                    warn!("Ingestion stats lock poisoned");
                    continue;
                }
            };
            if total % self.report_interval == 0 {
                self.report_stats();
            }
        }

        self.report_stats();
        info!("Lifecycle event ingester finished");
    }

    fn report_stats(&self) {
        if let Ok(stats) = self.stats.read() {
            info!(
                "Stats - Total: {}, Successful: {}, Failed: {}, Error Rate: {:.2}%",
                stats.total_events,
                stats.successful_events,
                stats.failed_events,
                stats.error_rate()
            );
        }
    }
}

/// Runs one ingester per source (e.g. store clients and rider clients) over
/// shared statistics
pub struct MultiStreamIngester {
    receivers: Vec<mpsc::Receiver<LifecycleEvent>>,
    engine: Arc<DispatchEngine>,
    stats: SharedStats,
}

impl MultiStreamIngester {
    /// Creates a multi-stream ingester
    pub fn new(receivers: Vec<mpsc::Receiver<LifecycleEvent>>, engine: Arc<DispatchEngine>) -> Self {
        Self {
            receivers,
            engine,
            stats: Arc::new(RwLock::new(IngestionStats::new())),
        }
    }

    /// Handle to the combined statistics
    pub fn stats(&self) -> SharedStats {
        Arc::clone(&self.stats)
    }

    /// Run all streams concurrently until every one is closed
    pub async fn run(self) {
        info!("Starting multi-stream ingester with {} streams", self.receivers.len());

        let mut handles = Vec::new();
        for (stream_id, receiver) in self.receivers.into_iter().enumerate() {
            let mut ingester =
                EventIngester::with_stats(receiver, Arc::clone(&self.engine), Arc::clone(&self.stats));
            handles.push(tokio::spawn(async move {
                ingester.run().await;
                info!("Stream {} ingestion completed", stream_id);
            }));
        }

        for (stream_id, handle) in handles.into_iter().enumerate() {
            if let Err(e) = handle.await {
                error!("Stream {} failed: {}", stream_id, e);
            }
        }
        info!("All streams completed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        batching::Rider,
        inventory::InventoryRecord,
        store::Store,
        types::*,
    };
    use crate::infrastructure::metrics::MetricsCollector;
    use crate::utils::config::EngineConfig;
    use rust_decimal_macros::dec;

    fn engine() -> Arc<DispatchEngine> {
        let engine = DispatchEngine::new(EngineConfig::default(), Arc::new(MetricsCollector::new()));
        engine
            .onboard_store(Store::new(
                StoreId::new("S1"),
                "Green Grocery",
                GeoPoint::new(12.97, 77.59),
                AreaId::new("downtown"),
                10,
                4.2,
            ))
            .unwrap();
        engine
            .list_inventory(InventoryRecord::new(
                StoreId::new("S1"),
                ProductId::new("milk"),
                Category::new("dairy"),
                Money(dec!(30)),
                1,
                5,
            ))
            .unwrap();
        engine
            .register_rider(Rider::new(RiderId::new("R1"), GeoPoint::new(12.97, 77.59), 2))
            .unwrap();
        Arc::new(engine)
    }

    fn restock(op: &str) -> LifecycleEvent {
        LifecycleEvent::Restock {
            store_id: StoreId::new("S1"),
            product_id: ProductId::new("milk"),
            quantity: 4,
            operation_id: OperationId::new(op),
            at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_replayed_restock_applied_once() {
        let engine = engine();
        let (tx, rx) = mpsc::channel(10);
        let mut ingester = EventIngester::new(rx, Arc::clone(&engine));

        tx.send(restock("r-1")).await.unwrap();
        tx.send(restock("r-1")).await.unwrap();
        drop(tx);
        ingester.run().await;

        let record = engine
            .ledger()
            .record(&StoreId::new("S1"), &ProductId::new("milk"))
            .unwrap();
        assert_eq!(record.available, 5);
        let stats = ingester.stats();
        let stats = stats.read().unwrap();
        assert_eq!((stats.total_events, stats.failed_events), (2, 0));
    }

    #[tokio::test]
    async fn test_failures_are_counted_by_kind() {
        let engine = engine();
        let (tx, rx) = mpsc::channel(10);
        let mut ingester = EventIngester::new(rx, engine);

        tx.send(LifecycleEvent::SubOrderStatus {
            sub_order_id: SubOrderId::new("SUB-404"),
            status: crate::domain::order::SubOrderStatus::Preparing,
            operation_id: None,
            at: chrono::Utc::now(),
        })
        .await
        .unwrap();
        tx.send(LifecycleEvent::RiderAvailability {
            rider_id: RiderId::new("ghost"),
            online: false,
            at: chrono::Utc::now(),
        })
        .await
        .unwrap();
        drop(tx);
        ingester.run().await;

        let stats = ingester.stats();
        let stats = stats.read().unwrap();
        assert_eq!(stats.failed_events, 2);
        assert_eq!(stats.failures_by_kind.get("unknown_sub_order"), Some(&1));
        assert_eq!(stats.failures_by_kind.get("unknown_rider"), Some(&1));
        assert_eq!(stats.error_rate(), 100.0);
    }

    #[tokio::test]
    async fn test_multi_stream_ingester() {
        let engine = engine();
        let (store_tx, store_rx) = mpsc::channel(10);
        let (rider_tx, rider_rx) = mpsc::channel(10);
        let multi = MultiStreamIngester::new(vec![store_rx, rider_rx], Arc::clone(&engine));
        let stats = multi.stats();

        store_tx.send(restock("r-2")).await.unwrap();
        rider_tx
            .send(LifecycleEvent::RiderLocation {
                rider_id: RiderId::new("R1"),
                location: GeoPoint::new(12.98, 77.60),
                at: chrono::Utc::now(),
            })
            .await
            .unwrap();
        drop(store_tx);
        drop(rider_tx);
        multi.run().await;

        assert_eq!(stats.read().unwrap().successful_events, 2);
        let rider = engine.batching().rider(&RiderId::new("R1")).unwrap();
        assert_eq!(rider.location, GeoPoint::new(12.98, 77.60));
    }

    #[test]
    fn test_ingestion_stats_calculations() {
        let mut stats = IngestionStats::new();
        for _ in 0..8 {
            stats.record_event(None);
        }
        stats.record_event(Some("illegal_state_transition"));
        stats.record_event(Some("illegal_state_transition"));

        assert_eq!(stats.total_events, 10);
        assert_eq!(stats.failed_events, 2);
        assert_eq!(stats.error_rate(), 20.0);
        assert_eq!(stats.success_rate(), 80.0);
    }
}
