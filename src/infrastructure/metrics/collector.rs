use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Counter: orders created
pub const ORDERS_ASSIGNED: &str = "dispatch_orders_assigned_total";
/// Counter: carts where no group could be reserved
pub const ASSIGNMENTS_REJECTED: &str = "dispatch_assignments_rejected_total";
/// Counter: store groups that failed inside an otherwise successful order
pub const GROUPS_REJECTED: &str = "dispatch_groups_rejected_total";
/// Counter: applied sub-order transitions
pub const TRANSITIONS: &str = "dispatch_transitions_total";
/// Counter: rejected sub-order transitions
pub const ILLEGAL_TRANSITIONS: &str = "dispatch_illegal_transitions_total";
/// Counter: batch groups formed
pub const BATCHES_FORMED: &str = "dispatch_batches_formed_total";
/// Counter: deliveries a cycle could not place
pub const DELIVERIES_UNMATCHED: &str = "dispatch_deliveries_unmatched_total";
/// Counter: pending deliveries seen past the batching timeout
pub const BATCHING_TIMEOUTS: &str = "dispatch_batching_timeouts_total";
/// Counter: batch bonuses granted
pub const BONUSES_GRANTED: &str = "dispatch_bonuses_granted_total";
/// Counter: batch bonuses forfeited
pub const BONUSES_FORFEITED: &str = "dispatch_bonuses_forfeited_total";
/// Gauge: deliveries waiting for a rider
pub const PENDING_DELIVERIES: &str = "dispatch_pending_deliveries";
/// Gauge: online riders with free capacity
pub const IDLE_RIDERS: &str = "dispatch_idle_riders";

/// Named counters and gauges.
///
/// Metrics are created on first use; a read lock is enough once a name exists.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: Arc<RwLock<HashMap<String, AtomicU64>>>,
    gauges: Arc<RwLock<HashMap<String, AtomicU64>>>,
}

fn bump(map: &RwLock<HashMap<String, AtomicU64>>, name: &str, apply: impl Fn(&AtomicU64)) {
    if let Ok(metrics) = map.read() {
        if let Some(metric) = metrics.get(name) {
            apply(metric);
            return;
        }
    }
    if let Ok(mut metrics) = map.write() {
        apply(metrics.entry(name.to_string()).or_default());
    }
}

fn read(map: &RwLock<HashMap<String, AtomicU64>>, name: &str) -> u64 {
    map.read()
        .ok()
        .and_then(|m| m.get(name).map(|c| c.load(Ordering::Relaxed)))
        .unwrap_or(0)
}

fn copy(map: &RwLock<HashMap<String, AtomicU64>>) -> BTreeMap<String, u64> {
    map.read()
        .map(|m| {
            m.iter()
                .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
                .collect()
        })
        .unwrap_or_default()
}

impl MetricsCollector {
    /// Creates a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments a named counter by 1
    pub fn increment_counter(&self, name: &str) {
        self.add_to_counter(name, 1);
    }

    /// Increments a named counter by `n`
    pub fn add_to_counter(&self, name: &str, n: u64) {
        bump(&self.counters, name, |c| {
            c.fetch_add(n, Ordering::Relaxed);
        });
    }

    /// Sets a gauge to a specific value
    pub fn set_gauge(&self, name: &str, value: u64) {
        bump(&self.gauges, name, |g| g.store(value, Ordering::Relaxed));
    }

    /// Gets the current value of a counter
    pub fn get_counter(&self, name: &str) -> u64 {
        read(&self.counters, name)
    }

    /// Gets the current value of a gauge
    pub fn get_gauge(&self, name: &str) -> u64 {
        read(&self.gauges, name)
    }

    /// Point-in-time copy of every metric
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: copy(&self.counters),
            gauges: copy(&self.gauges),
        }
    }
}

/// Copy of all counters and gauges, sorted by name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Monotonic counters
    pub counters: BTreeMap<String, u64>,
    /// Last-value gauges
    pub gauges: BTreeMap<String, u64>,
}
