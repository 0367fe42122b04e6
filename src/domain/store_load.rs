use crate::domain::types::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use tracing::warn;

/// Utilization band of a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadTier {
    /// Below the medium threshold
    Low,
    /// Between medium and high thresholds
    Medium,
    /// At or above the high threshold
    High,
}

impl fmt::Display for LoadTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadTier::Low => write!(f, "low"),
            LoadTier::Medium => write!(f, "medium"),
            LoadTier::High => write!(f, "high"),
        }
    }
}

/// Tier boundaries in percent of capacity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadThresholds {
    /// Medium starts here
    pub medium_percent: f64,
    /// High starts here
    pub high_percent: f64,
}

impl LoadThresholds {
    /// Classifies a load percentage
    pub fn tier(&self, percent: f64) -> LoadTier {
        if percent >= self.high_percent {
            LoadTier::High
        } else if percent >= self.medium_percent {
            LoadTier::Medium
        } else {
            LoadTier::Low
        }
    }
}

impl Default for LoadThresholds {
    fn default() -> Self {
        Self {
            medium_percent: 50.0,
            high_percent: 80.0,
        }
    }
}

/// Point-in-time load of one store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreLoad {
    /// Store
    pub store_id: StoreId,
    /// Active sub-orders
    pub active_orders: u32,
    /// Soft capacity
    pub capacity: u32,
    /// active / capacity * 100
    pub load_percent: f64,
    /// Tier of `load_percent`
    pub tier: LoadTier,
    /// Orders the demand forecast expects next bucket
    pub projected_orders: u32,
    /// (active + projected) / capacity * 100
    pub projected_percent: f64,
}

/// Advisory raised for a loaded store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadAlert {
    /// Store
    pub store_id: StoreId,
    /// Current load
    pub load_percent: f64,
    /// Load including forecast demand
    pub projected_percent: f64,
    /// Whether the alert is driven by current load or by forecast
    pub projected_only: bool,
}

/// Suggestion to steer demand from loaded stores to idle ones
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceAdvice {
    /// Stores at high load
    pub overloaded: Vec<StoreId>,
    /// Stores at low load that can absorb orders
    pub underloaded: Vec<StoreId>,
}

#[derive(Debug)]
struct StoreCounter {
    capacity: AtomicU32,
    active: AtomicU32,
    projected: AtomicU32,
}

fn percent(count: u32, capacity: u32) -> f64 {
    if capacity == 0 {
        return 0.0;
    }
    f64::from(count) * 100.0 / f64::from(capacity)
}

/// Tracks active sub-orders per store with one atomic counter per store.
///
/// Overload is discouraged through the scoring penalty, never rejected.
#[derive(Debug)]
pub struct StoreLoadTracker {
    thresholds: LoadThresholds,
    high_load_multiplier: f64,
    counters: RwLock<HashMap<StoreId, Arc<StoreCounter>>>,
}

impl StoreLoadTracker {
    /// Creates a tracker
    pub fn new(thresholds: LoadThresholds, high_load_multiplier: f64) -> Self {
        Self {
            thresholds,
            high_load_multiplier,
            counters: RwLock::new(HashMap::new()),
        }
    }

    /// Tier boundaries
    pub fn thresholds(&self) -> LoadThresholds {
        self.thresholds
    }

    /// Starts tracking a store, or updates its capacity
    pub fn register(&self, store_id: StoreId, capacity: u32) -> DispatchResult<()> {
        let mut counters = self.counters.write().map_err(lock_err("load tracker write"))?;
        counters
            .entry(store_id)
            .and_modify(|c| c.capacity.store(capacity, Ordering::SeqCst))
            .or_insert_with(|| {
                Arc::new(StoreCounter {
                    capacity: AtomicU32::new(capacity),
                    active: AtomicU32::new(0),
                    projected: AtomicU32::new(0),
                })
            });
        Ok(())
    }

    fn counter(&self, store_id: &StoreId) -> DispatchResult<Arc<StoreCounter>> {
        let counters = self.counters.read().map_err(lock_err("load tracker read"))?;
        counters
            .get(store_id)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownStore(store_id.clone()))
    }

    /// A sub-order was created at the store; returns the new active count
    pub fn on_sub_order_created(&self, store_id: &StoreId) -> DispatchResult<u32> {
        let counter = self.counter(store_id)?;
        let active = counter.active.fetch_add(1, Ordering::SeqCst) + 1;
        let capacity = counter.capacity.load(Ordering::SeqCst);
        let pct = percent(active, capacity);
        if self.thresholds.tier(pct) == LoadTier::High {
            warn!(
                "Store {} at high load: {}/{} active ({:.0}%)",
                store_id, active, capacity, pct
            );
        }
        Ok(active)
    }

    /// A sub-order at the store reached a terminal state; never goes below zero
    pub fn on_sub_order_terminal(&self, store_id: &StoreId) -> DispatchResult<u32> {
        let counter = self.counter(store_id)?;
        match counter
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(previous) => Ok(previous - 1),
            Err(_) => {
                warn!("Terminal event for store {} with no active orders", store_id);
                Ok(0)
            }
        }
    }

    /// Sets the active count directly (snapshot restore)
    pub fn restore_active(&self, store_id: &StoreId, active: u32) -> DispatchResult<()> {
        self.counter(store_id)?
            .active
            .store(active, Ordering::SeqCst);
        Ok(())
    }

    /// Records how many orders the forecast expects at the store next bucket
    pub fn set_projected_demand(&self, store_id: &StoreId, expected: u32) -> DispatchResult<()> {
        self.counter(store_id)?
            .projected
            .store(expected, Ordering::SeqCst);
        Ok(())
    }

    /// Current load of one store
    pub fn load(&self, store_id: &StoreId) -> DispatchResult<StoreLoad> {
        let counter = self.counter(store_id)?;
        Ok(self.describe(store_id, &counter))
    }

    fn describe(&self, store_id: &StoreId, counter: &StoreCounter) -> StoreLoad {
        let active = counter.active.load(Ordering::SeqCst);
        let capacity = counter.capacity.load(Ordering::SeqCst);
        let projected = counter.projected.load(Ordering::SeqCst);
        let load_percent = percent(active, capacity);
        StoreLoad {
            store_id: store_id.clone(),
            active_orders: active,
            capacity,
            load_percent,
            tier: self.thresholds.tier(load_percent),
            projected_orders: projected,
            projected_percent: percent(active.saturating_add(projected), capacity),
        }
    }

    /// Scoring penalty: utilization ratio, amplified once the store is in the high tier
    pub fn load_penalty(&self, store_id: &StoreId) -> DispatchResult<f64> {
        let load = self.load(store_id)?;
        let ratio = load.load_percent / 100.0;
        Ok(match load.tier {
            LoadTier::High => ratio * self.high_load_multiplier,
            _ => ratio,
        })
    }

    /// Loads of all tracked stores sorted by id
    pub fn snapshot(&self) -> DispatchResult<Vec<StoreLoad>> {
        let counters = self.counters.read().map_err(lock_err("load tracker read"))?;
        let mut loads: Vec<StoreLoad> = counters
            .iter()
            .map(|(id, counter)| self.describe(id, counter))
            .collect();
        loads.sort_by(|a, b| a.store_id.cmp(&b.store_id));
        Ok(loads)
    }

    /// Mean load percentage across stores
    pub fn average_load_percent(&self) -> DispatchResult<f64> {
        let loads = self.snapshot()?;
        if loads.is_empty() {
            return Ok(0.0);
        }
        Ok(loads.iter().map(|l| l.load_percent).sum::<f64>() / loads.len() as f64)
    }

    /// Stores whose current or projected load is in the high tier
    pub fn alerts(&self) -> DispatchResult<Vec<LoadAlert>> {
        Ok(self
            .snapshot()?
            .into_iter()
            .filter_map(|load| {
                let now_high = load.tier == LoadTier::High;
                let projected_high = self.thresholds.tier(load.projected_percent) == LoadTier::High;
                (now_high || projected_high).then(|| LoadAlert {
                    store_id: load.store_id,
                    load_percent: load.load_percent,
                    projected_percent: load.projected_percent,
                    projected_only: !now_high,
                })
            })
            .collect())
    }

    /// Pairs high-load stores with low-load stores when both exist
    pub fn rebalance_advice(&self) -> DispatchResult<Option<RebalanceAdvice>> {
        let loads = self.snapshot()?;
        let overloaded: Vec<StoreId> = loads
            .iter()
            .filter(|l| l.tier == LoadTier::High)
            .map(|l| l.store_id.clone())
            .collect();
        let underloaded: Vec<StoreId> = loads
            .iter()
            .filter(|l| l.tier == LoadTier::Low)
            .map(|l| l.store_id.clone())
            .collect();
        if overloaded.is_empty() || underloaded.is_empty() {
            return Ok(None);
        }
        Ok(Some(RebalanceAdvice {
            overloaded,
            underloaded,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn tracker() -> StoreLoadTracker {
        let tracker = StoreLoadTracker::new(LoadThresholds::default(), 2.0);
        tracker.register(StoreId::new("A"), 10).unwrap();
        tracker.register(StoreId::new("B"), 10).unwrap();
        tracker
    }

    #[test]
    fn test_tier_boundaries() {
        let t = LoadThresholds::default();
        assert_eq!(t.tier(0.0), LoadTier::Low);
        assert_eq!(t.tier(49.9), LoadTier::Low);
        assert_eq!(t.tier(50.0), LoadTier::Medium);
        assert_eq!(t.tier(79.0), LoadTier::Medium);
        assert_eq!(t.tier(80.0), LoadTier::High);
        assert_eq!(t.tier(140.0), LoadTier::High);
    }

    #[test]
    fn test_counter_never_negative() {
        let tracker = tracker();
        let a = StoreId::new("A");
        assert_eq!(tracker.on_sub_order_terminal(&a).unwrap(), 0);
        tracker.on_sub_order_created(&a).unwrap();
        assert_eq!(tracker.on_sub_order_terminal(&a).unwrap(), 0);
        assert_eq!(tracker.load(&a).unwrap().active_orders, 0);
    }

    #[test]
    fn test_overload_is_allowed_but_penalized() {
        let tracker = tracker();
        let a = StoreId::new("A");
        for _ in 0..12 {
            tracker.on_sub_order_created(&a).unwrap();
        }
        let load = tracker.load(&a).unwrap();
        assert_eq!(load.active_orders, 12);
        assert_eq!(load.tier, LoadTier::High);
        assert!((tracker.load_penalty(&a).unwrap() - 2.4).abs() < 1e-9);
        assert_eq!(tracker.load_penalty(&StoreId::new("B")).unwrap(), 0.0);
    }

    #[test]
    fn test_concurrent_increments_and_decrements() {
        let tracker = Arc::new(tracker());
        let a = StoreId::new("A");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                let a = a.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        tracker.on_sub_order_created(&a).unwrap();
                        tracker.on_sub_order_terminal(&a).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tracker.load(&a).unwrap().active_orders, 0);
    }

    #[test]
    fn test_projected_alerts_and_rebalance() {
        let tracker = tracker();
        let (a, b) = (StoreId::new("A"), StoreId::new("B"));
        for _ in 0..5 {
            tracker.on_sub_order_created(&a).unwrap();
        }
        assert!(tracker.alerts().unwrap().is_empty());

        tracker.set_projected_demand(&a, 4).unwrap();
        let alerts = tracker.alerts().unwrap();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].projected_only);
        assert!(tracker.rebalance_advice().unwrap().is_none());

        for _ in 0..3 {
            tracker.on_sub_order_created(&a).unwrap();
        }
        let advice = tracker.rebalance_advice().unwrap().unwrap();
        assert_eq!(advice.overloaded, vec![a]);
        assert_eq!(advice.underloaded, vec![b]);
        assert!((tracker.average_load_percent().unwrap() - 40.0).abs() < 1e-9);
    }
}
