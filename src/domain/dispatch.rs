use crate::domain::{
    assignment::OrderAssignmentEngine,
    batching::{BatchGroup, BatchingScheduler, BonusOutcome, CycleReport, Delivery, DeliveryStatus, Rider},
    cart::{Cart, CartService},
    events::LifecycleEvent,
    forecast::{DemandForecaster, DemandSample, Forecast},
    geo_index::GeoIndex,
    inventory::{InventoryLedger, InventoryRecord, LowStockItem},
    order::*,
    store::{Store, StoreRegistry},
    store_load::{LoadAlert, LoadThresholds, RebalanceAdvice, StoreLoad, StoreLoadTracker},
    types::*,
};
use crate::infrastructure::metrics::{self, MetricsCollector};
use crate::utils::config::EngineConfig;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Result of a sub-order status change as seen by store and rider clients
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubOrderUpdate {
    /// Sub-order after the change
    pub sub_order: SubOrder,
    /// Aggregate order state after the change
    pub order_status: OrderStatus,
    /// True when the operation had already been applied
    pub replayed: bool,
    /// Batch bonus decided by this change, if any
    pub bonus: Option<BonusOutcome>,
}

/// Load of every store plus system-wide insight
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadOverview {
    /// Per-store load sorted by id
    pub stores: Vec<StoreLoad>,
    /// Mean load across stores
    pub average_load_percent: f64,
    /// Stores at or heading into the high tier
    pub alerts: Vec<LoadAlert>,
    /// Where to steer demand, if anywhere
    pub advice: Option<RebalanceAdvice>,
}

/// Every persisted table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    /// Stores table
    pub stores: Vec<Store>,
    /// InventoryRecords table
    pub inventory: Vec<InventoryRecord>,
    /// Orders with their sub-orders
    pub orders: Vec<Order>,
    /// Deliveries table
    pub deliveries: Vec<Delivery>,
    /// BatchGroups table
    pub batch_groups: Vec<BatchGroup>,
    /// Riders
    pub riders: Vec<Rider>,
    /// Open carts
    #[serde(default)]
    pub carts: Vec<Cart>,
    /// DemandSamples append-only log
    pub demand_samples: Vec<DemandSample>,
}

/// Wires the engines together and owns the cross-component flows
#[derive(Debug)]
pub struct DispatchEngine {
    config: EngineConfig,
    stores: Arc<StoreRegistry>,
    geo: Arc<GeoIndex>,
    ledger: Arc<InventoryLedger>,
    load: Arc<StoreLoadTracker>,
    assignment: OrderAssignmentEngine,
    batching: BatchingScheduler,
    forecast: DemandForecaster,
    carts: CartService,
    metrics: Arc<MetricsCollector>,
}

fn delivery_status_for(status: SubOrderStatus) -> Option<DeliveryStatus> {
    match status {
        SubOrderStatus::PickedUp => Some(DeliveryStatus::PickedUp),
        SubOrderStatus::Delivered => Some(DeliveryStatus::Delivered),
        SubOrderStatus::Cancelled => Some(DeliveryStatus::Cancelled),
        SubOrderStatus::New | SubOrderStatus::Preparing | SubOrderStatus::Ready => None,
    }
}

impl DispatchEngine {
    /// Creates an empty engine
    pub fn new(config: EngineConfig, metrics: Arc<MetricsCollector>) -> Self {
        let stores = Arc::new(StoreRegistry::new());
        let geo = Arc::new(GeoIndex::new(config.geo.cell_size_deg));
        let ledger = Arc::new(InventoryLedger::new(config.assignment.max_lock_attempts));
        let load = Arc::new(StoreLoadTracker::new(
            LoadThresholds {
                medium_percent: config.load.medium_percent,
                high_percent: config.load.high_percent,
            },
            config.load.high_load_multiplier,
        ));
        let assignment = OrderAssignmentEngine::new(
            config.assignment.clone(),
            Arc::clone(&stores),
            Arc::clone(&geo),
            Arc::clone(&ledger),
            Arc::clone(&load),
        );
        let batching = BatchingScheduler::new(config.batching.clone(), config.geo.cell_size_deg);
        let forecast = DemandForecaster::new(config.forecast.alpha, config.forecast.bucket_minutes);
        Self {
            config,
            stores,
            geo,
            ledger,
            load,
            assignment,
            batching,
            forecast,
            carts: CartService::new(),
            metrics,
        }
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Metrics sink
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Cart boundary
    pub fn carts(&self) -> &CartService {
        &self.carts
    }

    /// Assignment engine
    pub fn assignment(&self) -> &OrderAssignmentEngine {
        &self.assignment
    }

    /// Batching scheduler
    pub fn batching(&self) -> &BatchingScheduler {
        &self.batching
    }

    /// Inventory ledger
    pub fn ledger(&self) -> &InventoryLedger {
        &self.ledger
    }

    /// Onboards a store and makes it visible to assignment
    pub fn onboard_store(&self, store: Store) -> DispatchResult<()> {
        self.stores.register(store.clone())?;
        self.load.register(store.id.clone(), store.capacity)?;
        if store.active {
            self.geo.insert(store.id.clone(), store.location)?;
        } else {
            self.geo.remove(&store.id)?;
        }
        info!("Onboarded store {} ({}) in {}", store.id, store.name, store.area);
        Ok(())
    }

    /// Takes a store out of assignment; its open sub-orders are unaffected
    pub fn deactivate_store(&self, id: &StoreId) -> DispatchResult<Store> {
        let store = self.stores.deactivate(id)?;
        self.geo.remove(id)?;
        warn!("Store {} deactivated", id);
        Ok(store)
    }

    /// Looks up a store
    pub fn store(&self, id: &StoreId) -> DispatchResult<Store> {
        self.stores.get(id)
    }

    /// Adds or updates a listing at a known store
    pub fn list_inventory(&self, record: InventoryRecord) -> DispatchResult<()> {
        self.stores.get(&record.store_id)?;
        self.ledger.upsert(record)
    }

    /// Store restock action
    pub fn restock(
        &self,
        store: &StoreId,
        product: &ProductId,
        quantity: u32,
        operation_id: &OperationId,
    ) -> DispatchResult<InventoryRecord> {
        self.ledger.restock(store, product, quantity, operation_id)?;
        self.ledger.record(store, product)
    }

    /// Items at a store below their minimum threshold
    pub fn low_stock(&self, store: &StoreId) -> DispatchResult<Vec<LowStockItem>> {
        self.stores.get(store)?;
        self.ledger.low_stock(store)
    }

    /// Adds a rider or updates an existing one
    pub fn register_rider(&self, rider: Rider) -> DispatchResult<Rider> {
        if !rider.location.is_valid() {
            return Err(DispatchError::ParseError(format!(
                "Rider {} has invalid location {}",
                rider.id, rider.location
            )));
        }
        let rider = self.batching.register_rider(rider)?;
        self.refresh_gauges();
        Ok(rider)
    }

    /// Checks out a cart: assigns it to stores and queues one delivery per
    /// sub-order. The cart is consumed unless nothing could be reserved or
    /// the deliveries could not be queued, in which case the order is withdrawn.
    pub fn assign_cart(&self, cart_id: &CartId, location: GeoPoint, now: Timestamp) -> DispatchResult<Order> {
        let cart = self.carts.take(cart_id)?;
        let order = match self.assignment.assign(&cart, location, now) {
            Ok(order) => order,
            Err(e) => {
                self.metrics.increment_counter(metrics::ASSIGNMENTS_REJECTED);
                self.carts.put_back(cart)?;
                return Err(e);
            }
        };

        let window = Duration::minutes(self.config.assignment.instant_window_minutes);
        let promised_by = match order.delivery_mode {
            DeliveryMode::Instant => now + window,
            DeliveryMode::Scheduled { slot_start } => slot_start + window,
        };
        let queued = order
            .sub_orders
            .iter()
            .map(|sub| {
                let pickup = self.stores.get(&sub.store_id)?.location;
                Ok(Delivery::new(
                    DeliveryId(format!("DLV-{}", sub.id)),
                    sub.id.clone(),
                    order.id.clone(),
                    sub.store_id.clone(),
                    pickup,
                    order.drop_location,
                    promised_by,
                    now,
                ))
            })
            .collect::<DispatchResult<Vec<_>>>()
            .and_then(|deliveries| self.batching.admit_all(deliveries));
        if let Err(e) = queued {
            error!("Could not queue deliveries for {}: {}", order.id, e);
            if let Err(undo) = self.assignment.withdraw(&order.id) {
                error!("Failed to withdraw {}: {}", order.id, undo);
            }
            self.carts.put_back(cart)?;
            return Err(e);
        }
        self.metrics.increment_counter(metrics::ORDERS_ASSIGNED);
        self.metrics
            .add_to_counter(metrics::GROUPS_REJECTED, order.unfulfilled.len() as u64);
        self.refresh_gauges();
        Ok(order)
    }

    /// Applies a store- or rider-triggered status change and mirrors it onto
    /// the delivery. Delivered sub-orders feed the demand forecast.
    pub fn update_sub_order_status(
        &self,
        id: &SubOrderId,
        to: SubOrderStatus,
        operation_id: Option<OperationId>,
        at: Timestamp,
    ) -> DispatchResult<SubOrderUpdate> {
        let outcome = match self.assignment.transition(id, to, operation_id, at) {
            Ok(outcome) => outcome,
            Err(e) => {
                if matches!(e, DispatchError::IllegalStateTransition { .. }) {
                    self.metrics.increment_counter(metrics::ILLEGAL_TRANSITIONS);
                }
                return Err(e);
            }
        };
        let sub = outcome.sub_order;

        let mut bonus = None;
        if !outcome.replayed {
            self.metrics.increment_counter(metrics::TRANSITIONS);
            if let Some(status) = delivery_status_for(to) {
                bonus = self.batching.record_delivery_status(&sub.id, status)?;
            }
            match &bonus {
                Some(BonusOutcome::Granted { .. }) => self.metrics.increment_counter(metrics::BONUSES_GRANTED),
                Some(BonusOutcome::Forfeited { .. }) => {
                    self.metrics.increment_counter(metrics::BONUSES_FORFEITED)
                }
                None => {}
            }
        }

        let order = self.assignment.order(&sub.order_id)?;
        if !outcome.replayed && to == SubOrderStatus::Delivered {
            // Samples never land ahead of the server clock
            let observed_at = at.min(Utc::now());
            if observed_at < at {
                debug!("Clamped delivery time of {} from {} to {}", sub.id, at, observed_at);
            }
            let categories: BTreeSet<&Category> = sub.lines.iter().map(|l| &l.category).collect();
            for category in categories {
                self.forecast.record(&order.area, category, observed_at, 1)?;
            }
        }
        self.refresh_gauges();
        Ok(SubOrderUpdate {
            order_status: order.status(),
            sub_order: sub,
            replayed: outcome.replayed,
            bonus,
        })
    }

    /// Full order view
    pub fn order(&self, id: &OrderId) -> DispatchResult<Order> {
        self.assignment.order(id)
    }

    /// Current load of one store
    pub fn store_load(&self, id: &StoreId) -> DispatchResult<StoreLoad> {
        self.stores.get(id)?;
        self.load.load(id)
    }

    /// Load of every store with alerts and rebalancing advice
    pub fn load_overview(&self) -> DispatchResult<LoadOverview> {
        Ok(LoadOverview {
            stores: self.load.snapshot()?,
            average_load_percent: self.load.average_load_percent()?,
            alerts: self.load.alerts()?,
            advice: self.load.rebalance_advice()?,
        })
    }

    /// Demand estimate for the next `horizon` buckets
    pub fn demand(&self, area: &AreaId, category: &Category, horizon: u32, now: Timestamp) -> DispatchResult<Forecast> {
        self.forecast.predict_at(area, category, horizon, now)
    }

    /// Whether the batching worker should run a cycle now
    pub fn batching_due(&self, now: Timestamp) -> DispatchResult<bool> {
        self.batching.should_run(now)
    }

    /// Runs a batching cycle and records its outcome
    pub fn run_batching_cycle(&self, now: Timestamp) -> DispatchResult<Option<CycleReport>> {
        let report = self.batching.run_cycle(now)?;
        if let Some(report) = &report {
            self.metrics
                .add_to_counter(metrics::BATCHES_FORMED, report.groups_formed.len() as u64);
            self.metrics
                .add_to_counter(metrics::DELIVERIES_UNMATCHED, report.unmatched.len() as u64);
            self.metrics
                .add_to_counter(metrics::BATCHING_TIMEOUTS, report.timed_out.len() as u64);
            debug!(
                "Batching cycle: {} assigned, {} groups, {} unmatched",
                report.assigned,
                report.groups_formed.len(),
                report.unmatched.len()
            );
        }
        self.refresh_gauges();
        Ok(report)
    }

    /// Spreads each area's forecast for the next bucket over the area's active
    /// stores and records it as projected load
    pub fn refresh_load_projections(&self, now: Timestamp) -> DispatchResult<()> {
        let mut by_area: HashMap<AreaId, Vec<Store>> = HashMap::new();
        for store in self.stores.all()?.into_iter().filter(|s| s.active) {
            by_area.entry(store.area.clone()).or_default().push(store);
        }
        for (area, stores) in by_area {
            let expected: f64 = self
                .forecast
                .predict_area(&area, 1, now)?
                .iter()
                .map(|f| f.total)
                .sum();
            let per_store = (expected / stores.len() as f64).ceil().max(0.0) as u32;
            for store in &stores {
                self.load.set_projected_demand(&store.id, per_store)?;
            }
            debug!("Projected {:.1} orders in {} ({} per store)", expected, area, per_store);
        }
        for alert in self.load.alerts()?.iter().filter(|a| a.projected_only) {
            warn!(
                "Store {} projected at {:.0}% load next bucket",
                alert.store_id, alert.projected_percent
            );
        }
        Ok(())
    }

    /// Applies one lifecycle event from a store or rider client
    pub fn process_event(&self, event: LifecycleEvent) -> DispatchResult<()> {
        match event {
            LifecycleEvent::SubOrderStatus {
                sub_order_id,
                status,
                operation_id,
                at,
            } => self
                .update_sub_order_status(&sub_order_id, status, operation_id, at)
                .map(|_| ()),
            LifecycleEvent::Restock {
                store_id,
                product_id,
                quantity,
                operation_id,
                ..
            } => self
                .restock(&store_id, &product_id, quantity, &operation_id)
                .map(|_| ()),
            LifecycleEvent::RiderLocation {
                rider_id, location, ..
            } => self.batching.update_rider_location(&rider_id, location),
            LifecycleEvent::RiderAvailability { rider_id, online, .. } => {
                self.batching.set_rider_online(&rider_id, online)?;
                self.refresh_gauges();
                Ok(())
            }
        }
    }

    /// Pushes pending-delivery and idle-rider gauges
    pub fn refresh_gauges(&self) {
        self.metrics
            .set_gauge(metrics::PENDING_DELIVERIES, self.batching.pending_count() as u64);
        self.metrics
            .set_gauge(metrics::IDLE_RIDERS, self.batching.idle_riders() as u64);
    }

    /// Copies every table
    pub fn export_state(&self) -> DispatchResult<EngineState> {
        Ok(EngineState {
            stores: self.stores.all()?,
            inventory: self.ledger.records()?,
            orders: self.assignment.orders()?,
            deliveries: self.batching.deliveries()?,
            batch_groups: self.batching.groups()?,
            riders: self.batching.riders()?,
            carts: self.carts.all()?,
            demand_samples: self.forecast.samples()?,
        })
    }

    /// Loads tables into an empty engine. Store load counters are rebuilt from
    /// non-terminal sub-orders.
    pub fn restore_state(&self, state: EngineState) -> DispatchResult<()> {
        let counts = (
            state.stores.len(),
            state.orders.len(),
            state.deliveries.len(),
        );
        for store in state.stores {
            self.onboard_store(store)?;
        }
        for record in state.inventory {
            self.ledger.restore(record)?;
        }
        for rider in state.riders {
            self.batching.restore_rider(rider)?;
        }

        let mut active: HashMap<StoreId, u32> = HashMap::new();
        for order in state.orders {
            for sub in order.sub_orders.iter().filter(|s| !s.status.is_terminal()) {
                *active.entry(sub.store_id.clone()).or_insert(0) += 1;
            }
            self.assignment.restore_order(order)?;
        }
        for (store, n) in active {
            self.load.restore_active(&store, n)?;
        }

        for delivery in state.deliveries {
            self.batching.restore_delivery(delivery)?;
        }
        for group in state.batch_groups {
            self.batching.restore_group(group)?;
        }
        for cart in state.carts {
            self.carts.restore(cart)?;
        }
        self.forecast.restore(state.demand_samples)?;
        self.refresh_gauges();
        info!(
            "Restored {} stores, {} orders, {} deliveries",
            counts.0, counts.1, counts.2
        );
        Ok(())
    }
}
