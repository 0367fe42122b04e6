//! Shared-rider trips for deliveries leaving the same store.
//!
//! Deliveries wait in a pool keyed by the grid cell of their pickup store. A
//! cycle clusters pending deliveries per store by drop-point proximity, orders
//! each cluster's stops nearest-neighbour from the pickup, and hands clusters
//! to the nearest rider with enough free capacity. Whatever cannot be matched
//! stays pending for the next cycle.

use crate::domain::{
    geo_index::{haversine_km, within, GeoCell},
    types::*,
};
use crate::utils::config::BatchingConfig;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use tracing::{debug, info, warn};

/// Delivery progress as seen by the rider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Waiting for a rider
    Pending,
    /// Rider assigned, not yet collected
    Assigned,
    /// Rider has the goods
    PickedUp,
    /// Handed to the customer
    Delivered,
    /// Sub-order was cancelled
    Cancelled,
}

impl DeliveryStatus {
    /// Returns true for `Delivered` and `Cancelled`
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Cancelled)
    }
}

/// One rider-assigned unit of work, tied to exactly one sub-order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    /// Delivery identifier
    pub id: DeliveryId,
    /// Sub-order carried
    pub sub_order_id: SubOrderId,
    /// Parent order
    pub order_id: OrderId,
    /// Pickup store
    pub store_id: StoreId,
    /// Store location
    pub pickup: GeoPoint,
    /// Customer location
    pub drop: GeoPoint,
    /// Latest promised hand-over time
    pub promised_by: Timestamp,
    /// When the delivery entered the pending pool
    pub admitted_at: Timestamp,
    /// Progress
    pub status: DeliveryStatus,
    /// Assigned rider
    pub rider_id: Option<RiderId>,
    /// Batch shared with other deliveries, if any
    pub batch_group_id: Option<BatchGroupId>,
}

impl Delivery {
    /// Creates a pending delivery
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: DeliveryId,
        sub_order_id: SubOrderId,
        order_id: OrderId,
        store_id: StoreId,
        pickup: GeoPoint,
        drop: GeoPoint,
        promised_by: Timestamp,
        admitted_at: Timestamp,
    ) -> Self {
        Self {
            id,
            sub_order_id,
            order_id,
            store_id,
            pickup,
            drop,
            promised_by,
            admitted_at,
            status: DeliveryStatus::Pending,
            rider_id: None,
            batch_group_id: None,
        }
    }

    fn windows_overlap(&self, other: &Delivery) -> bool {
        self.admitted_at <= other.promised_by && other.admitted_at <= self.promised_by
    }
}

/// Delivery rider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rider {
    /// Rider identifier
    pub id: RiderId,
    /// Last reported position
    pub location: GeoPoint,
    /// Max deliveries carried at once
    pub capacity: u32,
    /// Deliveries currently assigned and not terminal
    #[serde(default)]
    pub assigned: u32,
    /// Accepting trips
    pub online: bool,
}

impl Rider {
    /// Creates an online rider with nothing assigned
    pub fn new(id: RiderId, location: GeoPoint, capacity: u32) -> Self {
        Self {
            id,
            location,
            capacity,
            assigned: 0,
            online: true,
        }
    }

    /// Free slots
    pub fn remaining(&self) -> u32 {
        self.capacity.saturating_sub(self.assigned)
    }

    /// Online with at least one free slot
    pub fn is_idle(&self) -> bool {
        self.online && self.remaining() > 0
    }
}

/// A drop in visiting order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteStop {
    /// Delivery dropped here
    pub delivery_id: DeliveryId,
    /// Drop location
    pub location: GeoPoint,
    /// Distance from the previous stop
    pub leg_km: f64,
}

/// Deliveries sharing one rider trip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchGroup {
    /// Group identifier
    pub id: BatchGroupId,
    /// Rider doing the trip
    pub rider_id: RiderId,
    /// Shared pickup store
    pub store_id: StoreId,
    /// Pickup location
    pub pickup: GeoPoint,
    /// Drops in visiting order
    pub route: Vec<RouteStop>,
    /// Tour length pickup -> drops -> pickup
    pub route_distance_km: f64,
    /// Separate round trips minus the tour
    pub distance_saved_km: f64,
    /// When the group was formed
    pub formed_at: Timestamp,
    /// Set once every member reached a terminal state
    #[serde(default)]
    pub bonus: Option<BonusOutcome>,
}

impl BatchGroup {
    /// Member deliveries in visiting order
    pub fn members(&self) -> Vec<DeliveryId> {
        self.route.iter().map(|s| s.delivery_id.clone()).collect()
    }
}

/// Bonus decision for a completed batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BonusOutcome {
    /// Every member was delivered
    Granted {
        /// Rider earning the bonus
        rider: RiderId,
        /// Bonus amount
        amount: Money,
        /// Batch
        group: BatchGroupId,
    },
    /// At least one member was cancelled
    Forfeited {
        /// Rider who did the trip
        rider: RiderId,
        /// Batch
        group: BatchGroupId,
    },
}

/// One trip decided by a planning pass
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedTrip {
    /// Rider chosen
    pub rider_id: RiderId,
    /// Pickup store
    pub store_id: StoreId,
    /// Pickup location
    pub pickup: GeoPoint,
    /// Drops in visiting order
    pub route: Vec<RouteStop>,
    /// Tour length
    pub route_distance_km: f64,
    /// Savings against separate round trips
    pub distance_saved_km: f64,
}

impl PlannedTrip {
    /// True when the trip carries more than one delivery
    pub fn is_batch(&self) -> bool {
        self.route.len() > 1
    }
}

/// Result of `form_batches`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CyclePlan {
    /// Trips with a rider
    pub trips: Vec<PlannedTrip>,
    /// Deliveries left pending
    pub unmatched: Vec<DeliveryId>,
}

/// What one batching run did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    /// Batch groups created
    pub groups_formed: Vec<BatchGroupId>,
    /// Deliveries assigned to a rider (batched or alone)
    pub assigned: usize,
    /// Deliveries left pending
    pub unmatched: Vec<DeliveryId>,
    /// Pending deliveries older than the batching timeout
    pub timed_out: Vec<DeliveryId>,
}

impl CycleReport {
    fn absorb(&mut self, other: CycleReport) {
        self.groups_formed.extend(other.groups_formed);
        self.assigned += other.assigned;
        self.unmatched = other.unmatched;
        self.timed_out = other.timed_out;
    }
}

/// Greedy clustering of pending deliveries by store and drop proximity.
///
/// Seeds are taken in order of earliest promise. A seed pulls in other
/// deliveries from the same store whose drop is within `proximity_km` of the
/// seed's drop and whose time window overlaps, up to `max_batch_size`.
pub fn cluster(pending: &[Delivery], proximity_km: f64, max_batch_size: usize) -> Vec<Vec<Delivery>> {
    let mut order: Vec<&Delivery> = pending.iter().collect();
    order.sort_by(|a, b| a.promised_by.cmp(&b.promised_by).then_with(|| a.id.cmp(&b.id)));

    let mut taken = vec![false; order.len()];
    let mut clusters = Vec::new();
    for i in 0..order.len() {
        if taken[i] {
            continue;
        }
        taken[i] = true;
        let seed = order[i];
        let mut members = vec![seed.clone()];
        for j in (i + 1)..order.len() {
            if members.len() >= max_batch_size {
                break;
            }
            let other = order[j];
            if !taken[j]
                && other.store_id == seed.store_id
                && within(seed.drop, other.drop, proximity_km)
                && seed.windows_overlap(other)
            {
                taken[j] = true;
                members.push(other.clone());
            }
        }
        clusters.push(members);
    }
    clusters
}

/// Nearest-neighbour stop order from the pickup; equal distances go to the
/// earlier promise. Returns the stops and the closed tour length.
pub fn sequence_route(pickup: GeoPoint, members: &[Delivery]) -> (Vec<RouteStop>, f64) {
    let mut remaining: Vec<&Delivery> = members.iter().collect();
    let mut route = Vec::with_capacity(members.len());
    let mut at = pickup;
    let mut total = 0.0;

    while !remaining.is_empty() {
        let mut best = 0;
        for (idx, candidate) in remaining.iter().enumerate().skip(1) {
            let current = remaining[best];
            let d_candidate = haversine_km(at, candidate.drop);
            let d_current = haversine_km(at, current.drop);
            let closer = d_candidate < d_current
                || (d_candidate == d_current && candidate.promised_by < current.promised_by);
            if closer {
                best = idx;
            }
        }
        let next = remaining.remove(best);
        let leg_km = haversine_km(at, next.drop);
        total += leg_km;
        at = next.drop;
        route.push(RouteStop {
            delivery_id: next.id.clone(),
            location: next.drop,
            leg_km,
        });
    }
    total += haversine_km(at, pickup);
    (route, total)
}

/// Plans one batching cycle without touching scheduler state.
///
/// Clusters are matched in order of their most urgent member; each goes to the
/// nearest rider (to the pickup) whose free capacity covers the whole cluster,
/// ties by rider id. When no rider can take a cluster whole it is split across
/// riders, most urgent drops first.
pub fn form_batches(pending: &[Delivery], riders: &[Rider], config: &BatchingConfig) -> CyclePlan {
    let mut clusters = cluster(pending, config.proximity_km, config.max_batch_size.max(1));
    clusters.sort_by_key(|c| c.iter().map(|d| d.promised_by).min());

    let mut free: Vec<(Rider, u32)> = riders
        .iter()
        .filter(|r| r.online)
        .map(|r| (r.clone(), r.remaining()))
        .collect();

    let mut plan = CyclePlan::default();
    let mut queue: VecDeque<Vec<Delivery>> = clusters.into();
    while let Some(mut members) = queue.pop_front() {
        let Some(first) = members.first() else {
            continue;
        };
        let pickup = first.pickup;
        let needed = members.len() as u32;
        let nearest_with = |min_slots: u32| {
            free.iter()
                .enumerate()
                .filter(|(_, (_, slots))| *slots >= min_slots)
                .min_by(|(_, (a, _)), (_, (b, _))| {
                    haversine_km(a.location, pickup)
                        .total_cmp(&haversine_km(b.location, pickup))
                        .then_with(|| a.id.cmp(&b.id))
                })
                .map(|(idx, _)| idx)
        };
        // No rider takes the whole cluster: the nearest rider with room takes
        // the most urgent members and the rest go back in the queue
        let Some(idx) = nearest_with(needed).or_else(|| nearest_with(1)) else {
            plan.unmatched.extend(members.iter().map(|d| d.id.clone()));
            continue;
        };
        let (rider, slots) = &mut free[idx];
        if *slots < needed {
            members.sort_by(|a, b| a.promised_by.cmp(&b.promised_by).then_with(|| a.id.cmp(&b.id)));
            let rest = members.split_off(*slots as usize);
            queue.push_back(rest);
        }
        *slots -= members.len() as u32;
        let store_id = members[0].store_id.clone();

        let (route, route_distance_km) = sequence_route(pickup, &members);
        let separate: f64 = members.iter().map(|d| 2.0 * haversine_km(pickup, d.drop)).sum();
        plan.trips.push(PlannedTrip {
            rider_id: rider.id.clone(),
            store_id,
            pickup,
            route,
            route_distance_km,
            distance_saved_km: (separate - route_distance_km).max(0.0),
        });
    }
    plan
}

#[derive(Debug, Default)]
struct SchedulerState {
    pending: HashMap<GeoCell, Vec<DeliveryId>>,
    deliveries: HashMap<DeliveryId, Delivery>,
    by_sub_order: HashMap<SubOrderId, DeliveryId>,
    riders: HashMap<RiderId, Rider>,
    groups: HashMap<BatchGroupId, BatchGroup>,
}

impl SchedulerState {
    fn pending_deliveries(&self) -> Vec<Delivery> {
        self.pending
            .values()
            .flatten()
            .filter_map(|id| self.deliveries.get(id).cloned())
            .collect()
    }

    fn unpend(&mut self, id: &DeliveryId) {
        for ids in self.pending.values_mut() {
            ids.retain(|p| p != id);
        }
        self.pending.retain(|_, ids| !ids.is_empty());
    }
}

/// Thread-safe batching scheduler.
///
/// `run_cycle` never interleaves with itself: a trigger arriving while a run is
/// active is folded into that run.
#[derive(Debug)]
pub struct BatchingScheduler {
    config: BatchingConfig,
    cell_size_deg: f64,
    state: RwLock<SchedulerState>,
    running: AtomicBool,
    rerun: AtomicBool,
    group_seq: AtomicU64,
}

impl BatchingScheduler {
    /// Creates a scheduler whose pool uses the given cell size
    pub fn new(config: BatchingConfig, cell_size_deg: f64) -> Self {
        Self {
            config,
            cell_size_deg,
            state: RwLock::new(SchedulerState::default()),
            running: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            group_seq: AtomicU64::new(0),
        }
    }

    /// Batching configuration
    pub fn config(&self) -> &BatchingConfig {
        &self.config
    }

    /// Adds a delivery to the pending pool
    pub fn admit(&self, delivery: Delivery) -> DispatchResult<()> {
        self.admit_all(vec![delivery])
    }

    /// Admits every delivery of one order under a single lock, so either all
    /// of them are pending or none is
    pub fn admit_all(&self, deliveries: Vec<Delivery>) -> DispatchResult<()> {
        let mut state = self.state.write().map_err(lock_err("batching write"))?;
        for delivery in deliveries {
            let cell = GeoCell::of(delivery.pickup, self.cell_size_deg);
            debug!("Admitted {} for {} in cell {:?}", delivery.id, delivery.sub_order_id, cell);
            state
                .by_sub_order
                .insert(delivery.sub_order_id.clone(), delivery.id.clone());
            state.pending.entry(cell).or_default().push(delivery.id.clone());
            state.deliveries.insert(delivery.id.clone(), delivery);
        }
        Ok(())
    }

    /// Whether a cycle should run now: something is pending and either a rider
    /// has free capacity or the oldest pending delivery hit the timeout
    pub fn should_run(&self, now: Timestamp) -> DispatchResult<bool> {
        let state = self.state.read().map_err(lock_err("batching read"))?;
        let oldest = state
            .pending
            .values()
            .flatten()
            .filter_map(|id| state.deliveries.get(id))
            .map(|d| d.admitted_at)
            .min();
        let Some(oldest) = oldest else {
            return Ok(false);
        };
        let idle = state.riders.values().any(Rider::is_idle);
        Ok(idle || (now - oldest).num_seconds() >= self.config.timeout_secs)
    }

    /// Runs one batching cycle. Returns `None` when another run was already in
    /// progress; that run repeats once more to cover this trigger.
    pub fn run_cycle(&self, now: Timestamp) -> DispatchResult<Option<CycleReport>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.rerun.store(true, Ordering::SeqCst);
            debug!("Batching cycle already running, trigger coalesced");
            return Ok(None);
        }

        let mut report = CycleReport::default();
        loop {
            let result = loop {
                self.rerun.store(false, Ordering::SeqCst);
                match self.cycle_once(now) {
                    Ok(one) => report.absorb(one),
                    Err(e) => break Err(e),
                }
                if !self.rerun.load(Ordering::SeqCst) {
                    break Ok(());
                }
            };
            if let Err(e) = result {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
            if !self.release() {
                return Ok(Some(report));
            }
        }
    }

    /// Clears the running flag. Returns true when a trigger coalesced after
    /// the last pass and the cycle was re-acquired to serve it.
    fn release(&self) -> bool {
        self.running.store(false, Ordering::SeqCst);
        self.rerun.load(Ordering::SeqCst)
            && self
                .running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }

    fn cycle_once(&self, now: Timestamp) -> DispatchResult<CycleReport> {
        let mut state = self.state.write().map_err(lock_err("batching write"))?;
        let pending = state.pending_deliveries();
        let mut report = CycleReport::default();
        if pending.is_empty() {
            return Ok(report);
        }

        for d in &pending {
            let waited_secs = (now - d.admitted_at).num_seconds();
            if waited_secs >= self.config.timeout_secs {
                let advisory = DispatchError::BatchingTimeout {
                    delivery: d.id.clone(),
                    waited_secs,
                };
                warn!("{}", advisory);
                report.timed_out.push(d.id.clone());
            }
        }

        let mut riders: Vec<Rider> = state.riders.values().cloned().collect();
        riders.sort_by(|a, b| a.id.cmp(&b.id));
        let plan = form_batches(&pending, &riders, &self.config);

        for trip in plan.trips {
            let group_id = trip.is_batch().then(|| {
                BatchGroupId(format!(
                    "BATCH-{:06}",
                    self.group_seq.fetch_add(1, Ordering::SeqCst) + 1
                ))
            });
            for stop in &trip.route {
                if let Some(delivery) = state.deliveries.get_mut(&stop.delivery_id) {
                    delivery.status = DeliveryStatus::Assigned;
                    delivery.rider_id = Some(trip.rider_id.clone());
                    delivery.batch_group_id = group_id.clone();
                }
                state.unpend(&stop.delivery_id);
            }
            if let Some(rider) = state.riders.get_mut(&trip.rider_id) {
                rider.assigned += trip.route.len() as u32;
            }
            report.assigned += trip.route.len();

            if let Some(id) = group_id {
                info!(
                    "Formed {} for rider {}: {} drops, {:.2} km tour, {:.2} km saved",
                    id,
                    trip.rider_id,
                    trip.route.len(),
                    trip.route_distance_km,
                    trip.distance_saved_km
                );
                state.groups.insert(
                    id.clone(),
                    BatchGroup {
                        id: id.clone(),
                        rider_id: trip.rider_id,
                        store_id: trip.store_id,
                        pickup: trip.pickup,
                        route: trip.route,
                        route_distance_km: trip.route_distance_km,
                        distance_saved_km: trip.distance_saved_km,
                        formed_at: now,
                        bonus: None,
                    },
                );
                report.groups_formed.push(id);
            }
        }

        if !plan.unmatched.is_empty() {
            debug!("{} deliveries left pending", plan.unmatched.len());
        }
        report.unmatched = plan.unmatched;
        Ok(report)
    }

    /// Mirrors a sub-order status change onto its delivery.
    ///
    /// Terminal states free the rider's slot. When the last member of a batch
    /// reaches a terminal state the bonus is decided once and returned.
    pub fn record_delivery_status(
        &self,
        sub_order_id: &SubOrderId,
        status: DeliveryStatus,
    ) -> DispatchResult<Option<BonusOutcome>> {
        let mut state = self.state.write().map_err(lock_err("batching write"))?;
        let delivery_id = state
            .by_sub_order
            .get(sub_order_id)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownSubOrder(sub_order_id.clone()))?;

        let (rider_id, group_id, was_pending) = {
            let delivery = state
                .deliveries
                .get_mut(&delivery_id)
                .ok_or_else(|| DispatchError::UnknownDelivery(delivery_id.clone()))?;
            if delivery.status.is_terminal() || delivery.status == status {
                return Ok(None);
            }
            let was_pending = delivery.status == DeliveryStatus::Pending;
            delivery.status = status;
            (delivery.rider_id.clone(), delivery.batch_group_id.clone(), was_pending)
        };

        if was_pending {
            state.unpend(&delivery_id);
        }
        if !status.is_terminal() {
            return Ok(None);
        }
        if let Some(rider) = rider_id.as_ref().and_then(|id| state.riders.get_mut(id)) {
            rider.assigned = rider.assigned.saturating_sub(1);
        }

        let Some(group_id) = group_id else {
            return Ok(None);
        };
        let statuses: Vec<DeliveryStatus> = match state.groups.get(&group_id) {
            Some(group) if group.bonus.is_none() => group
                .route
                .iter()
                .filter_map(|s| state.deliveries.get(&s.delivery_id).map(|d| d.status))
                .collect(),
            _ => return Ok(None),
        };
        if !statuses.iter().all(DeliveryStatus::is_terminal) {
            return Ok(None);
        }

        let Some(group) = state.groups.get_mut(&group_id) else {
            return Ok(None);
        };
        let outcome = if statuses.iter().all(|s| *s == DeliveryStatus::Delivered) {
            info!("Batch bonus {} granted to {} for {}", self.config.batch_bonus, group.rider_id, group.id);
            BonusOutcome::Granted {
                rider: group.rider_id.clone(),
                amount: self.config.batch_bonus,
                group: group.id.clone(),
            }
        } else {
            warn!("Batch bonus forfeited for {} ({}): a member was cancelled", group.id, group.rider_id);
            BonusOutcome::Forfeited {
                rider: group.rider_id.clone(),
                group: group.id.clone(),
            }
        };
        group.bonus = Some(outcome.clone());
        Ok(Some(outcome))
    }

    /// Adds a rider or updates position/capacity of an existing one, keeping
    /// its current assignments
    pub fn register_rider(&self, rider: Rider) -> DispatchResult<Rider> {
        let mut state = self.state.write().map_err(lock_err("batching write"))?;
        let entry = state
            .riders
            .entry(rider.id.clone())
            .and_modify(|r| {
                r.location = rider.location;
                r.capacity = rider.capacity;
                r.online = rider.online;
            })
            .or_insert(rider);
        info!("Rider {} registered (capacity {})", entry.id, entry.capacity);
        Ok(entry.clone())
    }

    /// Restores a rider verbatim
    pub fn restore_rider(&self, rider: Rider) -> DispatchResult<()> {
        let mut state = self.state.write().map_err(lock_err("batching write"))?;
        state.riders.insert(rider.id.clone(), rider);
        Ok(())
    }

    /// Updates a rider's position
    pub fn update_rider_location(&self, id: &RiderId, location: GeoPoint) -> DispatchResult<()> {
        let mut state = self.state.write().map_err(lock_err("batching write"))?;
        let rider = state
            .riders
            .get_mut(id)
            .ok_or_else(|| DispatchError::UnknownRider(id.clone()))?;
        rider.location = location;
        Ok(())
    }

    /// Takes a rider on or off shift
    pub fn set_rider_online(&self, id: &RiderId, online: bool) -> DispatchResult<()> {
        let mut state = self.state.write().map_err(lock_err("batching write"))?;
        let rider = state
            .riders
            .get_mut(id)
            .ok_or_else(|| DispatchError::UnknownRider(id.clone()))?;
        rider.online = online;
        info!("Rider {} is now {}", id, if online { "online" } else { "offline" });
        Ok(())
    }

    /// Copy of one rider
    pub fn rider(&self, id: &RiderId) -> DispatchResult<Rider> {
        let state = self.state.read().map_err(lock_err("batching read"))?;
        state
            .riders
            .get(id)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownRider(id.clone()))
    }

    /// All riders sorted by id
    pub fn riders(&self) -> DispatchResult<Vec<Rider>> {
        let state = self.state.read().map_err(lock_err("batching read"))?;
        let mut riders: Vec<Rider> = state.riders.values().cloned().collect();
        riders.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(riders)
    }

    /// Delivery carrying a sub-order
    pub fn delivery_for(&self, sub_order_id: &SubOrderId) -> DispatchResult<Delivery> {
        let state = self.state.read().map_err(lock_err("batching read"))?;
        state
            .by_sub_order
            .get(sub_order_id)
            .and_then(|id| state.deliveries.get(id))
            .cloned()
            .ok_or_else(|| DispatchError::UnknownSubOrder(sub_order_id.clone()))
    }

    /// One delivery by id
    pub fn delivery(&self, id: &DeliveryId) -> DispatchResult<Delivery> {
        let state = self.state.read().map_err(lock_err("batching read"))?;
        state
            .deliveries
            .get(id)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownDelivery(id.clone()))
    }

    /// All deliveries sorted by id
    pub fn deliveries(&self) -> DispatchResult<Vec<Delivery>> {
        let state = self.state.read().map_err(lock_err("batching read"))?;
        let mut out: Vec<Delivery> = state.deliveries.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    /// One batch group
    pub fn group(&self, id: &BatchGroupId) -> Option<BatchGroup> {
        self.state.read().ok().and_then(|s| s.groups.get(id).cloned())
    }

    /// All batch groups sorted by id
    pub fn groups(&self) -> DispatchResult<Vec<BatchGroup>> {
        let state = self.state.read().map_err(lock_err("batching read"))?;
        let mut out: Vec<BatchGroup> = state.groups.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    /// Restores a delivery; pending ones go back into the pool
    pub fn restore_delivery(&self, delivery: Delivery) -> DispatchResult<()> {
        if delivery.status == DeliveryStatus::Pending {
            return self.admit(delivery);
        }
        let mut state = self.state.write().map_err(lock_err("batching write"))?;
        state
            .by_sub_order
            .insert(delivery.sub_order_id.clone(), delivery.id.clone());
        state.deliveries.insert(delivery.id.clone(), delivery);
        Ok(())
    }

    /// Restores a batch group and keeps new ids above it
    pub fn restore_group(&self, group: BatchGroup) -> DispatchResult<()> {
        if let Some(n) = group.id.as_str().rsplit('-').next().and_then(|n| n.parse().ok()) {
            self.group_seq.fetch_max(n, Ordering::SeqCst);
        }
        let mut state = self.state.write().map_err(lock_err("batching write"))?;
        state.groups.insert(group.id.clone(), group);
        Ok(())
    }

    /// Deliveries waiting for a rider
    pub fn pending_count(&self) -> usize {
        self.state
            .read()
            .map(|s| s.pending.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Online riders with free capacity
    pub fn idle_riders(&self) -> usize {
        self.state
            .read()
            .map(|s| s.riders.values().filter(|r| r.is_idle()).count())
            .unwrap_or(0)
    }
}
