//! Turns a cart into a priced, store-reserved order and drives the sub-order
//! state machine.
//!
//! Reservation is atomic per store group; groups succeed or fail independently,
//! so an order may come back with fewer sub-orders than the cart had stores.

use crate::domain::{
    cart::{Cart, CartItem},
    geo_index::GeoIndex,
    inventory::{InventoryLedger, LedgerOp, ReservationRequest, ReservedLine},
    order::*,
    store::StoreRegistry,
    store_load::StoreLoadTracker,
    types::*,
};
use crate::utils::config::AssignmentConfig;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Distances below this are clamped so 1/distance stays finite
const MIN_DISTANCE_KM: f64 = 0.05;

/// Delivery fee for an order sourced from `store_count` stores:
/// `base + (n - 1) * split`, zero when nothing was sourced.
pub fn delivery_fee(store_count: usize, base: Money, split: Money) -> Money {
    match store_count {
        0 => Money::zero(),
        n => base + split * (n as u32 - 1),
    }
}

/// Scored candidate store for one cart item
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreScore {
    /// Store
    pub store_id: StoreId,
    /// Distance from the customer
    pub distance_km: f64,
    /// Final score, higher is better
    pub score: f64,
    /// Active sub-orders at scoring time
    pub active_orders: u32,
    /// Units that can still be reserved
    pub sellable: u32,
}

/// Result of a status change
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionOutcome {
    /// Sub-order after the change
    pub sub_order: SubOrder,
    /// True if the operation had already been applied and nothing changed
    pub replayed: bool,
}

#[derive(Debug, Clone)]
struct OrderHeader {
    id: OrderId,
    customer_id: CustomerId,
    area: AreaId,
    drop_location: GeoPoint,
    delivery_mode: DeliveryMode,
    sub_order_ids: Vec<SubOrderId>,
    unfulfilled: Vec<UnfulfilledGroup>,
    delivery_fee: Money,
    created_at: Timestamp,
}

type SubOrderHandle = Arc<Mutex<SubOrder>>;

/// Store-aware order assignment
#[derive(Debug)]
pub struct OrderAssignmentEngine {
    config: AssignmentConfig,
    stores: Arc<StoreRegistry>,
    geo: Arc<GeoIndex>,
    ledger: Arc<InventoryLedger>,
    load: Arc<StoreLoadTracker>,
    orders: RwLock<HashMap<OrderId, OrderHeader>>,
    sub_orders: RwLock<HashMap<SubOrderId, SubOrderHandle>>,
    order_seq: AtomicU64,
    sub_order_seq: AtomicU64,
}

fn to_requests(lines: &[OrderLine]) -> Vec<ReservationRequest> {
    lines
        .iter()
        .map(|l| ReservationRequest {
            product_id: l.product_id.clone(),
            quantity: l.quantity,
        })
        .collect()
}

fn to_lines(reserved: Vec<ReservedLine>) -> Vec<OrderLine> {
    reserved
        .into_iter()
        .map(|r| OrderLine {
            product_id: r.product_id,
            category: r.category,
            quantity: r.quantity,
            unit_price: r.unit_price,
        })
        .collect()
}

/// Numeric suffix of ids like `ORD-000042`
fn sequence_of(id: &str) -> Option<u64> {
    id.rsplit('-').next().and_then(|n| n.parse().ok())
}

impl OrderAssignmentEngine {
    /// Creates an engine over shared components
    pub fn new(
        config: AssignmentConfig,
        stores: Arc<StoreRegistry>,
        geo: Arc<GeoIndex>,
        ledger: Arc<InventoryLedger>,
        load: Arc<StoreLoadTracker>,
    ) -> Self {
        Self {
            config,
            stores,
            geo,
            ledger,
            load,
            orders: RwLock::new(HashMap::new()),
            sub_orders: RwLock::new(HashMap::new()),
            order_seq: AtomicU64::new(0),
            sub_order_seq: AtomicU64::new(0),
        }
    }

    /// Assignment configuration
    pub fn config(&self) -> &AssignmentConfig {
        &self.config
    }

    /// Ranks stores able to supply `product` near `location`, best first.
    ///
    /// `score = w1/distance + w2*rating + w3*stockSufficiency - w4*loadPenalty`;
    /// ties break by fewer active orders, then store id.
    pub fn rank_stores(
        &self,
        product: &ProductId,
        quantity: u32,
        location: GeoPoint,
    ) -> DispatchResult<Vec<StoreScore>> {
        let c = &self.config;
        let mut scored = Vec::new();
        for nearby in self.geo.within_radius(location, c.service_radius_km)? {
            let store = match self.stores.get(&nearby.store_id) {
                Ok(store) if store.active => store,
                _ => continue,
            };
            let sellable = match self.ledger.sellable(&store.id, product)? {
                Some(n) if n > 0 => n,
                _ => continue,
            };
            let stock_sufficiency = (f64::from(sellable) / f64::from(quantity.max(1))).min(1.0);
            let load = self.load.load(&store.id)?;
            let penalty = self.load.load_penalty(&store.id)?;
            let score = c.w_distance / nearby.distance_km.max(MIN_DISTANCE_KM)
                + c.w_rating * store.rating
                + c.w_stock * stock_sufficiency
                - c.w_load * penalty;
            scored.push(StoreScore {
                store_id: store.id,
                distance_km: nearby.distance_km,
                score,
                active_orders: load.active_orders,
                sellable,
            });
        }
        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.active_orders.cmp(&b.active_orders))
                .then_with(|| a.store_id.cmp(&b.store_id))
        });
        Ok(scored)
    }

    /// Best store able to cover `quantity` of one item
    pub fn select_store(
        &self,
        product: &ProductId,
        quantity: u32,
        location: GeoPoint,
    ) -> DispatchResult<StoreScore> {
        self.select_covering(product, quantity, location, |_| 0)
    }

    /// Best ranked store whose sellable stock covers `quantity` plus what
    /// `claimed` already takes from it
    fn select_covering(
        &self,
        product: &ProductId,
        quantity: u32,
        location: GeoPoint,
        claimed: impl Fn(&StoreId) -> u32,
    ) -> DispatchResult<StoreScore> {
        self.rank_stores(product, quantity, location)?
            .into_iter()
            .find(|candidate| {
                claimed(&candidate.store_id)
                    .checked_add(quantity)
                    .is_some_and(|needed| candidate.sellable >= needed)
            })
            .ok_or_else(|| DispatchError::NoEligibleStore(product.clone()))
    }

    /// Splits cart items into per-store groups, keeping first-appearance order.
    /// Items that cannot be placed anywhere are returned separately.
    fn partition(
        &self,
        items: &[CartItem],
        location: GeoPoint,
    ) -> DispatchResult<(Vec<(StoreId, Vec<ReservationRequest>)>, Vec<(UnfulfilledGroup, DispatchError)>)>
    {
        let mut groups: Vec<(StoreId, Vec<ReservationRequest>)> = Vec::new();
        let mut failed = Vec::new();
        let mut claimed: HashMap<(StoreId, ProductId), u32> = HashMap::new();

        for item in items {
            let store_id = match &item.store_id {
                Some(pinned) => match self.stores.get(pinned) {
                    Ok(store) if store.active => store.id,
                    Ok(_) => {
                        let err = DispatchError::NoEligibleStore(item.product_id.clone());
                        failed.push((unfulfilled(Some(pinned.clone()), vec![item.product_id.clone()], &err), err));
                        continue;
                    }
                    Err(DispatchError::UnknownStore(id)) => {
                        return Err(DispatchError::InvalidCart(format!(
                            "item {} pinned to unknown store {}",
                            item.product_id, id
                        )))
                    }
                    Err(e) => return Err(e),
                },
                None => match self.select_covering(&item.product_id, item.quantity, location, |store| {
                    claimed
                        .get(&(store.clone(), item.product_id.clone()))
                        .copied()
                        .unwrap_or(0)
                }) {
                    Ok(best) => {
                        debug!(
                            "Selected {} for {} (score {:.3}, {:.2} km)",
                            best.store_id, item.product_id, best.score, best.distance_km
                        );
                        best.store_id
                    }
                    Err(err @ DispatchError::NoEligibleStore(_)) => {
                        failed.push((unfulfilled(None, vec![item.product_id.clone()], &err), err));
                        continue;
                    }
                    Err(e) => return Err(e),
                },
            };

            let taken = claimed.entry((store_id.clone(), item.product_id.clone())).or_insert(0);
            *taken = taken.saturating_add(item.quantity);
            let request = ReservationRequest {
                product_id: item.product_id.clone(),
                quantity: item.quantity,
            };
            match groups.iter_mut().find(|(id, _)| id == &store_id) {
                Some((_, requests)) => requests.push(request),
                None => groups.push((store_id, vec![request])),
            }
        }
        Ok((groups, failed))
    }

    fn next_sub_order_id(&self) -> SubOrderId {
        let seq = self.sub_order_seq.fetch_add(1, Ordering::SeqCst) + 1;
        SubOrderId(format!("SUB-{:06}", seq))
    }

    /// Assigns a cart to stores, reserving inventory per store group.
    ///
    /// Returns the order with every group that could be reserved; groups that
    /// failed are listed in `unfulfilled`. Fails only if no group succeeds, with
    /// the first group's error.
    pub fn assign(&self, cart: &Cart, customer_location: GeoPoint, now: Timestamp) -> DispatchResult<Order> {
        cart.validate()?;
        if !customer_location.is_valid() {
            return Err(DispatchError::InvalidCart(format!(
                "invalid delivery location {}",
                customer_location
            )));
        }

        let order_id = OrderId(format!(
            "ORD-{:06}",
            self.order_seq.fetch_add(1, Ordering::SeqCst) + 1
        ));
        let (groups, mut failed) = self.partition(&cart.items, customer_location)?;

        let mut created: Vec<SubOrder> = Vec::new();
        for (store_id, requests) in groups {
            let sub_order_id = self.next_sub_order_id();
            let op = OperationId(sub_order_id.0.clone());
            match self.ledger.reserve_group(&store_id, &requests, &op) {
                Ok(reserved) => {
                    if let Err(e) = self.load.on_sub_order_created(&store_id) {
                        self.rollback_reservation(&store_id, &requests, &op);
                        self.rollback(&created);
                        return Err(e);
                    }
                    created.push(SubOrder {
                        id: sub_order_id,
                        order_id: order_id.clone(),
                        store_id,
                        lines: to_lines(reserved),
                        status: SubOrderStatus::New,
                        history: Vec::new(),
                        created_at: now,
                    });
                }
                Err(err) => {
                    let err = match err {
                        DispatchError::UnknownInventory { product, .. } => {
                            DispatchError::NoEligibleStore(product)
                        }
                        other => other,
                    };
                    match err {
                        DispatchError::InsufficientStock { .. }
                        | DispatchError::NoEligibleStore(_)
                        | DispatchError::ReservationConflict(_) => {
                            let products = requests.iter().map(|r| r.product_id.clone()).collect();
                            warn!("Group at {} for order {} failed: {}", store_id, order_id, err);
                            failed.push((unfulfilled(Some(store_id), products, &err), err));
                        }
                        other => {
                            self.rollback(&created);
                            return Err(other);
                        }
                    }
                }
            }
        }

        if created.is_empty() {
            let (_, first) = failed
                .into_iter()
                .next()
                .ok_or_else(|| DispatchError::InvalidCart("cart produced no groups".to_string()))?;
            return Err(first);
        }

        let delivery_fee = delivery_fee(created.len(), self.config.base_fee, self.config.split_fee);
        let header = OrderHeader {
            id: order_id.clone(),
            customer_id: cart.customer_id.clone(),
            area: cart.area.clone(),
            drop_location: customer_location,
            delivery_mode: cart.delivery_mode,
            sub_order_ids: created.iter().map(|s| s.id.clone()).collect(),
            unfulfilled: failed.into_iter().map(|(group, _)| group).collect(),
            delivery_fee,
            created_at: now,
        };

        {
            let mut subs = self.sub_orders.write().map_err(lock_err("sub-order write"))?;
            for sub in &created {
                subs.insert(sub.id.clone(), Arc::new(Mutex::new(sub.clone())));
            }
        }
        self.orders
            .write()
            .map_err(lock_err("order write"))?
            .insert(order_id.clone(), header.clone());

        let order = compose(&header, created);
        info!(
            "Assigned {} for {}: {} store(s), fee {}, total {}",
            order.id,
            order.customer_id,
            order.store_count(),
            order.delivery_fee,
            order.total
        );
        Ok(order)
    }

    fn rollback_reservation(&self, store: &StoreId, requests: &[ReservationRequest], op: &OperationId) {
        if let Err(e) = self.ledger.release_group(store, requests, op) {
            error!("Failed to roll back reservation {} at {}: {}", op, store, e);
        }
    }

    fn rollback(&self, created: &[SubOrder]) {
        for sub in created {
            let op = OperationId(sub.id.0.clone());
            self.rollback_reservation(&sub.store_id, &to_requests(&sub.lines), &op);
            if let Err(e) = self.load.on_sub_order_terminal(&sub.store_id) {
                error!("Failed to roll back load for {}: {}", sub.store_id, e);
            }
        }
    }

    /// Undoes a just-assigned order: releases its reservations, frees the
    /// store load slots and forgets the order.
    pub fn withdraw(&self, order_id: &OrderId) -> DispatchResult<()> {
        let header = self
            .orders
            .write()
            .map_err(lock_err("order write"))?
            .remove(order_id)
            .ok_or_else(|| DispatchError::UnknownOrder(order_id.clone()))?;
        let mut withdrawn = Vec::with_capacity(header.sub_order_ids.len());
        {
            let mut subs = self.sub_orders.write().map_err(lock_err("sub-order write"))?;
            for id in &header.sub_order_ids {
                if let Some(handle) = subs.remove(id) {
                    withdrawn.push(handle.lock().map_err(lock_err("sub-order"))?.clone());
                }
            }
        }
        self.rollback(&withdrawn);
        for sub in &withdrawn {
            let op = OperationId(sub.id.0.clone());
            if let Err(e) = self.ledger.forget_group(&sub.store_id, &to_requests(&sub.lines), &op) {
                warn!("Could not prune ledger operations of {}: {}", sub.id, e);
            }
        }
        warn!("Withdrew {} with {} sub-order(s)", order_id, withdrawn.len());
        Ok(())
    }

    fn handle(&self, id: &SubOrderId) -> DispatchResult<SubOrderHandle> {
        let subs = self.sub_orders.read().map_err(lock_err("sub-order read"))?;
        subs.get(id)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownSubOrder(id.clone()))
    }

    /// Applies a store- or rider-triggered status change.
    ///
    /// Pickup commits the reservation; cancellation releases it and frees the
    /// store's load slot as one step, reverting the release if the second half
    /// fails. Replays of `operation_id` return the current state unchanged.
    pub fn transition(
        &self,
        id: &SubOrderId,
        to: SubOrderStatus,
        operation_id: Option<OperationId>,
        at: Timestamp,
    ) -> DispatchResult<TransitionOutcome> {
        let handle = self.handle(id)?;
        let mut sub = handle.lock().map_err(lock_err("sub-order"))?;

        if let Some(op) = &operation_id {
            if sub.has_applied(op) {
                debug!("Replayed operation {} on {}", op, id);
                return Ok(TransitionOutcome {
                    sub_order: sub.clone(),
                    replayed: true,
                });
            }
        }

        let from = sub.status;
        if !from.can_transition_to(to) {
            return Err(DispatchError::IllegalStateTransition {
                sub_order: id.clone(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let requests = to_requests(&sub.lines);
        let ledger_op = OperationId(sub.id.0.clone());
        match to {
            SubOrderStatus::PickedUp => {
                self.ledger.commit_group(&sub.store_id, &requests, &ledger_op)?;
            }
            SubOrderStatus::Cancelled => {
                self.ledger.release_group(&sub.store_id, &requests, &ledger_op)?;
                if let Err(e) = self.load.on_sub_order_terminal(&sub.store_id) {
                    if let Err(revert) =
                        self.ledger
                            .revert_group(&sub.store_id, &requests, &ledger_op, LedgerOp::Release)
                    {
                        error!("Could not revert release for {}: {}", id, revert);
                    }
                    return Err(e);
                }
            }
            SubOrderStatus::Delivered => {
                self.load.on_sub_order_terminal(&sub.store_id)?;
            }
            SubOrderStatus::New | SubOrderStatus::Preparing | SubOrderStatus::Ready => {}
        }

        if to.is_terminal() {
            if let Err(e) = self.ledger.forget_group(&sub.store_id, &requests, &ledger_op) {
                warn!("Could not prune ledger operations of {}: {}", id, e);
            }
        }

        sub.status = to;
        sub.history.push(StatusChange {
            from,
            to,
            at,
            operation_id,
        });
        info!("Sub-order {} at {}: {} -> {}", id, sub.store_id, from, to);
        Ok(TransitionOutcome {
            sub_order: sub.clone(),
            replayed: false,
        })
    }

    /// Copy of one sub-order
    pub fn sub_order(&self, id: &SubOrderId) -> DispatchResult<SubOrder> {
        let handle = self.handle(id)?;
        let sub = handle.lock().map_err(lock_err("sub-order"))?;
        Ok(sub.clone())
    }

    /// Full order view with current sub-order states
    pub fn order(&self, id: &OrderId) -> DispatchResult<Order> {
        let header = {
            let orders = self.orders.read().map_err(lock_err("order read"))?;
            orders
                .get(id)
                .cloned()
                .ok_or_else(|| DispatchError::UnknownOrder(id.clone()))?
        };
        let subs = header
            .sub_order_ids
            .iter()
            .map(|sid| self.sub_order(sid))
            .collect::<DispatchResult<Vec<_>>>()?;
        Ok(compose(&header, subs))
    }

    /// All orders sorted by id
    pub fn orders(&self) -> DispatchResult<Vec<Order>> {
        let mut ids: Vec<OrderId> = {
            let orders = self.orders.read().map_err(lock_err("order read"))?;
            orders.keys().cloned().collect()
        };
        ids.sort();
        ids.iter().map(|id| self.order(id)).collect()
    }

    /// Re-inserts an order from a snapshot. Ledger and load counts are restored
    /// separately.
    pub fn restore_order(&self, order: Order) -> DispatchResult<()> {
        if let Some(n) = sequence_of(order.id.as_str()) {
            self.order_seq.fetch_max(n, Ordering::SeqCst);
        }
        let mut subs = self.sub_orders.write().map_err(lock_err("sub-order write"))?;
        for sub in &order.sub_orders {
            if let Some(n) = sequence_of(sub.id.as_str()) {
                self.sub_order_seq.fetch_max(n, Ordering::SeqCst);
            }
            subs.insert(sub.id.clone(), Arc::new(Mutex::new(sub.clone())));
        }
        drop(subs);

        let header = OrderHeader {
            id: order.id.clone(),
            customer_id: order.customer_id,
            area: order.area,
            drop_location: order.drop_location,
            delivery_mode: order.delivery_mode,
            sub_order_ids: order.sub_orders.iter().map(|s| s.id.clone()).collect(),
            unfulfilled: order.unfulfilled,
            delivery_fee: order.delivery_fee,
            created_at: order.created_at,
        };
        self.orders
            .write()
            .map_err(lock_err("order write"))?
            .insert(order.id, header);
        Ok(())
    }
}

fn unfulfilled(store_id: Option<StoreId>, products: Vec<ProductId>, err: &DispatchError) -> UnfulfilledGroup {
    UnfulfilledGroup {
        store_id,
        products,
        reason: err.to_string(),
        kind: err.kind().to_string(),
    }
}

fn compose(header: &OrderHeader, sub_orders: Vec<SubOrder>) -> Order {
    let items_total = sub_orders
        .iter()
        .fold(Money::zero(), |acc, s| acc + s.items_total());
    Order {
        id: header.id.clone(),
        customer_id: header.customer_id.clone(),
        area: header.area.clone(),
        drop_location: header.drop_location,
        delivery_mode: header.delivery_mode,
        sub_orders,
        unfulfilled: header.unfulfilled.clone(),
        items_total,
        delivery_fee: header.delivery_fee,
        total: items_total + header.delivery_fee,
        created_at: header.created_at,
    }
}
