//! Authoritative per-store stock with two-phase reserve / commit / release.
//!
//! Every `(store, product)` record sits behind its own mutex, so mutations on one
//! key are serialized while different keys proceed in parallel. Multi-key
//! operations lock their keys in sorted order and validate everything before
//! mutating anything. Each mutation carries an [`OperationId`]; a replayed
//! operation is recognised and ignored. Sub-order operation ids are dropped
//! once the sub-order is terminal; restock ids are kept for a bounded window.

use crate::domain::types::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError};
use tracing::{debug, info};

/// Restock operation ids remembered per record for replay detection
pub const RESTOCK_REPLAY_WINDOW: usize = 256;

/// Composite key of an inventory record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InventoryKey {
    /// Store
    pub store_id: StoreId,
    /// Product
    pub product_id: ProductId,
}

impl InventoryKey {
    /// Creates a key
    pub fn new(store_id: StoreId, product_id: ProductId) -> Self {
        Self {
            store_id,
            product_id,
        }
    }
}

/// Shelf health of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockStatus {
    /// At or above the minimum threshold
    Healthy,
    /// Below the minimum threshold
    Low,
    /// Below half the minimum threshold
    Critical,
    /// Nothing on hand
    OutOfStock,
}

/// Stock for one product at one store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryRecord {
    /// Store
    pub store_id: StoreId,
    /// Product
    pub product_id: ProductId,
    /// Product category
    pub category: Category,
    /// Shelf price
    pub unit_price: Money,
    /// Units physically on hand, reserved units included
    pub available: u32,
    /// Units promised to open sub-orders
    pub reserved: u32,
    /// Restock below this level
    pub min_threshold: u32,
    /// Operations already applied to this record
    #[serde(default)]
    pub applied_ops: BTreeSet<OperationId>,
    /// Restock ids in arrival order, oldest first
    #[serde(default)]
    pub restock_ops: VecDeque<OperationId>,
}

impl InventoryRecord {
    /// Creates a record with nothing reserved
    pub fn new(
        store_id: StoreId,
        product_id: ProductId,
        category: Category,
        unit_price: Money,
        available: u32,
        min_threshold: u32,
    ) -> Self {
        Self {
            store_id,
            product_id,
            category,
            unit_price,
            available,
            reserved: 0,
            min_threshold,
            applied_ops: BTreeSet::new(),
            restock_ops: VecDeque::new(),
        }
    }

    /// Units that can still be reserved
    pub fn sellable(&self) -> u32 {
        self.available.saturating_sub(self.reserved)
    }

    /// Shelf health
    pub fn status(&self) -> StockStatus {
        if self.available == 0 {
            StockStatus::OutOfStock
        } else if self.available.saturating_mul(2) < self.min_threshold {
            StockStatus::Critical
        } else if self.available < self.min_threshold {
            StockStatus::Low
        } else {
            StockStatus::Healthy
        }
    }

    /// Units needed to get back to the minimum threshold
    pub fn restock_suggestion(&self) -> u32 {
        self.min_threshold.saturating_sub(self.available)
    }

    fn key(&self) -> InventoryKey {
        InventoryKey::new(self.store_id.clone(), self.product_id.clone())
    }

    fn check_reserve(&self, quantity: u32) -> DispatchResult<()> {
        if self.sellable() < quantity {
            return Err(DispatchError::InsufficientStock {
                store: self.store_id.clone(),
                product: self.product_id.clone(),
                requested: quantity,
                sellable: self.sellable(),
            });
        }
        Ok(())
    }

    fn check_restock(&self, quantity: u32) -> DispatchResult<()> {
        if self.available.checked_add(quantity).is_none() {
            return Err(DispatchError::ParseError(format!(
                "restock of {} units overflows stock of {} at {}",
                quantity, self.product_id, self.store_id
            )));
        }
        Ok(())
    }

    fn check_reserved(&self, quantity: u32) -> DispatchResult<()> {
        if self.reserved < quantity {
            return Err(DispatchError::ReservationMismatch {
                store: self.store_id.clone(),
                product: self.product_id.clone(),
                requested: quantity,
                reserved: self.reserved,
            });
        }
        Ok(())
    }

    fn apply(&mut self, kind: LedgerOp, quantity: u32, op: OperationId) {
        match kind {
            LedgerOp::Reserve => self.reserved += quantity,
            LedgerOp::Commit => {
                self.reserved -= quantity;
                self.available -= quantity;
            }
            LedgerOp::Release => self.reserved -= quantity,
            LedgerOp::Restock => {
                self.available += quantity;
                self.restock_ops.push_back(op.clone());
                while self.restock_ops.len() > RESTOCK_REPLAY_WINDOW {
                    if let Some(oldest) = self.restock_ops.pop_front() {
                        self.applied_ops.remove(&oldest);
                    }
                }
            }
        }
        self.applied_ops.insert(op);
    }
}

/// Ledger mutation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOp {
    /// available - reserved -> reserved
    Reserve,
    /// reserved -> gone
    Commit,
    /// reserved -> available - reserved
    Release,
    /// add on-hand units
    Restock,
}

impl LedgerOp {
    fn tag(&self) -> &'static str {
        match self {
            LedgerOp::Reserve => "reserve",
            LedgerOp::Commit => "commit",
            LedgerOp::Release => "release",
            LedgerOp::Restock => "restock",
        }
    }
}

/// One line of a reservation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRequest {
    /// Product
    pub product_id: ProductId,
    /// Units
    pub quantity: u32,
}

/// A line the ledger reserved, priced at reservation time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservedLine {
    /// Product
    pub product_id: ProductId,
    /// Category
    pub category: Category,
    /// Units reserved
    pub quantity: u32,
    /// Shelf price when reserved
    pub unit_price: Money,
}

/// Item below its minimum threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LowStockItem {
    /// Product
    pub product_id: ProductId,
    /// On hand
    pub available: u32,
    /// Threshold
    pub min_threshold: u32,
    /// Health
    pub status: StockStatus,
    /// Units to order
    pub suggested_restock: u32,
}

type RecordHandle = Arc<Mutex<InventoryRecord>>;

/// Thread-safe inventory ledger
#[derive(Debug)]
pub struct InventoryLedger {
    records: RwLock<HashMap<InventoryKey, RecordHandle>>,
    max_lock_attempts: u32,
}

impl InventoryLedger {
    /// Creates an empty ledger. Reservations give up with `ReservationConflict`
    /// after `max_lock_attempts` failed tries on a contended key.
    pub fn new(max_lock_attempts: u32) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            max_lock_attempts: max_lock_attempts.max(1),
        }
    }

    /// Adds a listing, or replaces price/category/threshold of an existing one.
    /// Stock counts of an existing record are left untouched.
    pub fn upsert(&self, record: InventoryRecord) -> DispatchResult<()> {
        let key = record.key();
        let mut records = self.records.write().map_err(lock_err("inventory write"))?;
        match records.get(&key) {
            Some(handle) => {
                let mut existing = handle.lock().map_err(lock_err("inventory record"))?;
                existing.category = record.category;
                existing.unit_price = record.unit_price;
                existing.min_threshold = record.min_threshold;
            }
            None => {
                records.insert(key, Arc::new(Mutex::new(record)));
            }
        }
        Ok(())
    }

    /// Inserts a record verbatim, counts included (snapshot restore)
    pub fn restore(&self, record: InventoryRecord) -> DispatchResult<()> {
        let key = record.key();
        let mut records = self.records.write().map_err(lock_err("inventory write"))?;
        records.insert(key, Arc::new(Mutex::new(record)));
        Ok(())
    }

    fn handle(&self, store: &StoreId, product: &ProductId) -> DispatchResult<RecordHandle> {
        let records = self.records.read().map_err(lock_err("inventory read"))?;
        records
            .get(&InventoryKey::new(store.clone(), product.clone()))
            .cloned()
            .ok_or_else(|| DispatchError::UnknownInventory {
                store: store.clone(),
                product: product.clone(),
            })
    }

    /// Fail-fast lock used on the customer-facing reservation path
    fn try_lock<'a>(
        &self,
        handle: &'a Mutex<InventoryRecord>,
        product: &ProductId,
    ) -> DispatchResult<MutexGuard<'a, InventoryRecord>> {
        for _ in 0..self.max_lock_attempts {
            match handle.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::WouldBlock) => std::thread::yield_now(),
                Err(TryLockError::Poisoned(_)) => {
                    return Err(DispatchError::LockError(format!(
                        "Inventory record for {} poisoned",
                        product
                    )))
                }
            }
        }
        Err(DispatchError::ReservationConflict(format!(
            "Inventory record for {} is busy",
            product
        )))
    }

    fn op_id(op: &OperationId, kind: LedgerOp, product: &ProductId) -> OperationId {
        OperationId(format!("{}:{}:{}", op, kind.tag(), product))
    }

    /// Reserves `quantity` units; fails with `InsufficientStock` if
    /// `available - reserved < quantity`. Replays of `op` are no-ops.
    pub fn reserve(
        &self,
        store: &StoreId,
        product: &ProductId,
        quantity: u32,
        op: &OperationId,
    ) -> DispatchResult<bool> {
        self.mutate(store, product, quantity, op, LedgerOp::Reserve)
    }

    /// Turns reserved units into a permanent deduction (on pickup)
    pub fn commit(
        &self,
        store: &StoreId,
        product: &ProductId,
        quantity: u32,
        op: &OperationId,
    ) -> DispatchResult<bool> {
        self.mutate(store, product, quantity, op, LedgerOp::Commit)
    }

    /// Returns reserved units to the shelf (on cancellation before pickup)
    pub fn release(
        &self,
        store: &StoreId,
        product: &ProductId,
        quantity: u32,
        op: &OperationId,
    ) -> DispatchResult<bool> {
        self.mutate(store, product, quantity, op, LedgerOp::Release)
    }

    /// Store restock action
    pub fn restock(
        &self,
        store: &StoreId,
        product: &ProductId,
        quantity: u32,
        op: &OperationId,
    ) -> DispatchResult<bool> {
        let applied = self.mutate(store, product, quantity, op, LedgerOp::Restock)?;
        if applied {
            info!("Restocked {} units of {} at {}", quantity, product, store);
        }
        Ok(applied)
    }

    /// Single-key mutation; returns false when `op` was already applied
    fn mutate(
        &self,
        store: &StoreId,
        product: &ProductId,
        quantity: u32,
        op: &OperationId,
        kind: LedgerOp,
    ) -> DispatchResult<bool> {
        let handle = self.handle(store, product)?;
        let mut record = match kind {
            LedgerOp::Reserve => self.try_lock(&handle, product)?,
            _ => handle.lock().map_err(lock_err("inventory record"))?,
        };
        let op_id = Self::op_id(op, kind, product);
        if record.applied_ops.contains(&op_id) {
            debug!("Skipping replayed {} on {}/{}", kind.tag(), store, product);
            return Ok(false);
        }
        match kind {
            LedgerOp::Reserve => record.check_reserve(quantity)?,
            LedgerOp::Commit | LedgerOp::Release => record.check_reserved(quantity)?,
            LedgerOp::Restock => record.check_restock(quantity)?,
        }
        record.apply(kind, quantity, op_id);
        Ok(true)
    }

    /// Reserves every line for one store atomically: either all lines are
    /// reserved or none is. Duplicate products are merged.
    pub fn reserve_group(
        &self,
        store: &StoreId,
        items: &[ReservationRequest],
        op: &OperationId,
    ) -> DispatchResult<Vec<ReservedLine>> {
        let merged = merge_requests(items)?;
        self.apply_group(store, &merged, op, LedgerOp::Reserve)
    }

    /// Commits every line of a sub-order atomically
    pub fn commit_group(
        &self,
        store: &StoreId,
        items: &[ReservationRequest],
        op: &OperationId,
    ) -> DispatchResult<Vec<ReservedLine>> {
        let merged = merge_requests(items)?;
        self.apply_group(store, &merged, op, LedgerOp::Commit)
    }

    /// Releases every line of a sub-order atomically
    pub fn release_group(
        &self,
        store: &StoreId,
        items: &[ReservationRequest],
        op: &OperationId,
    ) -> DispatchResult<Vec<ReservedLine>> {
        let merged = merge_requests(items)?;
        self.apply_group(store, &merged, op, LedgerOp::Release)
    }

    fn apply_group(
        &self,
        store: &StoreId,
        items: &BTreeMap<ProductId, u32>,
        op: &OperationId,
        kind: LedgerOp,
    ) -> DispatchResult<Vec<ReservedLine>> {
        // BTreeMap iteration gives a global lock order
        let handles = items
            .keys()
            .map(|product| self.handle(store, product))
            .collect::<DispatchResult<Vec<_>>>()?;

        let mut guards = Vec::with_capacity(handles.len());
        for (handle, product) in handles.iter().zip(items.keys()) {
            let guard = match kind {
                LedgerOp::Reserve => self.try_lock(handle, product)?,
                _ => handle.lock().map_err(lock_err("inventory record"))?,
            };
            guards.push(guard);
        }

        for (record, quantity) in guards.iter().zip(items.values()) {
            let op_id = Self::op_id(op, kind, &record.product_id);
            if record.applied_ops.contains(&op_id) {
                continue;
            }
            match kind {
                LedgerOp::Reserve => record.check_reserve(*quantity)?,
                LedgerOp::Commit | LedgerOp::Release => record.check_reserved(*quantity)?,
                LedgerOp::Restock => record.check_restock(*quantity)?,
            }
        }

        let mut lines = Vec::with_capacity(guards.len());
        for (record, quantity) in guards.iter_mut().zip(items.values()) {
            let op_id = Self::op_id(op, kind, &record.product_id);
            if !record.applied_ops.contains(&op_id) {
                record.apply(kind, *quantity, op_id);
            }
            lines.push(ReservedLine {
                product_id: record.product_id.clone(),
                category: record.category.clone(),
                quantity: *quantity,
                unit_price: record.unit_price,
            });
        }
        debug!("{} {} lines at {} ({})", kind.tag(), lines.len(), store, op);
        Ok(lines)
    }

    /// Undoes a previously applied group operation and forgets its operation
    /// id, so a retry applies it again. Lines that were never applied are left
    /// alone.
    pub fn revert_group(
        &self,
        store: &StoreId,
        items: &[ReservationRequest],
        op: &OperationId,
        kind: LedgerOp,
    ) -> DispatchResult<()> {
        let merged = merge_requests(items)?;
        let handles = merged
            .keys()
            .map(|product| self.handle(store, product))
            .collect::<DispatchResult<Vec<_>>>()?;
        let mut guards = handles
            .iter()
            .map(|h| h.lock().map_err(lock_err("inventory record")))
            .collect::<DispatchResult<Vec<_>>>()?;

        for (record, quantity) in guards.iter_mut().zip(merged.values()) {
            let op_id = Self::op_id(op, kind, &record.product_id);
            if !record.applied_ops.remove(&op_id) {
                continue;
            }
            match kind {
                LedgerOp::Reserve => record.reserved = record.reserved.saturating_sub(*quantity),
                LedgerOp::Commit => {
                    record.reserved += quantity;
                    record.available += quantity;
                }
                LedgerOp::Release => record.reserved += quantity,
                LedgerOp::Restock => record.available = record.available.saturating_sub(*quantity),
            }
        }
        info!("Reverted {} {} at {}", kind.tag(), op, store);
        Ok(())
    }

    /// Drops the reserve, commit and release ids a finished sub-order left on
    /// its records. Call only once the sub-order can no longer transition.
    pub fn forget_group(
        &self,
        store: &StoreId,
        items: &[ReservationRequest],
        op: &OperationId,
    ) -> DispatchResult<()> {
        for product in merge_requests(items)?.keys() {
            let handle = self.handle(store, product)?;
            let mut record = handle.lock().map_err(lock_err("inventory record"))?;
            for kind in [LedgerOp::Reserve, LedgerOp::Commit, LedgerOp::Release] {
                record.applied_ops.remove(&Self::op_id(op, kind, product));
            }
        }
        debug!("Forgot operation {} at {}", op, store);
        Ok(())
    }

    /// Copy of one record
    pub fn record(&self, store: &StoreId, product: &ProductId) -> DispatchResult<InventoryRecord> {
        let handle = self.handle(store, product)?;
        let record = handle.lock().map_err(lock_err("inventory record"))?;
        Ok(record.clone())
    }

    /// Sellable units, or `None` if the store does not list the product
    pub fn sellable(&self, store: &StoreId, product: &ProductId) -> DispatchResult<Option<u32>> {
        match self.handle(store, product) {
            Ok(handle) => {
                let record = handle.lock().map_err(lock_err("inventory record"))?;
                Ok(Some(record.sellable()))
            }
            Err(DispatchError::UnknownInventory { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Copies of all records, sorted by key
    pub fn records(&self) -> DispatchResult<Vec<InventoryRecord>> {
        let handles: Vec<RecordHandle> = {
            let records = self.records.read().map_err(lock_err("inventory read"))?;
            records.values().cloned().collect()
        };
        let mut out = handles
            .iter()
            .map(|h| {
                h.lock()
                    .map(|r| r.clone())
                    .map_err(lock_err("inventory record"))
            })
            .collect::<DispatchResult<Vec<_>>>()?;
        out.sort_by_key(|r| r.key());
        Ok(out)
    }

    /// Items at a store below their minimum threshold, worst first
    pub fn low_stock(&self, store: &StoreId) -> DispatchResult<Vec<LowStockItem>> {
        let mut items: Vec<LowStockItem> = self
            .records()?
            .into_iter()
            .filter(|r| &r.store_id == store && r.status() != StockStatus::Healthy)
            .map(|r| LowStockItem {
                product_id: r.product_id.clone(),
                available: r.available,
                min_threshold: r.min_threshold,
                status: r.status(),
                suggested_restock: r.restock_suggestion(),
            })
            .collect();
        items.sort_by(|a, b| {
            b.suggested_restock
                .cmp(&a.suggested_restock)
                .then_with(|| a.product_id.cmp(&b.product_id))
        });
        Ok(items)
    }
}

fn merge_requests(items: &[ReservationRequest]) -> DispatchResult<BTreeMap<ProductId, u32>> {
    let mut merged: BTreeMap<ProductId, u32> = BTreeMap::new();
    for item in items {
        let total = merged.entry(item.product_id.clone()).or_insert(0);
        *total = total.checked_add(item.quantity).ok_or_else(|| {
            DispatchError::InvalidCart(format!("quantity of {} overflows", item.product_id))
        })?;
    }
    Ok(merged)
}
