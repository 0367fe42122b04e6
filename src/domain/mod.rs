//! Domain layer containing the dispatch engines and their entities
//!
//! Store lookup, inventory reservation, store load, order assignment, delivery
//! batching and demand forecasting. Everything here is synchronous and
//! thread-safe; async plumbing lives in the infrastructure layer.

/// Store-aware order assignment and the sub-order state machine
pub mod assignment;
/// Delivery batching, routing and rider matching
pub mod batching;
/// Per-customer carts
pub mod cart;
/// Engine wiring and cross-component flows
pub mod dispatch;
/// Lifecycle events from store and rider clients
pub mod events;
/// Demand forecasting
pub mod forecast;
/// Spatial store index
pub mod geo_index;
/// Inventory ledger
pub mod inventory;
/// Orders and sub-orders
pub mod order;
/// Store registry
pub mod store;
/// Store load tracking
pub mod store_load;
/// Core types and primitives
pub mod types;

pub use assignment::{delivery_fee, OrderAssignmentEngine, StoreScore, TransitionOutcome};
pub use batching::{
    BatchGroup, BatchingScheduler, BonusOutcome, CycleReport, Delivery, DeliveryStatus, Rider,
};
pub use cart::{Cart, CartItem, CartService};
pub use dispatch::{DispatchEngine, EngineState, LoadOverview, SubOrderUpdate};
pub use events::*;
pub use forecast::{DemandForecaster, DemandSample, Forecast};
pub use geo_index::{haversine_km, within, GeoIndex};
pub use inventory::{InventoryLedger, InventoryRecord, ReservationRequest, StockStatus};
pub use order::*;
pub use store::{Store, StoreRegistry};
pub use store_load::{LoadTier, StoreLoad, StoreLoadTracker};
pub use types::*;
