//! # Grocery Dispatch
//!
//! Dispatch core for a multi-store grocery delivery service:
//! - Store-aware order assignment with split-cart pricing and per-store
//!   atomic inventory reservation
//! - Proximity batching of deliveries with route sequencing and rider matching
//! - Store load tracking with forecast-fed projections and rebalance advice
//! - Demand forecasting by exponential smoothing over time buckets
//! - Lifecycle event ingestion from store and rider clients
//!
//! ## Architecture
//!
//! - **Domain**: the engines ([`OrderAssignmentEngine`], [`BatchingScheduler`],
//!   [`StoreLoadTracker`], [`InventoryLedger`], [`GeoIndex`],
//!   [`DemandForecaster`]) wired together by [`DispatchEngine`]
//! - **Infrastructure**: warp HTTP routes, event ingestion, metrics, seed
//!   parsing, snapshot persistence and background workers
//! - **Utils**: logging and configuration
//!
//! ## Thread Safety
//!
//! Engines are shared behind `Arc` and guard their state with `std::sync`
//! locks. Inventory is locked per (store, product) key; a group reservation
//! locks its keys in sorted order and applies all lines or none. Store load
//! counters are atomics.

pub mod domain;
pub mod infrastructure;

/// Logging and configuration
pub mod utils;

pub use domain::{
    assignment::{delivery_fee, OrderAssignmentEngine, StoreScore},
    batching::{
        BatchGroup, BatchingScheduler, BonusOutcome, CycleReport, Delivery, DeliveryStatus, Rider,
    },
    cart::{Cart, CartItem, CartService},
    dispatch::{DispatchEngine, EngineState, LoadOverview, SubOrderUpdate},
    events::*,
    forecast::{DemandForecaster, Forecast},
    geo_index::{haversine_km, GeoIndex},
    inventory::{InventoryLedger, InventoryRecord, ReservationRequest, StockStatus},
    order::*,
    store::{Store, StoreRegistry},
    store_load::{LoadTier, StoreLoad, StoreLoadTracker},
    types::*,
};

pub use infrastructure::{
    api::{routes, ApiContext},
    ingestion::{EventIngester, IngestionStats, MultiStreamIngester},
    metrics::{HealthStatus, MetricsCollector, MetricsExporter},
    parsers::{apply_seed, load_seed, parse_seed, SeedData},
    persistence::StateSnapshot,
    scheduling::BackgroundWorkers,
};
pub use utils::config::EngineConfig;

/// Main result type for the dispatch engine
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
