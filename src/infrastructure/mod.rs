//! Infrastructure layer around the dispatch engine
//!
//! HTTP surface, lifecycle event ingestion, metrics, seed parsing, snapshot
//! persistence and the background workers that drive batching and forecasts.

/// Warp HTTP routes
pub mod api;
/// Lifecycle event ingestion from store and rider clients
pub mod ingestion;
/// Metrics collection and export functionality
pub mod metrics;
/// Seed-file parsing
pub mod parsers;
/// JSON state snapshots
pub mod persistence;
/// Batching worker and forecast refresher
pub mod scheduling;

pub use ingestion::*;
pub use parsers::*;
pub use persistence::*;
pub use scheduling::*;
