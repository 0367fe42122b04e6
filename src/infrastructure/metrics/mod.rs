//! Metrics collection and export
//!
//! Counters and gauges recorded by the dispatch engine, rendered as Prometheus
//! text or JSON, plus a health summary for liveness checks.

/// Metrics collection utilities
pub mod collector;
/// Metrics export and health monitoring
pub mod exporter;

pub use collector::*;
pub use exporter::*;
