//! Background workers
//!
//! The batching worker runs cycles on a fixed tick or when nudged after an
//! assignment; the forecast refresher pushes demand forecasts into store load
//! projections.

/// Periodic batching and forecast tasks
pub mod workers;

pub use workers::*;
