//! State persistence
//!
//! The engine tables are written to a single JSON snapshot at shutdown and
//! restored at start.

/// JSON snapshot of the engine tables
pub mod snapshot;

pub use snapshot::*;
