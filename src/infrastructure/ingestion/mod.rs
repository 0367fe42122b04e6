//! Lifecycle event ingestion
//!
//! Store and rider clients push status updates over tokio channels; each
//! stream is drained by its own task and applied to the dispatch engine.

/// Channel-driven event ingestion with statistics
pub mod event_ingester;

pub use event_ingester::*;
