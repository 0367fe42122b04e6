//! Seed-file parsing
//!
//! Converts the JSON seed (stores, listings, riders) into domain types.

/// JSON seed parser
pub mod seed_parser;

pub use seed_parser::*;
