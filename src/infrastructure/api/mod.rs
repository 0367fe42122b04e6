//! HTTP surface for customer, store, rider and admin clients
//!
//! Routes are plain warp filters over a shared [`ApiContext`]; engine errors
//! become JSON bodies of the form `{ "error": <kind>, "message": <text> }`.

/// Request handlers and error mapping
pub mod handlers;
/// Route table
pub mod routes;

pub use handlers::{status_for, ApiContext, ErrorBody};
pub use routes::routes;
