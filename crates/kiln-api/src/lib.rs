//! API server for Kiln.
//!
//! Exposes scheduling, lookup, cancellation and status callbacks over HTTP.

pub mod error;
pub mod routes;
pub mod state;

pub use state::AppState;
