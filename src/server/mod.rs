//! Observability HTTP server.
//!
//! Exposes health, aggregated component snapshots and Prometheus metrics.

mod handlers;
mod state;

pub use handlers::{create_router, health_check, metrics_handler, reset_breakers, stats_handler, FleetSnapshot};
pub use state::AppState;
