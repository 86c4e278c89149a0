//! Application state for dependency injection.
//!
//! One instance of each control-plane component is built at the composition
//! root and shared with the handlers through this state.

use std::sync::Arc;
use std::time::Instant;

use crate::cluster::MembershipTracker;
use crate::credentials::CredentialRotationManager;
use crate::reliability::{BreakerRegistry, FleetMetrics};
use crate::upstream::{ConnectionPool, HttpConnector};

/// Shared application state containing dependencies.
#[derive(Clone)]
pub struct AppState {
    /// Fleet membership
    pub membership: Arc<MembershipTracker>,

    /// Per-node circuit breakers
    pub breakers: Arc<BreakerRegistry>,

    /// Upstream connection pool
    pub pool: ConnectionPool<HttpConnector>,

    /// Credential rotation
    pub credentials: Arc<CredentialRotationManager>,

    /// Prometheus recorder
    pub metrics: FleetMetrics,

    /// Process start time
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        membership: Arc<MembershipTracker>,
        breakers: Arc<BreakerRegistry>,
        pool: ConnectionPool<HttpConnector>,
        credentials: Arc<CredentialRotationManager>,
        metrics: FleetMetrics,
    ) -> Self {
        Self {
            membership,
            breakers,
            pool,
            credentials,
            metrics,
            started_at: Instant::now(),
        }
    }
}
