//! Prometheus metrics collection and export.
//!
//! Components record through the `metrics` facade; when no recorder is
//! installed (unit tests, embedding without the observability server) the
//! calls are no-ops.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use tracing::info;

/// Metrics recorder for the fleet router.
#[derive(Clone)]
pub struct FleetMetrics {
    /// Prometheus handle for exporting metrics.
    prometheus_handle: PrometheusHandle,
}

impl FleetMetrics {
    /// Install the process-wide Prometheus recorder.
    pub fn new() -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let builder = PrometheusBuilder::new();
        let prometheus_handle = builder.install_recorder()?;

        Self::register_metrics();

        info!("Metrics collection initialized");

        Ok(Self { prometheus_handle })
    }

    /// A recorder that is not installed globally; renders an empty exposition.
    pub fn detached() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        Self {
            prometheus_handle: recorder.handle(),
        }
    }

    /// Register all metrics with their descriptions.
    fn register_metrics() {
        // Circuit breaker metrics
        describe_counter!(
            "circuit_breaker_opens_total",
            "Total number of times a circuit breaker has opened"
        );
        describe_counter!(
            "circuit_breaker_closes_total",
            "Total number of times a circuit breaker has closed"
        );
        describe_gauge!(
            "circuit_breaker_state",
            "Current state of a circuit breaker (0=closed, 1=half-open, 2=open)"
        );
        describe_counter!(
            "circuit_breaker_rejected_requests_total",
            "Total number of calls rejected by a circuit breaker"
        );

        // Connection pool metrics
        describe_gauge!(
            "connection_pool_active_connections",
            "Number of pooled connections currently in use"
        );
        describe_gauge!(
            "connection_pool_idle_connections",
            "Number of idle pooled connections"
        );
        describe_counter!(
            "connection_pool_created_connections_total",
            "Total number of connections created"
        );
        describe_counter!(
            "connection_pool_evicted_connections_total",
            "Total number of connections destroyed by the pool"
        );
        describe_counter!(
            "connection_pool_acquire_timeouts_total",
            "Total number of acquisitions that timed out"
        );
        describe_histogram!(
            "connection_pool_acquire_wait_seconds",
            "Time spent waiting for a pooled connection"
        );

        // Credential rotation metrics
        describe_counter!(
            "credential_rotations_total",
            "Total number of credential rotations"
        );

        // Cluster membership metrics
        describe_gauge!("cluster_nodes_online", "Number of nodes currently online");
        describe_counter!(
            "cluster_node_online_total",
            "Total number of node online transitions"
        );
        describe_counter!(
            "cluster_node_offline_total",
            "Total number of node offline transitions"
        );
    }

    /// Get the Prometheus metrics as a string.
    pub fn render(&self) -> String {
        self.prometheus_handle.render()
    }
}

/// Record connection pool statistics.
pub fn record_connection_pool_stats(active: usize, idle: usize) {
    gauge!("connection_pool_active_connections").set(active as f64);
    gauge!("connection_pool_idle_connections").set(idle as f64);
}

pub fn record_connection_created() {
    counter!("connection_pool_created_connections_total").increment(1);
}

pub fn record_connection_evicted(reason: &'static str) {
    counter!("connection_pool_evicted_connections_total", "reason" => reason).increment(1);
}

pub fn record_acquire_wait(waited: Duration) {
    histogram!("connection_pool_acquire_wait_seconds").record(waited.as_secs_f64());
}

pub fn record_acquire_timeout() {
    counter!("connection_pool_acquire_timeouts_total").increment(1);
}

/// Record a credential rotation.
pub fn record_credential_rotation(reason: &'static str) {
    counter!("credential_rotations_total", "reason" => reason).increment(1);
}

/// Record cluster membership transitions.
pub fn record_node_online(online_nodes: usize) {
    counter!("cluster_node_online_total").increment(1);
    gauge!("cluster_nodes_online").set(online_nodes as f64);
}

pub fn record_node_offline(online_nodes: usize) {
    counter!("cluster_node_offline_total").increment(1);
    gauge!("cluster_nodes_online").set(online_nodes as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_recorder_renders() {
        let metrics = FleetMetrics::detached();
        // Nothing has been recorded against a detached recorder.
        assert!(!metrics.render().contains("circuit_breaker_opens_total"));
    }

    #[test]
    fn test_metrics_recording() {
        // Recording without an installed recorder must not panic
        record_connection_pool_stats(3, 2);
        record_connection_created();
        record_connection_evicted("idle");
        record_acquire_wait(Duration::from_millis(3));
        record_acquire_timeout();
        record_credential_rotation("rate_limited");
        record_node_online(1);
        record_node_offline(0);
    }
}
