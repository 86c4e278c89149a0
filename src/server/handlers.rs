//! Read-only observability endpoints.
//!
//! The routing layer never pushes its state anywhere; these handlers expose
//! snapshots of each component for dashboards and scrapers.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;

use crate::cluster::{ClusterStats, Node};
use crate::credentials::RotationStatus;
use crate::reliability::BreakerMetrics;
use crate::server::AppState;
use crate::upstream::PoolStats;

/// Aggregated dashboard payload.
#[derive(Debug, Serialize)]
pub struct FleetSnapshot {
    pub uptime_seconds: u64,
    pub pool: PoolStats,
    pub breakers: BTreeMap<String, BreakerMetrics>,
    pub credentials: RotationStatus,
    pub cluster: ClusterStats,
    pub nodes: Vec<Node>,
}

impl FleetSnapshot {
    pub fn collect(state: &AppState) -> Self {
        Self {
            uptime_seconds: state.started_at.elapsed().as_secs(),
            pool: state.pool.stats(),
            breakers: state.breakers.metrics(),
            credentials: state.credentials.get_status(),
            cluster: state.membership.get_stats(),
            nodes: state.membership.get_nodes(),
        }
    }
}

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cluster = state.membership.get_stats();
    let exhausted = state.credentials.is_all_keys_exhausted();
    let status = if cluster.online_nodes == 0 || exhausted || state.pool.is_closed() {
        "degraded"
    } else {
        "healthy"
    };

    Json(serde_json::json!({
        "status": status,
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "online_nodes": cluster.online_nodes,
        "credentials_exhausted": exhausted,
    }))
}

/// Aggregated component snapshots.
pub async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(FleetSnapshot::collect(&state))
}

/// Prometheus exposition.
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

/// Force every circuit breaker closed.
/// Emergency recovery after an upstream incident has been fixed.
pub async fn reset_breakers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    warn!(breakers = state.breakers.len(), "Resetting all circuit breakers on request");
    state.breakers.reset_all();
    Json(serde_json::json!({
        "status": "success",
        "reset": state.breakers.len(),
    }))
}

/// Create the observability router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/admin/breakers/reset", post(reset_breakers))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterMessage, MembershipConfig, MembershipTracker, MessageKind};
    use crate::credentials::{CredentialRotationManager, RotationConfig};
    use crate::reliability::{BreakerRegistry, CircuitBreakerConfig, CircuitState, FleetMetrics, Scheduler};
    use crate::upstream::{ConnectionPool, HttpConnector, PoolConfig};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn state() -> Arc<AppState> {
        let pool = ConnectionPool::new(
            HttpConnector::default(),
            PoolConfig {
                min_size: 0,
                ..Default::default()
            },
            Scheduler::new(),
        )
        .await
        .unwrap();
        Arc::new(AppState::new(
            MembershipTracker::new(MembershipConfig::default()),
            Arc::new(BreakerRegistry::new(CircuitBreakerConfig::default(), Scheduler::new())),
            pool,
            Arc::new(CredentialRotationManager::new(Vec::new(), RotationConfig::default())),
            FleetMetrics::detached(),
        ))
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health_is_degraded_without_nodes() {
        let state = state().await;
        let (status, body) = get_json(create_router(Arc::clone(&state)), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");

        state.membership.handle_message(&ClusterMessage::new(
            MessageKind::Heartbeat,
            "gpu-a",
            json!({"models": ["llama3"]}),
        ));
        let (_, body) = get_json(create_router(state), "/health").await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["online_nodes"], 1);
    }

    #[tokio::test]
    async fn test_stats_aggregates_components() {
        let state = state().await;
        state.breakers.get_or_create("node:gpu-a", None);
        state.membership.handle_message(&ClusterMessage::new(
            MessageKind::Announce,
            "gpu-a",
            json!({"models": ["llama3"]}),
        ));

        let (status, body) = get_json(create_router(state), "/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pool"]["max_connections"], 10);
        assert!(body["breakers"]["node:gpu-a"].is_object());
        assert_eq!(body["credentials"]["total_slots"], 0);
        assert_eq!(body["cluster"]["onlineNodes"], 1);
        assert_eq!(body["nodes"][0]["id"], "gpu-a");
    }

    #[tokio::test]
    async fn test_metrics_is_prometheus_text() {
        let state = state().await;
        let response = create_router(state)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; version=0.0.4"
        );
    }

    #[tokio::test]
    async fn test_reset_breakers_closes_open_circuits() {
        let state = state().await;
        let breaker = state.breakers.get_or_create("node:gpu-a", None);
        breaker.trip();

        let response = create_router(Arc::clone(&state))
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/breakers/reset")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
