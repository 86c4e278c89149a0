//! Inference fleet router.
//!
//! This is the entry point for the router. It loads the configuration, builds
//! one instance of each control-plane component, starts their background
//! tasks and serves the observability endpoints until shutdown.

use std::sync::Arc;
use tracing::{error, info, warn};

use fleet_router::{
    cluster::{start_discovery, start_static_prober, MembershipTracker},
    config::Config,
    credentials::{load_slots, CredentialRotationManager},
    error::{AppError, Result},
    reliability::{
        tracing::{init_tracing, TracingConfig},
        BreakerRegistry, FleetMetrics, GracefulShutdown, Scheduler,
    },
    server::{create_router, AppState},
    upstream::{ConnectionPool, HttpConnector},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize tracing
    init_tracing(TracingConfig::from(&config.logging))
        .map_err(|e| AppError::Internal(format!("failed to initialize tracing: {e}")))?;

    let metrics = match FleetMetrics::new() {
        Ok(metrics) => metrics,
        Err(e) => {
            warn!(error = %e, "Prometheus recorder unavailable, metrics will not be exported");
            FleetMetrics::detached()
        }
    };

    let scheduler = Scheduler::new();
    let shutdown = GracefulShutdown::new();
    shutdown.listen_for_signals();
    shutdown.cancel_on_shutdown(scheduler.clone());

    // Circuit breakers
    let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone(), scheduler.child()));

    // Connection pool
    let connector = HttpConnector::new(config.upstream.clone());
    let pool = ConnectionPool::new(connector.clone(), config.pool.clone(), scheduler.child()).await?;
    info!(stats = %pool.stats(), "Connection pool ready");

    // Credentials
    let slots = load_slots(&config.credentials.entries, std::env::vars())?;
    let credentials = Arc::new(CredentialRotationManager::new(
        slots,
        config.credentials.rotation.clone(),
    ));

    // Cluster membership
    let membership = MembershipTracker::new(config.cluster.membership.clone());
    for node in &config.cluster.nodes {
        membership.add_static(node);
    }
    membership.start(&scheduler);

    if !config.cluster.nodes.is_empty() {
        start_static_prober(
            Arc::clone(&membership),
            config.cluster.nodes.clone(),
            Arc::new(connector),
            config.cluster.membership.heartbeat_interval,
            &scheduler,
        );
    }

    if config.cluster.discovery.enabled {
        let (_, addr) = start_discovery(
            Arc::clone(&membership),
            &config.cluster.discovery.bind_addr,
            &scheduler,
        )
        .await?;
        info!(%addr, "Discovery enabled");
    }

    // Create application state
    let state = Arc::new(AppState::new(
        membership,
        breakers,
        pool.clone(),
        credentials,
        metrics,
    ));

    // Create router
    let app = create_router(state);

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Observability server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.guard("http-server").wait())
        .await
    {
        error!(error = %e, "Observability server failed");
    }

    pool.shutdown();
    scheduler.shutdown();
    info!("Shutdown complete");

    Ok(())
}
