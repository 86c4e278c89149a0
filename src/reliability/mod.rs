//! Reliability and observability building blocks.
//!
//! - Circuit breakers and the keyed breaker registry
//! - Lifecycle-managed scheduling of background timers
//! - Graceful shutdown handling
//! - Metrics collection and log setup

pub mod circuit_breaker;
pub mod graceful_shutdown;
pub mod metrics;
pub mod registry;
pub mod scheduler;
pub mod tracing;

pub use circuit_breaker::{BreakerMetrics, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use graceful_shutdown::{GracefulShutdown, ShutdownGuard};
pub use self::metrics::FleetMetrics;
pub use registry::{model_key, node_key, BreakerRegistry};
pub use scheduler::{ScheduledTask, Scheduler};
