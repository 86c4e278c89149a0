//! Circuit breaker for upstream inference endpoints.
//!
//! Provides fault tolerance by failing fast once an endpoint has produced a
//! burst of failures inside a sliding window, preventing one sick node from
//! dragging every request down with it. After a cool-down the breaker lets a
//! bounded number of probe calls through and closes again once enough of them
//! succeed.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::circuit_breaker::{
    DEFAULT_FAILURE_THRESHOLD, DEFAULT_HALF_OPEN_MAX_ATTEMPTS, DEFAULT_MONITOR_WINDOW,
    DEFAULT_RESET_TIMEOUT,
};
use crate::error::{AppError, Result};
use crate::reliability::scheduler::{ScheduledTask, Scheduler};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed - requests are allowed through.
    Closed,
    /// Circuit is open - requests fail fast.
    Open,
    /// Circuit is half-open - limited requests are allowed to test recovery.
    HalfOpen,
}

impl CircuitState {
    fn as_gauge(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of in-window failures that open the circuit.
    pub failure_threshold: u32,
    /// Time to wait before transitioning from open to half-open.
    #[serde(with = "crate::config::duration_secs")]
    pub reset_timeout: Duration,
    /// Consecutive half-open successes needed to close the circuit.
    pub half_open_max_attempts: u32,
    /// Sliding window over which failures are counted.
    #[serde(with = "crate::config::duration_secs")]
    pub monitor_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout: DEFAULT_RESET_TIMEOUT,
            half_open_max_attempts: DEFAULT_HALF_OPEN_MAX_ATTEMPTS,
            monitor_window: DEFAULT_MONITOR_WINDOW,
        }
    }
}

/// Point-in-time view of a breaker, for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    /// Failures currently inside the monitor window.
    pub failure_count: usize,
    pub half_open_successes: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub total_requests: u64,
    pub total_failures: u64,
    pub rejected_requests: u64,
    /// Milliseconds until an open breaker admits probes again.
    pub retry_after_ms: Option<u64>,
}

impl BreakerMetrics {
    /// Lifetime failure rate as a percentage.
    pub fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        (self.total_failures as f64 / self.total_requests as f64) * 100.0
    }
}

/// Mutable breaker state; every field changes under one lock so no caller
/// observes a half-applied transition.
#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// Failure instants inside the monitor window, oldest first.
    failures: VecDeque<Instant>,
    half_open_successes: u32,
    half_open_in_flight: u32,
    opened_at: Option<Instant>,
    /// Bumped on every transition into OPEN or HALF_OPEN.
    generation: u64,
    total_requests: u64,
    total_failures: u64,
    rejected_requests: u64,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    half_open_timer: Option<ScheduledTask>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            half_open_successes: 0,
            half_open_in_flight: 0,
            opened_at: None,
            generation: 0,
            total_requests: 0,
            total_failures: 0,
            rejected_requests: 0,
            last_success: None,
            last_failure: None,
            half_open_timer: None,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.failures.front() {
            if now.duration_since(oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.half_open_timer.take() {
            timer.cancel();
        }
    }
}

/// Admission ticket for one call. Releases its half-open probe slot on drop,
/// so a caller that abandons the call mid-flight does not leak the slot.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    probe_generation: Option<u64>,
}

impl Admission<'_> {
    fn take_probe(&mut self) -> Option<u64> {
        self.probe_generation.take()
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if let Some(generation) = self.probe_generation.take() {
            let mut inner = self.breaker.inner.lock();
            release_probe(&mut inner, generation);
        }
    }
}

fn release_probe(inner: &mut BreakerInner, generation: u64) {
    if inner.state == CircuitState::HalfOpen && inner.generation == generation {
        inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
    }
}

/// Circuit breaker guarding one endpoint.
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Name reported in `CircuitOpen` errors (usually the node name).
    name: String,
    /// Configuration settings.
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    /// Owns the deferred OPEN -> HALF_OPEN transition.
    scheduler: Scheduler,
    self_ref: Weak<Self>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, scheduler: Scheduler) -> Arc<Self> {
        let name = name.into();
        debug!(breaker = %name, ?config, "Creating circuit breaker");
        Arc::new_cyclic(|weak| Self {
            name,
            config,
            inner: Mutex::new(BreakerInner::new()),
            scheduler,
            self_ref: weak.clone(),
        })
    }

    /// Create a circuit breaker with default configuration.
    pub fn with_defaults(name: impl Into<String>) -> Arc<Self> {
        Self::new(name, CircuitBreakerConfig::default(), Scheduler::new())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current state, applying any cool-down that has already elapsed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    /// Number of failures inside the monitor window.
    pub fn failure_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.prune(Instant::now(), self.config.monitor_window);
        inner.failures.len()
    }

    /// True unless the circuit is open.
    pub fn is_available(&self) -> bool {
        self.state() != CircuitState::Open
    }

    /// Execute an operation with circuit breaker protection.
    ///
    /// The operation is not polled at all when the circuit rejects the call.
    /// Errors that say nothing about endpoint health (a nested `CircuitOpen`,
    /// pool backpressure) are passed through without being counted.
    pub async fn execute<F, T, E>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: Into<AppError>,
    {
        let mut admission = self.admit()?;

        let result = operation.await.map_err(Into::into);

        let probe = admission.take_probe();
        let mut inner = self.inner.lock();
        if let Some(generation) = probe {
            release_probe(&mut inner, generation);
        }
        match &result {
            Ok(_) => self.record_success(&mut inner, probe),
            Err(err) if !err.counts_as_endpoint_failure() => {
                debug!(breaker = %self.name, error = %err, "Ignoring non-endpoint failure");
            }
            Err(err) => {
                debug!(breaker = %self.name, error = %err, "Recording endpoint failure");
                self.record_failure(&mut inner);
            }
        }
        drop(inner);

        result
    }

    /// Force the circuit closed and clear every counter.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.cancel_timer();
        let generation = inner.generation + 1;
        *inner = BreakerInner::new();
        inner.generation = generation;
        gauge!("circuit_breaker_state", "breaker" => self.name.clone()).set(CircuitState::Closed.as_gauge());
        info!(breaker = %self.name, "Circuit breaker reset");
    }

    /// Force the circuit open, restarting the cool-down.
    pub fn trip(&self) {
        let mut inner = self.inner.lock();
        warn!(breaker = %self.name, "Circuit breaker tripped manually");
        self.transition_to_open(&mut inner, Instant::now());
    }

    /// Snapshot of the breaker for observability.
    pub fn metrics(&self) -> BreakerMetrics {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);
        inner.prune(now, self.config.monitor_window);

        let retry_after_ms = match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened_at)) => Some(
                (opened_at + self.config.reset_timeout)
                    .saturating_duration_since(now)
                    .as_millis() as u64,
            ),
            _ => None,
        };

        BreakerMetrics {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failures.len(),
            half_open_successes: inner.half_open_successes,
            last_success: inner.last_success,
            last_failure: inner.last_failure,
            total_requests: inner.total_requests,
            total_failures: inner.total_failures,
            rejected_requests: inner.rejected_requests,
            retry_after_ms,
        }
    }

    fn admit(&self) -> Result<Admission<'_>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.total_requests += 1;
        self.refresh(&mut inner, now);

        match inner.state {
            CircuitState::Closed => Ok(Admission {
                breaker: self,
                probe_generation: None,
            }),
            CircuitState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                Err(self.reject(&mut inner, opened_at + self.config.reset_timeout))
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight >= self.config.half_open_max_attempts {
                    return Err(self.reject(&mut inner, now));
                }
                inner.half_open_in_flight += 1;
                Ok(Admission {
                    breaker: self,
                    probe_generation: Some(inner.generation),
                })
            }
        }
    }

    fn reject(&self, inner: &mut BreakerInner, retry_after: Instant) -> AppError {
        inner.rejected_requests += 1;
        counter!("circuit_breaker_rejected_requests_total", "breaker" => self.name.clone()).increment(1);
        debug!(breaker = %self.name, state = ?inner.state, "Rejecting call");
        AppError::CircuitOpen {
            name: self.name.clone(),
            retry_after,
        }
    }

    /// Lazily apply an OPEN -> HALF_OPEN transition whose timer may not have run yet.
    fn refresh(&self, inner: &mut BreakerInner, now: Instant) {
        if inner.state != CircuitState::Open {
            return;
        }
        if let Some(opened_at) = inner.opened_at {
            if now >= opened_at + self.config.reset_timeout {
                self.transition_to_half_open(inner);
            }
        }
    }

    /// `probe` is the generation the call was admitted under as a half-open
    /// probe; calls admitted before the circuit opened never count toward closing it.
    fn record_success(&self, inner: &mut BreakerInner, probe: Option<u64>) {
        inner.last_success = Some(Utc::now());
        match inner.state {
            CircuitState::Closed => inner.failures.clear(),
            CircuitState::HalfOpen if probe == Some(inner.generation) => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_max_attempts {
                    self.transition_to_closed(inner);
                }
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn record_failure(&self, inner: &mut BreakerInner) {
        let now = Instant::now();
        inner.total_failures += 1;
        inner.last_failure = Some(Utc::now());
        inner.failures.push_back(now);
        inner.prune(now, self.config.monitor_window);

        match inner.state {
            CircuitState::Closed => {
                if inner.failures.len() >= self.config.failure_threshold as usize {
                    self.transition_to_open(inner, now);
                }
            }
            CircuitState::HalfOpen => {
                // Any failure in half-open state reopens the circuit
                self.transition_to_open(inner, now);
            }
            CircuitState::Open => {}
        }
    }

    fn transition_to_open(&self, inner: &mut BreakerInner, now: Instant) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.half_open_successes = 0;
        inner.half_open_in_flight = 0;
        inner.generation += 1;
        inner.cancel_timer();

        let generation = inner.generation;
        let weak = self.self_ref.clone();
        inner.half_open_timer = Some(self.scheduler.schedule_once(
            "breaker-half-open",
            self.config.reset_timeout,
            async move {
                if let Some(breaker) = weak.upgrade() {
                    breaker.on_reset_timer(generation);
                }
            },
        ));

        counter!("circuit_breaker_opens_total", "breaker" => self.name.clone()).increment(1);
        gauge!("circuit_breaker_state", "breaker" => self.name.clone()).set(CircuitState::Open.as_gauge());
        error!(
            breaker = %self.name,
            failures = inner.failures.len(),
            reset_timeout = ?self.config.reset_timeout,
            "Circuit breaker opened"
        );
    }

    fn on_reset_timer(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Open && inner.generation == generation {
            inner.half_open_timer = None;
            self.transition_to_half_open(&mut inner);
        }
    }

    fn transition_to_half_open(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::HalfOpen;
        inner.half_open_successes = 0;
        inner.half_open_in_flight = 0;
        inner.generation += 1;
        inner.cancel_timer();
        gauge!("circuit_breaker_state", "breaker" => self.name.clone()).set(CircuitState::HalfOpen.as_gauge());
        warn!(breaker = %self.name, "Circuit breaker half-open, probing recovery");
    }

    fn transition_to_closed(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Closed;
        inner.failures.clear();
        inner.half_open_successes = 0;
        inner.half_open_in_flight = 0;
        inner.opened_at = None;
        inner.cancel_timer();
        counter!("circuit_breaker_closes_total", "breaker" => self.name.clone()).increment(1);
        gauge!("circuit_breaker_state", "breaker" => self.name.clone()).set(CircuitState::Closed.as_gauge());
        info!(breaker = %self.name, "Circuit breaker closed after successful recovery");
    }
}
