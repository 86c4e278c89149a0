//! Bounded keep-alive connection pool keyed by base URL.
//!
//! The pool reuses upstream connections across requests, caps the number of
//! outstanding connections at `max_size` and parks callers in a FIFO wait
//! queue when it is exhausted. A released connection is handed straight to
//! the longest-waiting caller and is never observed idle in between.
//!
//! All bookkeeping lives behind one mutex that is never held across an
//! `.await`; connection setup and liveness probes run outside the lock and
//! re-validate the state they observed once they resume.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::connection_pool::{
    DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_BASE_URL, DEFAULT_HEALTH_CHECK_INTERVAL,
    DEFAULT_MAX_IDLE_TIME, DEFAULT_MAX_SIZE, DEFAULT_MIN_SIZE,
};
use crate::error::{AppError, Result};
use crate::reliability::metrics::{
    record_acquire_timeout, record_acquire_wait, record_connection_created,
    record_connection_evicted, record_connection_pool_stats,
};
use crate::reliability::{ScheduledTask, Scheduler};
use crate::upstream::client::Connector;

/// Configuration for the connection pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of connections in the pool.
    pub max_size: usize,
    /// Connections kept warm against `default_base_url`.
    pub min_size: usize,
    /// Idle time after which a connection above `min_size` is destroyed.
    #[serde(with = "crate::config::duration_secs")]
    pub max_idle_time: Duration,
    /// Timeout for acquiring a connection from the pool.
    #[serde(with = "crate::config::duration_secs")]
    pub acquire_timeout: Duration,
    /// Interval of the idle/liveness sweep.
    #[serde(with = "crate::config::duration_secs")]
    pub health_check_interval: Duration,
    /// Base URL used when the caller names none, and for warm-up.
    pub default_base_url: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            min_size: DEFAULT_MIN_SIZE,
            max_idle_time: DEFAULT_MAX_IDLE_TIME,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            default_base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

/// One pooled connection and its bookkeeping.
struct Slot<T> {
    base_url: String,
    connection: Arc<T>,
    in_use: bool,
    healthy: bool,
    last_used_at: Instant,
}

impl<T> Slot<T> {
    fn new(base_url: String, connection: T, in_use: bool) -> Self {
        Self {
            base_url,
            connection: Arc::new(connection),
            in_use,
            healthy: true,
            last_used_at: Instant::now(),
        }
    }

    fn is_idle(&self) -> bool {
        !self.in_use
    }
}

/// A checked-out connection, identified by its slot id.
struct Lease<T> {
    id: u64,
    base_url: String,
    connection: Arc<T>,
}

/// What a queued acquirer receives.
enum Handoff<T> {
    /// A released connection, still marked in use.
    Connection(Lease<T>),
    /// Room to open a new connection; already reserved in `pending`.
    Capacity,
}

struct Waiter<T> {
    id: u64,
    base_url: String,
    tx: oneshot::Sender<Handoff<T>>,
}

struct PoolState<T> {
    slots: BTreeMap<u64, Slot<T>>,
    waiters: VecDeque<Waiter<T>>,
    /// Connections being opened; they count against `max_size`.
    pending: usize,
    next_id: u64,
    closed: bool,
    total_requests: u64,
    total_wait: Duration,
    wait_samples: u64,
}

impl<T> PoolState<T> {
    fn new() -> Self {
        Self {
            slots: BTreeMap::new(),
            waiters: VecDeque::new(),
            pending: 0,
            next_id: 0,
            closed: false,
            total_requests: 0,
            total_wait: Duration::ZERO,
            wait_samples: 0,
        }
    }

    fn size(&self) -> usize {
        self.slots.len() + self.pending
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn checkout(&mut self, id: u64) -> Option<Lease<T>> {
        let slot = self.slots.get_mut(&id)?;
        slot.in_use = true;
        slot.last_used_at = Instant::now();
        Some(Lease {
            id,
            base_url: slot.base_url.clone(),
            connection: Arc::clone(&slot.connection),
        })
    }

    fn take_idle(&mut self, base_url: &str) -> Option<Lease<T>> {
        let id = self
            .slots
            .iter()
            .find(|(_, slot)| slot.is_idle() && slot.healthy && slot.base_url == base_url)
            .map(|(id, _)| *id)?;
        self.checkout(id)
    }

    /// Destroy the least recently used idle connection to another base URL.
    fn evict_idle_elsewhere(&mut self, base_url: &str) -> bool {
        let victim = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.is_idle() && slot.base_url != base_url)
            .min_by_key(|(_, slot)| slot.last_used_at)
            .map(|(id, _)| *id);

        match victim.and_then(|id| self.slots.remove(&id)) {
            Some(slot) => {
                debug!(base_url = %slot.base_url, "Evicting idle connection to make room");
                record_connection_evicted("rebalance");
                true
            }
            None => false,
        }
    }

    fn insert(&mut self, slot: Slot<T>) -> u64 {
        let id = self.next_id();
        self.slots.insert(id, slot);
        id
    }

    /// Hand slot `id` to the oldest live waiter, or park it idle.
    ///
    /// A waiter for the same base URL receives the connection itself, still
    /// marked in use. A waiter for a different URL gets the capacity instead:
    /// the connection is destroyed and the waiter opens its own.
    fn offer(&mut self, id: u64, max_size: usize) {
        let Some(base_url) = self.slots.get(&id).map(|slot| slot.base_url.clone()) else {
            return;
        };

        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.tx.is_closed() {
                continue;
            }
            if waiter.base_url == base_url {
                let Some(lease) = self.checkout(id) else {
                    return;
                };
                if waiter.tx.send(Handoff::Connection(lease)).is_ok() {
                    debug!(waiter = waiter.id, base_url = %base_url, "Handed released connection to waiter");
                    return;
                }
            } else {
                self.slots.remove(&id);
                record_connection_evicted("handoff");
                self.pending += 1;
                if waiter.tx.send(Handoff::Capacity).is_err() {
                    self.pending -= 1;
                }
                self.grant_capacity(max_size);
                return;
            }
        }

        if let Some(slot) = self.slots.get_mut(&id) {
            slot.in_use = false;
        }
    }

    /// Let queued acquirers open connections while there is room.
    fn grant_capacity(&mut self, max_size: usize) {
        while self.size() < max_size {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            self.pending += 1;
            if waiter.tx.send(Handoff::Capacity).is_err() {
                self.pending -= 1;
            }
        }
    }

    fn stats(&self, max_size: usize, max_idle_time: Duration) -> PoolStats {
        let now = Instant::now();
        let active = self.slots.values().filter(|slot| slot.in_use).count();
        let healthy = self
            .slots
            .values()
            .filter(|slot| now.saturating_duration_since(slot.last_used_at) <= max_idle_time)
            .count();
        let average_wait_ms = if self.wait_samples == 0 {
            0.0
        } else {
            self.total_wait.as_secs_f64() * 1000.0 / self.wait_samples as f64
        };

        PoolStats {
            total_connections: self.slots.len(),
            active_connections: active,
            idle_connections: self.slots.len() - active,
            max_connections: max_size,
            pending_waiters: self.waiters.len(),
            total_requests: self.total_requests,
            average_wait_ms,
            healthy_connections: healthy,
        }
    }
}

struct PoolShared<C: Connector> {
    config: PoolConfig,
    connector: C,
    state: Mutex<PoolState<C::Connection>>,
    health_task: Mutex<Option<ScheduledTask>>,
}

impl<C: Connector> PoolShared<C> {
    fn lock(&self) -> MutexGuard<'_, PoolState<C::Connection>> {
        self.state.lock()
    }

    fn publish(&self, state: &PoolState<C::Connection>) {
        let active = state.slots.values().filter(|slot| slot.in_use).count();
        record_connection_pool_stats(active, state.slots.len() - active);
    }

    fn release(&self, id: u64) {
        let mut state = self.lock();
        let healthy = match state.slots.get_mut(&id) {
            Some(slot) => {
                slot.last_used_at = Instant::now();
                slot.healthy
            }
            None => return,
        };

        if !healthy || state.closed {
            state.slots.remove(&id);
            record_connection_evicted("unhealthy");
            state.grant_capacity(self.config.max_size);
        } else {
            state.offer(id, self.config.max_size);
        }
        self.publish(&state);
    }

    /// Give back a handoff that reached a waiter which already gave up.
    fn reclaim(&self, handoff: Handoff<C::Connection>) {
        match handoff {
            Handoff::Connection(lease) => self.release(lease.id),
            Handoff::Capacity => {
                let mut state = self.lock();
                state.pending = state.pending.saturating_sub(1);
                state.grant_capacity(self.config.max_size);
            }
        }
    }

    fn mark_unhealthy(&self, id: u64) {
        if let Some(slot) = self.lock().slots.get_mut(&id) {
            slot.healthy = false;
        }
    }

    /// Open a connection against capacity already reserved in `pending`.
    async fn open(&self, base_url: &str) -> Result<C::Connection> {
        let reservation = Reservation { shared: self, armed: true };
        let connection = self.connector.connect(base_url).await?;
        record_connection_created();
        reservation.disarm();
        Ok(connection)
    }

    async fn create_leased(&self, base_url: &str) -> Result<Lease<C::Connection>> {
        let connection = self.open(base_url).await?;
        let mut state = self.lock();
        state.pending = state.pending.saturating_sub(1);
        if state.closed {
            return Err(AppError::PoolClosed);
        }
        let id = state.insert(Slot::new(base_url.to_string(), connection, true));
        let lease = state.checkout(id).ok_or_else(|| {
            AppError::Internal("connection vanished while being checked out".to_string())
        })?;
        self.publish(&state);
        Ok(lease)
    }

    async fn create_idle(&self, base_url: &str) -> Result<()> {
        let connection = self.open(base_url).await?;
        let mut state = self.lock();
        state.pending = state.pending.saturating_sub(1);
        if state.closed {
            return Err(AppError::PoolClosed);
        }
        let id = state.insert(Slot::new(base_url.to_string(), connection, false));
        state.offer(id, self.config.max_size);
        self.publish(&state);
        Ok(())
    }

    /// Reserve room for and open connections to the default base URL until
    /// the pool holds `min_size`. Stops at the first failure.
    async fn fill_to_min(&self) -> usize {
        let mut created = 0;
        loop {
            {
                let mut state = self.lock();
                if state.closed
                    || !state.waiters.is_empty()
                    || state.size() >= self.config.min_size
                    || state.size() >= self.config.max_size
                {
                    break;
                }
                state.pending += 1;
            }
            match self.create_idle(&self.config.default_base_url).await {
                Ok(()) => created += 1,
                Err(e) => {
                    warn!(base_url = %self.config.default_base_url, error = %e, "Failed to open warm connection");
                    break;
                }
            }
        }
        created
    }

    async fn health_check(&self) {
        let (evicted, candidates) = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            let now = Instant::now();

            let mut idle: Vec<(u64, Instant)> = state
                .slots
                .iter()
                .filter(|(_, slot)| slot.is_idle())
                .map(|(id, slot)| (*id, slot.last_used_at))
                .collect();
            idle.sort_by_key(|(_, last_used_at)| *last_used_at);

            let mut evicted = 0;
            let mut candidates = Vec::new();
            for (id, last_used_at) in idle {
                let expired = now.saturating_duration_since(last_used_at) > self.config.max_idle_time;
                if expired && state.slots.len() + state.pending > self.config.min_size {
                    state.slots.remove(&id);
                    record_connection_evicted("idle");
                    evicted += 1;
                } else if let Some(slot) = state.slots.get(&id) {
                    candidates.push((id, Arc::clone(&slot.connection)));
                }
            }
            state.grant_capacity(self.config.max_size);
            (evicted, candidates)
        };

        let probes = candidates.iter().map(|(id, connection)| async move {
            (*id, self.connector.probe(connection).await)
        });
        let results = join_all(probes).await;

        let mut failed = 0;
        {
            let mut state = self.lock();
            for (id, result) in results {
                let Some(slot) = state.slots.get_mut(&id) else {
                    continue;
                };
                match result {
                    Ok(()) => {
                        if slot.is_idle() {
                            slot.healthy = true;
                        }
                    }
                    Err(e) => {
                        warn!(base_url = %slot.base_url, error = %e, "Liveness probe failed");
                        failed += 1;
                        if slot.is_idle() {
                            state.slots.remove(&id);
                            record_connection_evicted("probe_failed");
                        } else {
                            // Picked up while the probe was in flight; drop it on release.
                            slot.healthy = false;
                        }
                    }
                }
            }
            state.grant_capacity(self.config.max_size);
            self.publish(&state);
        }

        let refilled = self.fill_to_min().await;
        if evicted > 0 || failed > 0 || refilled > 0 {
            debug!(evicted, failed, refilled, "Connection pool health check complete");
        }
    }
}

/// Holds capacity reserved in `pending` until the connection is committed.
struct Reservation<'a, C: Connector> {
    shared: &'a PoolShared<C>,
    armed: bool,
}

impl<C: Connector> Reservation<'_, C> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<C: Connector> Drop for Reservation<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.shared.lock();
            state.pending = state.pending.saturating_sub(1);
            state.grant_capacity(self.shared.config.max_size);
        }
    }
}

/// A queued acquirer. Dropping it leaves the queue and returns anything that
/// was handed over in the meantime.
struct WaitTicket<'a, C: Connector> {
    shared: &'a PoolShared<C>,
    id: u64,
    rx: Option<oneshot::Receiver<Handoff<C::Connection>>>,
}

impl<C: Connector> WaitTicket<'_, C> {
    async fn recv(&mut self) -> Option<Handoff<C::Connection>> {
        let rx = self.rx.as_mut()?;
        let handoff = rx.await.ok();
        self.rx = None;
        handoff
    }

    /// Leave the queue. Returns a handoff that raced with the cancellation.
    fn cancel(&mut self) -> Option<Handoff<C::Connection>> {
        let mut rx = self.rx.take()?;
        {
            let mut state = self.shared.lock();
            if let Some(position) = state.waiters.iter().position(|w| w.id == self.id) {
                state.waiters.remove(position);
                return None;
            }
        }
        rx.try_recv().ok()
    }
}

impl<C: Connector> Drop for WaitTicket<'_, C> {
    fn drop(&mut self) {
        if let Some(handoff) = self.cancel() {
            self.shared.reclaim(handoff);
        }
    }
}

enum Step<T> {
    Ready(Lease<T>),
    Create,
    Wait(u64, oneshot::Receiver<Handoff<T>>),
}

/// A connection checked out of the pool. Returned to the pool on drop.
pub struct PooledConnection<C: Connector> {
    shared: Arc<PoolShared<C>>,
    lease: Lease<C::Connection>,
}

impl<C: Connector> PooledConnection<C> {
    /// Pool-local identifier of the underlying connection.
    pub fn id(&self) -> u64 {
        self.lease.id
    }

    pub fn base_url(&self) -> &str {
        &self.lease.base_url
    }

    /// Shared handle to the connection, valid beyond the lease.
    pub fn connection(&self) -> Arc<C::Connection> {
        Arc::clone(&self.lease.connection)
    }

    /// Destroy the connection instead of reusing it when released.
    pub fn mark_unhealthy(&self) {
        self.shared.mark_unhealthy(self.lease.id);
    }

    /// Return the connection to the pool.
    pub fn release(self) {}
}

impl<C: Connector> Deref for PooledConnection<C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        &self.lease.connection
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        self.shared.release(self.lease.id);
    }
}

impl<C: Connector> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.lease.id)
            .field("base_url", &self.lease.base_url)
            .finish()
    }
}

/// Bounded connection pool shared by every request path.
pub struct ConnectionPool<C: Connector> {
    shared: Arc<PoolShared<C>>,
}

impl<C: Connector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Connector> ConnectionPool<C> {
    /// Create the pool, warm it up to `min_size` and start the health sweep.
    pub async fn new(connector: C, config: PoolConfig, scheduler: Scheduler) -> Result<Self> {
        if config.max_size == 0 || config.min_size > config.max_size {
            return Err(AppError::Configuration(format!(
                "invalid pool sizing: min_size={} max_size={}",
                config.min_size, config.max_size
            )));
        }

        let shared = Arc::new(PoolShared {
            config,
            connector,
            state: Mutex::new(PoolState::new()),
            health_task: Mutex::new(None),
        });

        let warmed = shared.fill_to_min().await;

        let weak: Weak<PoolShared<C>> = Arc::downgrade(&shared);
        let task = scheduler.schedule_every(
            "pool-health-check",
            shared.config.health_check_interval,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(shared) = weak.upgrade() {
                        shared.health_check().await;
                    }
                }
            },
        );
        *shared.health_task.lock() = Some(task);

        info!(
            max_size = shared.config.max_size,
            min_size = shared.config.min_size,
            warmed,
            default_base_url = %shared.config.default_base_url,
            "Created connection pool"
        );

        Ok(Self { shared })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Check out a connection to `base_url` (the default base URL if `None`).
    ///
    /// Reuses an idle connection to the same URL, opens a new one while the
    /// pool has room, and otherwise queues until a connection is released to
    /// this caller or `acquire_timeout` elapses.
    pub async fn acquire(&self, base_url: Option<&str>) -> Result<PooledConnection<C>> {
        let base_url = base_url.unwrap_or(&self.shared.config.default_base_url);
        let started = Instant::now();
        let max_size = self.shared.config.max_size;

        let step = {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(AppError::PoolClosed);
            }
            state.total_requests += 1;

            if let Some(lease) = state.take_idle(base_url) {
                Step::Ready(lease)
            } else if state.waiters.is_empty()
                && (state.size() < max_size || state.evict_idle_elsewhere(base_url))
            {
                state.pending += 1;
                Step::Create
            } else {
                let id = state.next_id();
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(Waiter {
                    id,
                    base_url: base_url.to_string(),
                    tx,
                });
                debug!(waiter = id, base_url = %base_url, queued = state.waiters.len(), "Pool exhausted, queueing acquirer");
                Step::Wait(id, rx)
            }
        };

        let lease = match step {
            Step::Ready(lease) => lease,
            Step::Create => self.shared.create_leased(base_url).await?,
            Step::Wait(id, rx) => match self.wait(id, rx, base_url, started).await? {
                Handoff::Connection(lease) => lease,
                Handoff::Capacity => self.shared.create_leased(base_url).await?,
            },
        };

        let waited = started.elapsed();
        {
            let mut state = self.shared.lock();
            state.total_wait += waited;
            state.wait_samples += 1;
            self.shared.publish(&state);
        }
        record_acquire_wait(waited);

        Ok(PooledConnection {
            shared: Arc::clone(&self.shared),
            lease,
        })
    }

    async fn wait(
        &self,
        id: u64,
        rx: oneshot::Receiver<Handoff<C::Connection>>,
        base_url: &str,
        started: Instant,
    ) -> Result<Handoff<C::Connection>> {
        let mut ticket = WaitTicket {
            shared: &self.shared,
            id,
            rx: Some(rx),
        };

        match tokio::time::timeout(self.shared.config.acquire_timeout, ticket.recv()).await {
            Ok(Some(handoff)) => Ok(handoff),
            Ok(None) => Err(AppError::PoolClosed),
            Err(_) => match ticket.cancel() {
                Some(handoff) => Ok(handoff),
                None => {
                    record_acquire_timeout();
                    warn!(base_url = %base_url, "Timed out waiting for a pooled connection");
                    Err(AppError::PoolAcquisitionTimeout {
                        base_url: base_url.to_string(),
                        waited: started.elapsed(),
                    })
                }
            },
        }
    }

    /// Run `f` with a connection to `base_url`, releasing it on every exit path.
    pub async fn with_connection<F, Fut, T>(&self, base_url: &str, f: F) -> Result<T>
    where
        F: FnOnce(Arc<C::Connection>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let pooled = self.acquire(Some(base_url)).await?;
        let result = f(pooled.connection()).await;
        pooled.release();
        result
    }

    /// Run one idle/liveness sweep now.
    pub async fn run_health_check(&self) {
        self.shared.health_check().await;
    }

    /// Get pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.shared
            .lock()
            .stats(self.shared.config.max_size, self.shared.config.max_idle_time)
    }

    /// Stop the health sweep, fail every queued acquirer and drop all connections.
    pub fn shutdown(&self) {
        if let Some(task) = self.shared.health_task.lock().take() {
            task.cancel();
        }
        let (connections, waiters) = {
            let mut state = self.shared.lock();
            state.closed = true;
            let slots = std::mem::take(&mut state.slots);
            let waiters = std::mem::take(&mut state.waiters);
            self.shared.publish(&state);
            (slots.len(), waiters)
        };
        let waiting = waiters.len();
        drop(waiters);
        info!(connections, waiting, "Connection pool shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

impl<C: Connector> fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Pool statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub total_connections: usize,
    pub active_connections: usize,
    pub idle_connections: usize,
    pub max_connections: usize,
    pub pending_waiters: usize,
    pub total_requests: u64,
    pub average_wait_ms: f64,
    /// Connections used within `max_idle_time`.
    pub healthy_connections: usize,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pool: {}/{} total, {} active, {} idle, {} waiting",
            self.total_connections,
            self.max_connections,
            self.active_connections,
            self.idle_connections,
            self.pending_waiters
        )
    }
}
