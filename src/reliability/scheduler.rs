//! Lifecycle-managed background task scheduling.
//!
//! Every timer in the routing layer (breaker cool-downs, pool health sweeps,
//! membership timeout sweeps, the discovery listener) is spawned through a
//! [`Scheduler`] so that a single `shutdown()` cancels all of them. Tasks never
//! keep the process alive on their own.

use std::future::Future;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Owner of the cancellation scope shared by background tasks.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    token: CancellationToken,
}

/// Handle to one scheduled task. Dropping the handle does not cancel the task.
#[derive(Debug)]
pub struct ScheduledTask {
    name: &'static str,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    fn detached(name: &'static str) -> Self {
        Self {
            name,
            token: CancellationToken::new(),
            handle: None,
        }
    }

    /// Cancel the task if it has not run yet (or stop a periodic task).
    pub fn cancel(&self) {
        trace!(task = self.name, "Cancelling scheduled task");
        self.token.cancel();
    }

    /// Whether the task was actually spawned on a runtime.
    pub fn is_scheduled(&self) -> bool {
        self.handle.is_some()
    }

    /// Whether the task has completed or been cancelled.
    pub fn is_finished(&self) -> bool {
        self.token.is_cancelled()
            || self.handle.as_ref().map_or(true, |handle| handle.is_finished())
    }
}

impl Scheduler {
    /// Create a scheduler with a fresh cancellation scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// A scheduler whose tasks are also cancelled when this one shuts down.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    /// Run `task` once after `delay`, unless cancelled first.
    pub fn schedule_once<F>(&self, name: &'static str, delay: Duration, task: F) -> ScheduledTask
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Some(runtime) = self.runtime(name) else {
            return ScheduledTask::detached(name);
        };
        let token = self.token.child_token();
        let task_token = token.clone();

        let handle = runtime.spawn(async move {
            tokio::select! {
                _ = task_token.cancelled() => {
                    trace!(task = name, "Scheduled task cancelled before firing");
                }
                _ = tokio::time::sleep(delay) => {
                    task.await;
                }
            }
        });

        ScheduledTask {
            name,
            token,
            handle: Some(handle),
        }
    }

    /// Run `tick` every `period` (first run after one period) until cancelled.
    pub fn schedule_every<F, Fut>(&self, name: &'static str, period: Duration, mut tick: F) -> ScheduledTask
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some(runtime) = self.runtime(name) else {
            return ScheduledTask::detached(name);
        };
        let token = self.token.child_token();
        let task_token = token.clone();

        let handle = runtime.spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = interval.tick() => tick().await,
                }
            }
            debug!(task = name, "Periodic task stopped");
        });

        ScheduledTask {
            name,
            token,
            handle: Some(handle),
        }
    }

    /// Spawn a long-running task that is handed the cancellation token.
    pub fn spawn<F, Fut>(&self, name: &'static str, task: F) -> ScheduledTask
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some(runtime) = self.runtime(name) else {
            return ScheduledTask::detached(name);
        };
        let token = self.token.child_token();
        let handle = runtime.spawn(task(token.clone()));
        ScheduledTask {
            name,
            token,
            handle: Some(handle),
        }
    }

    /// Cancel every task scheduled through this scheduler and its children.
    pub fn shutdown(&self) {
        debug!("Scheduler shutting down");
        self.token.cancel();
    }

    /// Whether `shutdown()` has been called.
    pub fn is_shut_down(&self) -> bool {
        self.token.is_cancelled()
    }

    fn runtime(&self, name: &'static str) -> Option<Handle> {
        if self.token.is_cancelled() {
            debug!(task = name, "Scheduler is shut down, not scheduling task");
            return None;
        }
        match Handle::try_current() {
            Ok(handle) => Some(handle),
            Err(_) => {
                debug!(task = name, "No tokio runtime, task not scheduled");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_schedule_once_fires_after_delay() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        let task = scheduler.schedule_once("once", Duration::from_secs(5), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(task.is_scheduled());

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_task_never_fires() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        let task = scheduler.schedule_once("once", Duration::from_secs(1), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        task.cancel();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_periodic_tasks() {
        let scheduler = Scheduler::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);

        let _task = scheduler.child().schedule_every("tick", Duration::from_secs(1), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        scheduler.shutdown();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert!(scheduler.is_shut_down());
    }

    #[test]
    fn test_without_runtime_tasks_are_detached() {
        let scheduler = Scheduler::new();
        let task = scheduler.schedule_once("once", Duration::from_secs(1), async {});
        assert!(!task.is_scheduled());
    }
}
