//! Graceful shutdown handling.
//!
//! SIGINT/SIGTERM flip a shared flag. Components hold a [`ShutdownGuard`]
//! and wait on it: the observability server drains, the scheduler cancels
//! every timer, and the composition root then closes the connection pool.
//! The flag is level-triggered, so a guard taken after the signal still
//! resolves.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::reliability::scheduler::Scheduler;

/// Process-wide shutdown switch.
#[derive(Debug, Clone)]
pub struct GracefulShutdown {
    trigger: Arc<watch::Sender<bool>>,
}

/// Future-side handle for one component.
#[derive(Debug)]
pub struct ShutdownGuard {
    component: &'static str,
    triggered: watch::Receiver<bool>,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        let (trigger, _) = watch::channel(false);
        Self {
            trigger: Arc::new(trigger),
        }
    }

    /// Start shutdown. Later calls are no-ops.
    pub fn trigger(&self, reason: &'static str) {
        let first = self.trigger.send_if_modified(|triggered| !std::mem::replace(triggered, true));
        if first {
            info!(reason, "Initiating graceful shutdown");
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.trigger.borrow()
    }

    /// A guard for `component` that resolves once shutdown starts.
    pub fn guard(&self, component: &'static str) -> ShutdownGuard {
        ShutdownGuard {
            component,
            triggered: self.trigger.subscribe(),
        }
    }

    /// Trigger shutdown on SIGINT or SIGTERM.
    pub fn listen_for_signals(&self) -> JoinHandle<()> {
        let shutdown = self.clone();
        tokio::spawn(async move {
            let reason = wait_for_signal().await;
            shutdown.trigger(reason);
        })
    }

    /// Cancel every task owned by `scheduler` once shutdown starts.
    pub fn cancel_on_shutdown(&self, scheduler: Scheduler) -> JoinHandle<()> {
        let guard = self.guard("scheduler");
        tokio::spawn(async move {
            guard.wait().await;
            scheduler.shutdown();
        })
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownGuard {
    /// Resolve when shutdown starts, or when every [`GracefulShutdown`]
    /// handle is gone.
    pub async fn wait(mut self) {
        match self.triggered.wait_for(|triggered| *triggered).await {
            Ok(_) => info!(component = self.component, "Component shutting down"),
            Err(_) => debug!(component = self.component, "Shutdown handle dropped"),
        }
    }
}

async fn wait_for_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_trigger_releases_waiting_guards() {
        let shutdown = GracefulShutdown::new();
        let server = tokio::spawn(shutdown.guard("http-server").wait());
        let pool = tokio::spawn(shutdown.guard("pool").wait());
        tokio::task::yield_now().await;
        assert!(!server.is_finished());

        shutdown.trigger("test");
        timeout(Duration::from_millis(100), server).await.unwrap().unwrap();
        timeout(Duration::from_millis(100), pool).await.unwrap().unwrap();
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_guard_taken_after_trigger_resolves() {
        let shutdown = GracefulShutdown::new();
        shutdown.trigger("test");
        shutdown.trigger("again");

        timeout(Duration::from_millis(100), shutdown.guard("late").wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropping_every_handle_releases_guards() {
        let shutdown = GracefulShutdown::new();
        let guard = shutdown.guard("orphan");
        drop(shutdown);

        timeout(Duration::from_millis(100), guard.wait()).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_cancels_scheduler() {
        let shutdown = GracefulShutdown::new();
        let scheduler = Scheduler::new();
        let task = scheduler.schedule_every("tick", Duration::from_secs(3600), || async {});
        let watcher = shutdown.cancel_on_shutdown(scheduler.clone());

        shutdown.trigger("test");
        timeout(Duration::from_millis(100), watcher).await.unwrap().unwrap();
        assert!(scheduler.is_shut_down());
        assert!(task.is_finished());
    }
}
