//! Graceful shutdown.
//!
//! One [`CancellationToken`] is the drain signal for the whole relay: the
//! acceptor checks it before every append and the delivery worker checks it
//! at iteration boundaries. Background tasks are spawned on a
//! [`TaskTracker`] so [`ShutdownCoordinator::shutdown`] can wait for them,
//! bounded by a grace period.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Wait for a `SIGTERM` or `SIGINT`
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = term.recv() => info!("Received SIGTERM"),
        _ = int.recv() => info!("Received SIGINT"),
    }
    Ok(())
}

/// Wait for `ctrl+c`
#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received SIGINT");
    Ok(())
}

/// How a drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every tracked task finished inside the grace period
    Completed,
    /// The grace period ran out first; unfinished entries stay pending in the buffer
    TimedOut,
}

#[derive(Debug)]
pub struct ShutdownCoordinator {
    drain: CancellationToken,
    tasks: TaskTracker,
    grace: Duration,
}

impl ShutdownCoordinator {
    #[must_use]
    pub fn new(grace: Duration) -> Self {
        Self {
            drain: CancellationToken::new(),
            tasks: TaskTracker::new(),
            grace,
        }
    }

    /// The shared drain signal. Clones observe the same cancellation.
    #[must_use]
    pub fn drain_signal(&self) -> CancellationToken {
        self.drain.clone()
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.drain.is_cancelled()
    }

    /// Spawn a task that shutdown waits for.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tasks.spawn(task)
    }

    /// Raise the drain signal without waiting.
    pub fn begin_drain(&self) {
        if !self.drain.is_cancelled() {
            info!("Drain requested");
            self.drain.cancel();
        }
    }

    /// Raise the drain signal and wait up to the grace period for tracked tasks.
    #[tracing::instrument(skip(self), fields(grace_ms = self.grace.as_millis() as u64))]
    pub async fn shutdown(&self) -> DrainOutcome {
        self.begin_drain();
        self.tasks.close();

        match tokio::time::timeout(self.grace, self.tasks.wait()).await {
            Ok(()) => {
                info!("Drain completed");
                DrainOutcome::Completed
            }
            Err(_) => {
                warn!(still_running = self.tasks.len(), "Drain timed out");
                DrainOutcome::TimedOut
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_shutdown_waits_for_tracked_task() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let cleaned = Arc::new(AtomicBool::new(false));

        let drain = coordinator.drain_signal();
        let flag = cleaned.clone();
        coordinator.spawn(async move {
            drain.cancelled().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            flag.store(true, Ordering::SeqCst);
        });

        assert!(!coordinator.is_draining());
        let outcome = coordinator.shutdown().await;

        assert_eq!(outcome, DrainOutcome::Completed);
        assert!(coordinator.is_draining());
        assert!(cleaned.load(Ordering::SeqCst), "task did not finish cleanup");
    }

    #[tokio::test]
    async fn test_shutdown_times_out_on_stuck_task() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(30));
        coordinator.spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        assert_eq!(coordinator.shutdown().await, DrainOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_shutdown_without_tasks_completes() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(10));
        assert_eq!(coordinator.shutdown().await, DrainOutcome::Completed);
    }

    #[tokio::test]
    async fn test_begin_drain_is_visible_to_clones() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let signal = coordinator.drain_signal();

        coordinator.begin_drain();
        coordinator.begin_drain();
        assert!(signal.is_cancelled());
    }
}
