use std::time::Duration;

use eyre::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Coordinates process shutdown: one cancellation token shared by the HTTP
/// server and every background watch, flipped on SIGINT/SIGTERM.
///
/// Cleanup work after the token fires (deregistration, draining) is bounded
/// by `deadline`; the process must not hang on a dead registry while
/// exiting.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    deadline: Duration,
}

impl ShutdownCoordinator {
    pub fn new(deadline: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline,
        }
    }

    /// Token handed to components that must stop at shutdown.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Trigger shutdown programmatically.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Wait for SIGINT or SIGTERM, then cancel the shared token.
    pub async fn run_signal_handler(&self) -> Result<()> {
        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = wait_for_sigterm() => {
                tracing::info!("received SIGTERM, shutting down");
            }
            _ = self.token.cancelled() => {}
        }
        self.token.cancel();
        Ok(())
    }

    /// Run `cleanup` with the shutdown deadline applied; a timeout is
    /// logged, not propagated, since the process is exiting regardless.
    pub async fn bounded_cleanup<F>(&self, cleanup: F)
    where
        F: Future<Output = ()>,
    {
        if tokio::time::timeout(self.deadline, cleanup).await.is_err() {
            tracing::warn!(
                deadline_secs = self.deadline.as_secs(),
                "shutdown cleanup exceeded deadline, exiting anyway"
            );
        }
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            tracing::error!(error = %err, "failed to register SIGTERM handler");
            std::future::pending::<()>().await;
            return;
        }
    };
    sigterm.recv().await;
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    // Only Ctrl+C is available off Unix.
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_cancels_token() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let token = coordinator.token();
        assert!(!token.is_cancelled());
        coordinator.trigger();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_signal_handler_returns_on_trigger() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        coordinator.trigger();
        coordinator.run_signal_handler().await.unwrap();
    }

    #[tokio::test]
    async fn test_bounded_cleanup_times_out() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(20));
        coordinator
            .bounded_cleanup(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
            })
            .await;
    }

    #[tokio::test]
    async fn test_bounded_cleanup_runs_fast_work() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let mut done = false;
        coordinator.bounded_cleanup(async { done = true }).await;
        assert!(done);
    }
}
