use super::Supervisor;
use crate::error::Result;
use std::future::Future;
use std::sync::atomic::Ordering;

impl Supervisor {
    /// Stop every service, exactly once.
    ///
    /// Also cancels the supervisor so no further services can be started.
    /// Multiple concurrent calls are safe - only the first will execute.
    pub async fn shutdown(&self) -> Result<()> {
        if self
            .shutdown_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Shutdown already in progress or completed, skipping");
            return Ok(());
        }

        self.cancellation_token.cancel();
        tracing::info!("Stopping all services");
        let result = self.stop_all().await;
        match &result {
            Ok(()) => tracing::info!("All services stopped"),
            Err(e) => tracing::error!("Shutdown finished with errors: {}", e),
        }
        result
    }

    /// Keep supervising until `signal` resolves or the supervisor is
    /// cancelled, then shut down and wait for every monitoring task.
    ///
    /// Individual services exiting or crashing never make this return.
    pub async fn run_until_shutdown<F>(&self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            _ = signal => tracing::info!("Shutdown signal received"),
            _ = self.cancellation_token.cancelled() => tracing::debug!("Supervisor cancelled"),
        }

        let result = self.shutdown().await;

        // Counting join: every task is awaited; none cancels the others.
        let mut monitors = std::mem::take(&mut *self.monitors.lock());
        let mut finished = 0usize;
        while let Some(joined) = monitors.join_next().await {
            finished += 1;
            if let Err(e) = joined {
                tracing::error!("Monitoring task ended abnormally: {}", e);
            }
        }
        tracing::debug!("{} monitoring task(s) finished", finished);
        result
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_started.load(Ordering::SeqCst)
    }
}

/// Resolves on Ctrl-C, or on SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to create SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
