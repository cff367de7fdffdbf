use super::Backoff;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Health checker trait for services
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// One probe. `Ok(false)` and `Err` both mean "not ready yet".
    async fn check(&self) -> Result<bool>;

    /// Upper bound for a single probe.
    fn timeout(&self) -> Duration;

    /// What is being probed, for log lines.
    fn target(&self) -> String;
}

/// Probe until `checker` reports healthy, sleeping per `backoff` between
/// attempts, for at most `overall`. Returns the number of probes made.
pub async fn wait_until_healthy<C: HealthChecker + ?Sized>(
    service: &str,
    checker: &C,
    mut backoff: Backoff,
    overall: Duration,
) -> Result<u32> {
    let deadline = Instant::now() + overall;
    let mut attempts = 0u32;
    let mut last_error: Option<String> = None;

    loop {
        attempts += 1;
        match tokio::time::timeout(checker.timeout(), checker.check()).await {
            Ok(Ok(true)) => {
                tracing::debug!(
                    "'{}' is ready ({} after {} attempt(s))",
                    service,
                    checker.target(),
                    attempts
                );
                return Ok(attempts);
            }
            Ok(Ok(false)) => {}
            Ok(Err(e)) => last_error = Some(e.to_string()),
            Err(_) => last_error = Some(format!("probe timed out after {:?}", checker.timeout())),
        }

        let now = Instant::now();
        if now >= deadline {
            let detail = last_error
                .map(|e| format!(": {}", e))
                .unwrap_or_default();
            return Err(Error::HealthCheckFailed(
                service.to_string(),
                format!(
                    "{} not ready after {:?} ({} attempts){}",
                    checker.target(),
                    overall,
                    attempts,
                    detail
                ),
            ));
        }
        // Don't oversleep the deadline; one last probe runs right at it.
        sleep(backoff.next_delay().min(deadline - now)).await;
    }
}
