//! Per-service monitoring tasks.
//!
//! Every started service gets exactly one task that owns its
//! [`ProcessDriver`]. The task first waits for readiness, racing the health
//! check against the process exiting, and then waits for the process to end.
//! The whole body runs inside a `catch_unwind` boundary so a fault in one
//! service's task ends up as that service's `Error` state and nothing else.

use crate::config::HealthCheckConfig;
use crate::healthcheck::{wait_until_healthy, Backoff, HealthChecker};
use crate::service::{ExitInfo, Health, ProcessDriver, ServiceRuntimeEntry, Status};
use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Shared, lock-protected view of one service's runtime state.
pub(super) type SharedEntry = Arc<Mutex<ServiceRuntimeEntry>>;

pub(super) struct Monitor {
    pub name: String,
    pub entry: SharedEntry,
    pub driver: ProcessDriver,
    pub checker: Option<Box<dyn HealthChecker>>,
    pub health: HealthCheckConfig,
}

impl Monitor {
    /// Run the monitor to completion. Never panics: a panic inside is
    /// logged with the service name and recorded on the entry.
    pub async fn run(self) {
        let name = self.name.clone();
        let entry = self.entry.clone();

        if let Err(panic) = AssertUnwindSafe(self.watch()).catch_unwind().await {
            let detail = panic_message(panic.as_ref());
            tracing::error!("Monitor for service '{}' panicked: {}", name, detail);
            entry.lock().fail(format!("monitor panicked: {}", detail));
        }
    }

    async fn watch(self) {
        let Monitor {
            name,
            entry,
            driver,
            checker,
            health,
        } = self;

        let exit = driver.run();
        tokio::pin!(exit);

        let readiness = async {
            match checker {
                Some(checker) => {
                    wait_until_healthy(
                        &name,
                        checker.as_ref(),
                        Backoff::from_config(&health),
                        health.timeout,
                    )
                    .await
                }
                None => Ok(0),
            }
        };

        tokio::select! {
            info = &mut exit => {
                record_early_exit(&name, &entry, &info);
                return;
            }
            result = readiness => {
                let mut entry = entry.lock();
                entry.last_checked = Some(Utc::now());
                match result {
                    Ok(_) if entry.status == Status::Starting => {
                        entry.transition(Status::Ready);
                        entry.health = Health::Healthy;
                        tracing::info!(
                            "Service '{}' is ready{}",
                            name,
                            entry.port.map(|p| format!(" on port {}", p)).unwrap_or_default()
                        );
                    }
                    Ok(_) => {}
                    Err(e) if !entry.status.is_terminal() => {
                        tracing::warn!("{}", e);
                        entry.fail(e.to_string());
                    }
                    Err(_) => {}
                }
            }
        }

        let info = exit.await;
        let mut entry = entry.lock();
        if entry.status.is_terminal() {
            return;
        }
        tracing::error!("Service '{}' {} unexpectedly", name, info.description);
        entry.fail(info.description.clone());
    }
}

fn record_early_exit(name: &str, entry: &SharedEntry, info: &ExitInfo) {
    let mut entry = entry.lock();
    if entry.status.is_terminal() {
        return;
    }
    let detail = match info.code {
        Some(code) => format!("code {}", code),
        None => info.description.clone(),
    };
    let message = format!("exited before becoming ready ({})", detail);
    tracing::error!("Service '{}' {}", name, message);
    entry.fail(message);
}

/// Best-effort text of a panic payload.
pub(super) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
