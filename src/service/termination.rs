//! Platform-specific process termination.
//!
//! The supervisor only ever calls [`Terminator::terminate`]; which strategy
//! runs is decided once by [`platform_terminator`].

use super::ProcessHandle;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// How long a forced kill may take before it is reported as failed.
const FORCE_KILL_WAIT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait Terminator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Stop `process`, waiting up to `timeout` for a cooperative exit where
    /// the strategy has one. A process that is already gone counts as
    /// stopped.
    async fn terminate(&self, process: &ProcessHandle, timeout: Duration) -> Result<()>;
}

/// Interrupt, wait, then kill. For platforms that deliver SIGINT.
#[derive(Debug, Default, Clone, Copy)]
pub struct GracefulThenForceful;

/// Kill immediately. For platforms where a console interrupt cannot be
/// sent to another process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ForcefulOnly;

#[async_trait]
impl Terminator for GracefulThenForceful {
    fn name(&self) -> &'static str {
        "graceful-then-forceful"
    }

    async fn terminate(&self, process: &ProcessHandle, timeout: Duration) -> Result<()> {
        if process.has_exited() {
            sweep_group(process);
            return Ok(());
        }

        match process.interrupt() {
            Ok(true) => {
                if process.wait_timeout(timeout).await {
                    tracing::debug!("'{}' exited after interrupt", process.name());
                    sweep_group(process);
                    return Ok(());
                }
                tracing::warn!(
                    "'{}' did not exit within {:?} of SIGINT, killing it",
                    process.name(),
                    timeout
                );
            }
            Ok(false) => {
                if process.wait_timeout(Duration::from_millis(100)).await {
                    sweep_group(process);
                    return Ok(());
                }
            }
            Err(e) => tracing::debug!(
                "Interrupt for '{}' failed ({}), killing it instead",
                process.name(),
                e
            ),
        }

        ForcefulOnly.terminate(process, timeout).await
    }
}

#[async_trait]
impl Terminator for ForcefulOnly {
    fn name(&self) -> &'static str {
        "forceful"
    }

    async fn terminate(&self, process: &ProcessHandle, _timeout: Duration) -> Result<()> {
        if !process.kill() {
            sweep_group(process);
            return Ok(());
        }
        if process.wait_timeout(FORCE_KILL_WAIT).await {
            sweep_group(process);
            Ok(())
        } else {
            Err(Error::Termination {
                service: process.name().to_string(),
                reason: format!("process did not exit within {:?} of being killed", FORCE_KILL_WAIT),
            })
        }
    }
}

/// The group leader is gone; anything it left behind in its group is not
/// allowed to keep running.
fn sweep_group(process: &ProcessHandle) {
    if process.kill_group() {
        tracing::debug!("Killed leftover processes of '{}'", process.name());
    }
}

/// The strategy for the current platform.
pub fn platform_terminator() -> Arc<dyn Terminator> {
    if cfg!(windows) {
        Arc::new(ForcefulOnly)
    } else {
        Arc::new(GracefulThenForceful)
    }
}
