use super::HealthChecker;
use crate::error::Result;
use crate::service::ProcessHandle;
use async_trait::async_trait;
use std::time::Duration;

/// Healthy for as long as the process is running.
pub struct ProcessChecker {
    handle: ProcessHandle,
}

impl ProcessChecker {
    pub fn new(handle: ProcessHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl HealthChecker for ProcessChecker {
    async fn check(&self) -> Result<bool> {
        Ok(!self.handle.has_exited())
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn target(&self) -> String {
        match self.handle.pid() {
            Some(pid) => format!("process {}", pid),
            None => format!("process for '{}'", self.handle.name()),
        }
    }
}
