use super::duration_override;
use std::time::Duration;

pub const SHUTDOWN_TIMEOUT_ENV: &str = "DEVSTACK_SHUTDOWN_TIMEOUT";

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Knobs for the process supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How long a graceful stop waits before forcing.
    pub shutdown_timeout: Duration,
    /// Ring capacity of each service's log buffer.
    pub log_capacity: usize,
    /// Mirror captured output to `.devstack/logs/<service>.log`.
    pub file_logging: bool,
    /// Release a service's port through the allocator when it stops.
    pub release_ports_on_stop: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            log_capacity: DEFAULT_LOG_CAPACITY,
            file_logging: false,
            release_ports_on_stop: true,
        }
    }
}

impl SupervisorConfig {
    pub fn from_env() -> Self {
        Self::default().with_overrides_from(&super::process_env)
    }

    pub fn with_overrides_from<F>(mut self, lookup: &F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(timeout) = duration_override(lookup, SHUTDOWN_TIMEOUT_ENV) {
            self.shutdown_timeout = timeout;
        }
        self
    }
}
