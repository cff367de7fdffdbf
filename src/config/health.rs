//! Readiness probe configuration.
//!
//! Probes poll with exponential backoff: a fixed first interval that doubles
//! up to a cap, all bounded by an overall timeout.

use super::duration_override;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default overall readiness timeout (5 minutes).
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub const HEALTH_TIMEOUT_ENV: &str = "DEVSTACK_HEALTH_TIMEOUT";

const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(5);
const PORT_INITIAL_INTERVAL: Duration = Duration::from_millis(100);
const PORT_MAX_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_MULTIPLIER: f64 = 2.0;

/// What "ready" means for a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HealthCheckKind {
    /// Ready as soon as it is spawned.
    None,
    /// Ready once a TCP connect to its port succeeds.
    Tcp,
    /// Ready once `GET <url><path>` answers 2xx or 3xx.
    Http { path: String },
    /// Ready while the process is alive.
    Process,
}

impl std::str::FromStr for HealthCheckKind {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(HealthCheckKind::None),
            "tcp" | "port" => Ok(HealthCheckKind::Tcp),
            "http" => Ok(HealthCheckKind::Http {
                path: "/".to_string(),
            }),
            "process" => Ok(HealthCheckKind::Process),
            other => Err(crate::error::Error::Config(format!(
                "unknown health check type '{}' (expected http, tcp, process or none)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub kind: HealthCheckKind,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    pub timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self::tcp()
    }
}

impl HealthCheckConfig {
    fn with_kind(kind: HealthCheckKind) -> Self {
        let (initial_interval, max_interval) = match kind {
            HealthCheckKind::Tcp => (PORT_INITIAL_INTERVAL, PORT_MAX_INTERVAL),
            _ => (DEFAULT_INITIAL_INTERVAL, DEFAULT_MAX_INTERVAL),
        };
        Self {
            kind,
            initial_interval,
            max_interval,
            multiplier: DEFAULT_MULTIPLIER,
            timeout: DEFAULT_HEALTH_TIMEOUT,
        }
    }

    pub fn none() -> Self {
        Self::with_kind(HealthCheckKind::None)
    }

    pub fn tcp() -> Self {
        Self::with_kind(HealthCheckKind::Tcp)
    }

    pub fn http(path: impl Into<String>) -> Self {
        Self::with_kind(HealthCheckKind::Http { path: path.into() })
    }

    pub fn process() -> Self {
        Self::with_kind(HealthCheckKind::Process)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_intervals(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_interval = initial;
        self.max_interval = max.max(initial);
        self
    }

    /// Apply `DEVSTACK_HEALTH_TIMEOUT` from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(&super::process_env)
    }

    pub fn with_overrides_from<F>(mut self, lookup: &F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(timeout) = duration_override(lookup, HEALTH_TIMEOUT_ENV) {
            self.timeout = timeout;
        }
        self
    }
}
