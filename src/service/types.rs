use crate::config::HealthCheckConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// Lifecycle status of a supervised service.
///
/// # State Transitions
///
/// ```text
/// Stopped ──► Starting ──► Ready
///    ▲  ▲         │          │
///    │  │         ▼          ▼
///    │  └──────  Error ◄─────┘
///    │            │
///    └─ Stopping ◄┘ (also from Starting / Ready)
/// ```
///
/// `Ready -> Error` happens when the process exits on its own; it never
/// affects any other service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Starting,
    Ready,
    Error,
    Stopping,
    Stopped,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Starting => write!(f, "starting"),
            Status::Ready => write!(f, "ready"),
            Status::Error => write!(f, "error"),
            Status::Stopping => write!(f, "stopping"),
            Status::Stopped => write!(f, "stopped"),
        }
    }
}

impl Status {
    /// Check if a status transition is valid according to the state machine.
    ///
    /// ```
    /// use devstack::service::Status;
    ///
    /// assert!(Status::Starting.can_transition_to(Status::Ready));
    /// assert!(Status::Ready.can_transition_to(Status::Error));
    /// assert!(!Status::Stopped.can_transition_to(Status::Ready));
    /// ```
    pub fn can_transition_to(&self, to: Status) -> bool {
        use Status::*;
        match (self, to) {
            (Stopped, Starting) | (Error, Starting) => true,
            (Starting, Ready) | (Starting, Error) => true,
            (Ready, Error) => true,
            (Starting, Stopping) | (Ready, Stopping) | (Error, Stopping) => true,
            (Stopping, Stopped) | (Stopping, Error) => true,
            (s1, s2) if *s1 == s2 => true,
            _ => false,
        }
    }

    /// Stopping or stopped.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Stopping | Status::Stopped)
    }
}

/// Result of the most recent readiness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Unknown,
    Healthy,
    Unhealthy,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Health::Unknown => write!(f, "unknown"),
            Health::Healthy => write!(f, "healthy"),
            Health::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// How to launch one service.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    /// Injected into the child's environment as `PORT`.
    pub port: Option<u16>,
    /// Defaults to `http://localhost:<port>`.
    pub url: Option<String>,
    pub health: HealthCheckConfig,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            port: None,
            url: None,
            health: HealthCheckConfig::default(),
        }
    }

    /// Run `script` through the platform shell.
    pub fn shell(name: impl Into<String>, script: impl Into<String>) -> Self {
        #[cfg(windows)]
        let (program, flag) = ("cmd", "/C");
        #[cfg(not(windows))]
        let (program, flag) = ("sh", "-c");

        Self::new(name, program).with_args([flag.to_string(), script.into()])
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_health(mut self, health: HealthCheckConfig) -> Self {
        self.health = health;
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn resolved_url(&self) -> Option<String> {
        self.url
            .clone()
            .or_else(|| self.port.map(|p| format!("http://localhost:{}", p)))
    }
}

/// The supervisor's view of one service, as handed to the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRuntimeEntry {
    pub name: String,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub url: Option<String>,
    pub status: Status,
    pub health: Health,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub last_checked: Option<DateTime<Utc>>,
}

impl ServiceRuntimeEntry {
    pub fn new(spec: &ServiceSpec) -> Self {
        Self {
            name: spec.name.clone(),
            pid: None,
            port: spec.port,
            url: spec.resolved_url(),
            status: Status::Stopped,
            health: Health::Unknown,
            error: None,
            start_time: None,
            last_checked: None,
        }
    }

    /// Apply `to` if the state machine allows it. Returns whether it did.
    pub fn transition(&mut self, to: Status) -> bool {
        if !self.status.can_transition_to(to) {
            tracing::debug!(
                "Ignoring transition {} -> {} for service '{}'",
                self.status,
                to,
                self.name
            );
            return false;
        }
        self.status = to;
        true
    }

    /// Move to `Error` with a message, unless already shutting down.
    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        let message = message.into();
        if self.transition(Status::Error) {
            self.error = Some(message);
            self.health = Health::Unhealthy;
            true
        } else {
            false
        }
    }
}
