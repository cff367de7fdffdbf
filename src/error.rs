// thiserror's struct-variant expansion trips this lint.
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::io;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    #[diagnostic(code(devstack::validation))]
    Validation(String),

    #[error("explicit port {port} for service '{service}' is outside valid range {start}-{end}")]
    #[diagnostic(
        code(devstack::port::out_of_range),
        help("Pick a port inside {start}-{end}, or widen the range with DEVSTACK_PORT_RANGE_START / DEVSTACK_PORT_RANGE_END")
    )]
    PortOutOfRange {
        service: String,
        port: u16,
        start: u16,
        end: u16,
    },

    #[error("no available ports found after {attempts} attempts in range {start}-{end}")]
    #[diagnostic(
        code(devstack::port::exhausted),
        help("Stop unused services or widen the port range, then retry")
    )]
    PortExhausted { attempts: usize, start: u16, end: u16 },

    #[error("Port {port} is in use{}",
        .process_name.as_ref()
            .zip(.pid.as_ref())
            .map(|(name, pid)| format!(" by process '{}' (PID {})", name, pid))
            .unwrap_or_default()
    )]
    #[diagnostic(
        code(devstack::port::conflict),
        help("Find what's using the port with: lsof -i :{port} (macOS/Linux) or netstat -ano | findstr :{port} (Windows)")
    )]
    PortConflict {
        port: u16,
        pid: Option<u32>,
        process_name: Option<String>,
    },

    #[error("port {port} is already assigned to service '{owner}' in this project")]
    #[diagnostic(
        code(devstack::port::already_assigned),
        help("Release it with `devstack ports release {owner}` or choose another port")
    )]
    PortAlreadyAssigned { port: u16, owner: String },

    #[error("port {0} is still in use after terminating the process holding it")]
    #[diagnostic(code(devstack::port::still_in_use))]
    PortStillInUse(u16),

    #[error("Operation cancelled for service '{0}'")]
    Cancelled(String),

    #[error("Failed to persist port assignments: {0}")]
    #[diagnostic(
        code(devstack::port::persistence),
        help("Check permissions on the .devstack/ directory")
    )]
    Persistence(String),

    #[error("Service not found: {0}")]
    #[diagnostic(
        code(devstack::service::not_found),
        help("List supervised services with `devstack run` output or the dashboard snapshot")
    )]
    ServiceNotFound(String),

    #[error("Service '{0}' is already running")]
    ServiceAlreadyRunning(String),

    #[error("Service '{0}' failed to start: {1}")]
    #[diagnostic(
        code(devstack::service::start_failed),
        help("Verify the command exists and is executable")
    )]
    ServiceStartFailed(String, String),

    #[error("Service '{0}' health check failed: {1}")]
    #[diagnostic(
        code(devstack::service::health_check_failed),
        help("Check the service logs and verify the health check settings")
    )]
    HealthCheckFailed(String, String),

    #[error("Failed to stop service '{service}': {reason}")]
    Termination { service: String, reason: String },

    #[error("Invalid PID {pid}: {reason}")]
    InvalidPid { pid: u32, reason: String },

    #[error("Multiple errors occurred:\n{}", .0.iter().map(|e| format!("  - {}", e)).collect::<Vec<_>>().join("\n"))]
    Multiple(Vec<Error>),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True when the user declined every conflict-resolution option.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    /// Outcomes a caller may retry with a fresh allocation. Port checks are
    /// check-then-use, so a later bind failure lands here as well.
    pub fn is_retryable_bind(&self) -> bool {
        match self {
            Error::PortExhausted { .. } | Error::PortStillInUse(_) => true,
            Error::Io(e) => e.kind() == io::ErrorKind::AddrInUse,
            _ => false,
        }
    }

    /// Returns a helpful suggestion for resolving this error, if available.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Error::PortConflict {
                port,
                pid,
                process_name,
            } => {
                let kill_hint = match (pid, process_name) {
                    (Some(p), Some(name)) => format!(
                        "To free the port, stop '{}' (PID {}) or use a different port.",
                        name, p
                    ),
                    (Some(p), None) => {
                        format!("To free the port, kill PID {} or use a different port.", p)
                    }
                    _ => "Omit the explicit port to let devstack pick one.".to_string(),
                };
                Some(format!("Port {} is already in use. {}", port, kill_hint))
            }
            Error::PortOutOfRange { start, end, .. } => Some(format!(
                "The allocation range is {}-{}. Set DEVSTACK_PORT_RANGE_START / DEVSTACK_PORT_RANGE_END to change it.",
                start, end
            )),
            Error::PortExhausted { .. } => Some(
                "Retry the allocation; ports may free up as other services stop.".to_string(),
            ),
            Error::PortAlreadyAssigned { owner, .. } => Some(format!(
                "Release the existing assignment with: devstack ports release {}",
                owner
            )),
            Error::PortStillInUse(port) => Some(format!(
                "Something restarted on port {} after it was killed. Stop it manually or pick another port.",
                port
            )),
            Error::Persistence(_) => {
                Some("Check that .devstack/ is writable by the current user.".to_string())
            }
            Error::HealthCheckFailed(service, _) => Some(format!(
                "Check the output of '{}' and verify its health check URL or port.",
                service
            )),
            Error::ServiceStartFailed(..) => {
                Some("Check that the command exists and is executable".to_string())
            }
            Error::Multiple(errors) => {
                let hints: Vec<String> = errors.iter().filter_map(|e| e.suggestion()).collect();
                if hints.is_empty() {
                    None
                } else {
                    Some(hints.join("\n"))
                }
            }
            _ => None,
        }
    }

    /// Formats the error with its suggestion (if any) for user-friendly display.
    pub fn with_suggestion(&self) -> String {
        match self.suggestion() {
            Some(suggestion) => format!("{}\n\nHint: {}", self, suggestion),
            None => self.to_string(),
        }
    }
}

/// Validates and converts a u32 PID to nix::unistd::Pid safely.
/// Returns Err for PID 0 (process group), PID 1 (init), or values > i32::MAX.
#[cfg(unix)]
pub fn validate_pid(pid: u32, service_name: &str) -> Result<nix::unistd::Pid> {
    if pid == 0 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!(
                "PID 0 is invalid for service '{}' (refers to process group, not a process)",
                service_name
            ),
        });
    }
    if pid == 1 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!(
                "refusing to operate on PID 1 (init) for service '{}'",
                service_name
            ),
        });
    }
    if pid > i32::MAX as u32 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!(
                "PID {} exceeds i32::MAX for service '{}', cannot convert safely",
                pid, service_name
            ),
        });
    }
    Ok(nix::unistd::Pid::from_raw(pid as i32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_conflict_message_names_occupant() {
        let err = Error::PortConflict {
            port: 3000,
            pid: Some(42),
            process_name: Some("node".to_string()),
        };
        assert_eq!(err.to_string(), "Port 3000 is in use by process 'node' (PID 42)");

        let bare = Error::PortConflict {
            port: 3000,
            pid: None,
            process_name: None,
        };
        assert_eq!(bare.to_string(), "Port 3000 is in use");
    }

    #[test]
    fn out_of_range_message() {
        let err = Error::PortOutOfRange {
            service: "web".into(),
            port: 80,
            start: 3000,
            end: 65535,
        };
        assert_eq!(
            err.to_string(),
            "explicit port 80 for service 'web' is outside valid range 3000-65535"
        );
        assert!(err.with_suggestion().contains("Hint:"));
    }

    #[test]
    fn cancellation_is_distinct_from_exhaustion() {
        let cancelled = Error::Cancelled("web".into());
        let exhausted = Error::PortExhausted {
            attempts: 100,
            start: 3000,
            end: 3100,
        };
        assert!(cancelled.is_cancellation());
        assert!(!cancelled.is_retryable_bind());
        assert!(!exhausted.is_cancellation());
        assert!(exhausted.is_retryable_bind());
    }

    #[test]
    fn multiple_lists_each_error() {
        let err = Error::Multiple(vec![
            Error::ServiceNotFound("a".into()),
            Error::Cancelled("b".into()),
        ]);
        let text = err.to_string();
        assert!(text.contains("  - Service not found: a"));
        assert!(text.contains("  - Operation cancelled for service 'b'"));
    }

    #[cfg(unix)]
    #[test]
    fn validate_pid_rejects_reserved_values() {
        assert!(validate_pid(0, "svc").is_err());
        assert!(validate_pid(1, "svc").is_err());
        assert!(validate_pid(u32::MAX, "svc").is_err());
        assert_eq!(validate_pid(1234, "svc").unwrap().as_raw(), 1234);
    }
}
