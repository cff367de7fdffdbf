//! Readiness probes for supervised services.

mod backoff;
mod checker;
mod http;
mod process;
mod tcp;

pub use backoff::Backoff;
pub use checker::{wait_until_healthy, HealthChecker};
pub use http::{HttpChecker, HTTP_PROBE_TIMEOUT};
pub use process::ProcessChecker;
pub use tcp::{TcpChecker, TCP_PROBE_TIMEOUT};

use crate::config::HealthCheckKind;
use crate::error::{Error, Result};
use crate::service::{ProcessHandle, ServiceSpec};

/// Build the checker `spec` asks for. `None` means the service is ready as
/// soon as it has been spawned.
pub fn checker_for(
    spec: &ServiceSpec,
    handle: &ProcessHandle,
) -> Result<Option<Box<dyn HealthChecker>>> {
    match &spec.health.kind {
        HealthCheckKind::None => Ok(None),
        HealthCheckKind::Process => Ok(Some(Box::new(ProcessChecker::new(handle.clone())))),
        HealthCheckKind::Tcp => {
            let port = spec.port.ok_or_else(|| {
                Error::Config(format!(
                    "service '{}' uses a tcp health check but has no port",
                    spec.name
                ))
            })?;
            Ok(Some(Box::new(TcpChecker::new(port))))
        }
        HealthCheckKind::Http { path } => {
            let base = spec.resolved_url().ok_or_else(|| {
                Error::Config(format!(
                    "service '{}' uses an http health check but has neither a url nor a port",
                    spec.name
                ))
            })?;
            Ok(Some(Box::new(HttpChecker::for_service(&base, path)?)))
        }
    }
}
