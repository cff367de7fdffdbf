use devstack::service::{LogEntry, ServiceRuntimeEntry, Status};
use std::io::Write;

/// Abstraction over user-facing output.
///
/// Command modules use this trait instead of `println!`/`eprintln!` so that
/// output can be redirected or suppressed without touching command logic.
pub trait UserOutput: Send + Sync {
    /// Informational status message (e.g., "Starting 3 service(s)")
    fn status(&self, message: &str);

    /// Success message (e.g., "All services stopped")
    fn success(&self, message: &str);

    /// Warning message
    fn warning(&self, message: &str);

    /// Error message
    fn error(&self, message: &str);

    /// One captured line of service output.
    fn log_line(&self, entry: &LogEntry, name_width: usize);

    /// A blank line separator.
    fn blank(&self);
}

/// Standard CLI output. Service output goes to stdout, everything else to
/// stderr so it never interleaves with piped logs.
pub struct CliOutput;

impl UserOutput for CliOutput {
    fn status(&self, message: &str) {
        eprintln!("{}", message);
    }

    fn success(&self, message: &str) {
        eprintln!("\x1b[32m{}\x1b[0m", message);
    }

    fn warning(&self, message: &str) {
        eprintln!("\x1b[33m{}\x1b[0m", message);
    }

    fn error(&self, message: &str) {
        eprintln!("\x1b[31m{}\x1b[0m", message);
    }

    fn log_line(&self, entry: &LogEntry, name_width: usize) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(
            out,
            "{:<width$} | {}",
            entry.service,
            entry.message,
            width = name_width
        );
    }

    fn blank(&self) {
        eprintln!();
    }
}

/// One summary row per service, e.g. `  web      ready    :3000  pid 4242`.
pub fn summary_line(entry: &ServiceRuntimeEntry, name_width: usize) -> String {
    let port = entry.port.map(|p| format!(":{}", p)).unwrap_or_default();
    let mut line = format!(
        "  {:<width$}  {:<8} {:<6}",
        entry.name,
        entry.status,
        port,
        width = name_width
    );
    if let Some(pid) = entry.pid {
        line.push_str(&format!("  pid {}", pid));
    }
    if entry.status == Status::Error {
        if let Some(error) = &entry.error {
            line.push_str(&format!("  ({})", error));
        }
    }
    line
}
