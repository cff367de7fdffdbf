//! Spawning a service as a child process.
//!
//! A spawned child is split in two. The [`ProcessDriver`] owns the
//! `tokio::process::Child` and lives inside the service's monitoring task,
//! where it waits for exit. The cloneable [`ProcessHandle`] is what
//! everything else holds: it can signal the process, ask the driver to kill
//! it, and observe its exit.

use super::{LogCapture, ServiceSpec};
use crate::error::{Error, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};

/// How a process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub success: bool,
    pub description: String,
}

impl ExitInfo {
    fn from_status(status: std::io::Result<std::process::ExitStatus>) -> Self {
        match status {
            Ok(status) => {
                let description = match status.code() {
                    Some(code) => format!("exited with code {}", code),
                    None => signal_description(&status),
                };
                Self {
                    code: status.code(),
                    success: status.success(),
                    description,
                }
            }
            Err(e) => Self {
                code: None,
                success: false,
                description: format!("could not be waited on: {}", e),
            },
        }
    }
}

#[cfg(unix)]
fn signal_description(status: &std::process::ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(sig) => format!("terminated by signal {}", sig),
        None => "exited".to_string(),
    }
}

#[cfg(not(unix))]
fn signal_description(_status: &std::process::ExitStatus) -> String {
    "exited".to_string()
}

/// Control side of a running child.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    name: String,
    pid: Option<u32>,
    kill_tx: mpsc::UnboundedSender<()>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

impl ProcessHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some() || self.kill_tx.is_closed()
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit_rx.borrow().clone()
    }

    /// Wait for the process to end. `None` means the driver went away
    /// without recording an exit status.
    pub async fn wait(&self) -> Option<ExitInfo> {
        let mut rx = self.exit_rx.clone();
        if let Ok(exit) = rx.wait_for(|exit| exit.is_some()).await {
            return exit.clone();
        }
        let last = rx.borrow().clone();
        last
    }

    /// Wait up to `timeout`; returns whether the process has ended.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }

    /// Ask the driver to kill the child. Returns false when the driver has
    /// already finished, i.e. the process is gone.
    pub fn kill(&self) -> bool {
        self.kill_tx.send(()).is_ok()
    }

    /// SIGKILL whatever is left of the child's process group. Children
    /// that outlived the shell they were started from would otherwise keep
    /// the service's port and output pipes open. Returns whether anything
    /// was signalled.
    pub fn kill_group(&self) -> bool {
        match self.pid {
            Some(pid) => kill_process_group(pid, &self.name),
            None => false,
        }
    }

    /// Send SIGINT to the child's process group (falling back to the PID).
    ///
    /// Returns `Ok(false)` when there was nothing to signal: the process is
    /// already gone, or the platform cannot deliver interrupts.
    pub fn interrupt(&self) -> Result<bool> {
        if self.has_exited() {
            return Ok(false);
        }
        let Some(pid) = self.pid else {
            return Ok(false);
        };
        send_interrupt(pid, &self.name)
    }
}

#[cfg(unix)]
fn send_interrupt(pid: u32, service: &str) -> Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::{self, killpg, Signal};

    let pid = crate::error::validate_pid(pid, service)?;
    // The child leads its own process group, so this also reaches anything
    // it spawned (npm -> node, dotnet watch -> app).
    match killpg(pid, Signal::SIGINT).or_else(|_| signal::kill(pid, Signal::SIGINT)) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(Error::Termination {
            service: service.to_string(),
            reason: format!("failed to send SIGINT: {}", e),
        }),
    }
}

#[cfg(not(unix))]
fn send_interrupt(_pid: u32, _service: &str) -> Result<bool> {
    Ok(false)
}

#[cfg(unix)]
fn kill_process_group(pid: u32, service: &str) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};

    let Ok(pgid) = crate::error::validate_pid(pid, service) else {
        return false;
    };
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            tracing::debug!("SIGKILL to process group {} of '{}' failed: {}", pid, service, e);
            false
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32, _service: &str) -> bool {
    false
}

/// Owning side of a running child; drive it with [`run`](Self::run).
#[derive(Debug)]
pub struct ProcessDriver {
    name: String,
    pid: Option<u32>,
    child: Child,
    kill_rx: mpsc::UnboundedReceiver<()>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
}

impl ProcessDriver {
    /// Wait for the child to exit, honouring kill requests, and publish the
    /// exit to every handle.
    pub async fn run(mut self) -> ExitInfo {
        let status = loop {
            tokio::select! {
                status = self.child.wait() => break status,
                Some(()) = self.kill_rx.recv() => {
                    let group_killed = self
                        .pid
                        .is_some_and(|pid| kill_process_group(pid, &self.name));
                    if !group_killed {
                        if let Err(e) = self.child.start_kill() {
                            tracing::debug!("Kill request for '{}' failed: {}", self.name, e);
                        }
                    }
                }
            }
        };
        let exit = ExitInfo::from_status(status);
        tracing::debug!("Process for '{}' {}", self.name, exit.description);
        let _ = self.exit_tx.send(Some(exit.clone()));
        exit
    }
}

/// Start `spec` with piped output attached to `capture`.
pub fn spawn(spec: &ServiceSpec, capture: &LogCapture) -> Result<(ProcessHandle, ProcessDriver)> {
    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(port) = spec.port {
        cmd.env("PORT", port.to_string());
    }
    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|e| {
        Error::ServiceStartFailed(spec.name.clone(), format!("{}: {}", spec.command, e))
    })?;

    if let Some(stdout) = child.stdout.take() {
        capture.attach(stdout, false);
    }
    if let Some(stderr) = child.stderr.take() {
        capture.attach(stderr, true);
    }

    let pid = child.id();
    tracing::info!(
        "Started '{}' (PID {}){}",
        spec.name,
        pid.map(|p| p.to_string()).unwrap_or_else(|| "?".into()),
        spec.port.map(|p| format!(" on port {}", p)).unwrap_or_default()
    );

    let (kill_tx, kill_rx) = mpsc::unbounded_channel();
    let (exit_tx, exit_rx) = watch::channel(None);
    Ok((
        ProcessHandle {
            name: spec.name.clone(),
            pid,
            kill_tx,
            exit_rx,
        },
        ProcessDriver {
            name: spec.name.clone(),
            pid,
            child,
            kill_rx,
            exit_tx,
        },
    ))
}
