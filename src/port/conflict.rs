//! Finding and terminating whatever process holds a port.
//!
//! Discovery is best-effort: when the platform tools are missing or refuse
//! to answer, the conflict is still reported, just without a name or PID.

use crate::error::{Error, Result};
use std::collections::HashSet;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Upper bound on how long a kill command may run.
pub const KILL_PROCESS_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a kill before the port is checked again.
pub const PROCESS_CLEANUP_WAIT: Duration = Duration::from_millis(500);

/// A process bound to a port. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
}

impl std::fmt::Display for ProcessInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (PID {})", self.name, self.pid)
    }
}

/// OS queries the allocator needs during conflict resolution.
pub trait OccupantInspector: Send + Sync {
    /// Every process currently listening on `port`.
    fn find_occupants(&self, port: u16) -> Vec<ProcessInfo>;

    /// Forcefully terminate `pid`, bounded by [`KILL_PROCESS_TIMEOUT`].
    fn terminate(&self, pid: u32) -> Result<()>;

    /// How long to wait after terminating before re-checking the port.
    fn settle_delay(&self) -> Duration {
        PROCESS_CLEANUP_WAIT
    }

    fn find_occupant(&self, port: u16) -> Option<ProcessInfo> {
        self.find_occupants(port).into_iter().next()
    }
}

/// Uses `ss`/`lsof`/`/proc` on linux, `lsof` on macOS and
/// `netstat`/`tasklist`/`taskkill` on Windows.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemOccupants;

impl OccupantInspector for SystemOccupants {
    fn find_occupants(&self, port: u16) -> Vec<ProcessInfo> {
        #[cfg(target_os = "linux")]
        {
            let mut processes = linux_ss(port);
            let seen: HashSet<u32> = processes.iter().map(|p| p.pid).collect();
            processes.extend(lsof(port).into_iter().filter(|p| !seen.contains(&p.pid)));
            processes
        }

        #[cfg(all(unix, not(target_os = "linux")))]
        {
            lsof(port)
        }

        #[cfg(windows)]
        {
            windows_netstat(port)
        }

        #[cfg(not(any(unix, windows)))]
        {
            let _ = port;
            Vec::new()
        }
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        if pid == std::process::id() {
            return Err(Error::InvalidPid {
                pid,
                reason: "refusing to terminate the current process".to_string(),
            });
        }

        let mut command = kill_command(pid)?;
        run_with_timeout(&mut command, KILL_PROCESS_TIMEOUT).map_err(|reason| {
            Error::Termination {
                service: format!("PID {}", pid),
                reason,
            }
        })
    }
}

#[cfg(unix)]
fn kill_command(pid: u32) -> Result<Command> {
    crate::error::validate_pid(pid, "port occupant")?;
    let mut command = Command::new("kill");
    command.args(["-9", &pid.to_string()]);
    Ok(command)
}

#[cfg(windows)]
fn kill_command(pid: u32) -> Result<Command> {
    let mut command = Command::new("taskkill");
    command.args(["/F", "/PID", &pid.to_string()]);
    Ok(command)
}

#[cfg(not(any(unix, windows)))]
fn kill_command(pid: u32) -> Result<Command> {
    Err(Error::Termination {
        service: format!("PID {}", pid),
        reason: "killing processes is not supported on this platform".to_string(),
    })
}

/// Run `command` to completion, killing it if it outlives `timeout`.
fn run_with_timeout(command: &mut Command, timeout: Duration) -> std::result::Result<(), String> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| format!("failed to spawn kill command: {}", e))?;

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) if status.success() => return Ok(()),
            Ok(Some(status)) => return Err(format!("kill command exited with {}", status)),
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(format!("kill command timed out after {:?}", timeout));
            }
            Ok(None) => std::thread::sleep(Duration::from_millis(50)),
            Err(e) => return Err(format!("failed to wait for kill command: {}", e)),
        }
    }
}

#[cfg(target_os = "linux")]
fn linux_ss(port: u16) -> Vec<ProcessInfo> {
    let Some(stdout) = command_stdout("ss", &["-tlnp", &format!("sport = :{}", port)]) else {
        return Vec::new();
    };
    parse_ss_output(&stdout)
        .into_iter()
        .map(|pid| ProcessInfo {
            pid,
            name: proc_comm(pid).unwrap_or_else(|| "unknown".to_string()),
        })
        .collect()
}

#[cfg(target_os = "linux")]
fn proc_comm(pid: u32) -> Option<String> {
    std::fs::read_to_string(format!("/proc/{}/comm", pid))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(unix)]
fn lsof(port: u16) -> Vec<ProcessInfo> {
    let Some(stdout) = command_stdout(
        "lsof",
        &["-i", &format!("TCP:{}", port), "-sTCP:LISTEN", "-P", "-n", "-F", "pc"],
    ) else {
        return Vec::new();
    };
    parse_lsof_fields(&stdout)
}

#[cfg(windows)]
fn windows_netstat(port: u16) -> Vec<ProcessInfo> {
    let Some(stdout) = command_stdout("netstat", &["-ano", "-p", "TCP"]) else {
        return Vec::new();
    };
    parse_netstat_listeners(&stdout, port)
        .into_iter()
        .map(|pid| ProcessInfo {
            pid,
            name: windows_process_name(pid).unwrap_or_else(|| "unknown".to_string()),
        })
        .collect()
}

#[cfg(windows)]
fn windows_process_name(pid: u32) -> Option<String> {
    let stdout = command_stdout(
        "tasklist",
        &["/FI", &format!("PID eq {}", pid), "/FO", "CSV", "/NH"],
    )?;
    // "node.exe","1234","Console","1","45,000 K"
    let first = stdout.lines().next()?;
    let name = first.split(',').next()?.trim_matches('"');
    (!name.is_empty() && !name.starts_with("INFO:")).then(|| name.to_string())
}

fn command_stdout(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        tracing::debug!("{} exited with {}", program, output.status);
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Extract `pid=N` entries from `ss -p` output, header skipped.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_ss_output(stdout: &str) -> Vec<u32> {
    let mut seen = HashSet::new();
    let mut pids = Vec::new();
    for line in stdout.lines().skip(1) {
        for part in line.split(|c| c == ',' || c == '(' || c == ')') {
            if let Some(pid) = part.trim().strip_prefix("pid=").and_then(|p| p.parse().ok()) {
                if seen.insert(pid) {
                    pids.push(pid);
                }
            }
        }
    }
    pids
}

/// Parse `lsof -F pc` output: `pPID` starts a process block, `cNAME`
/// names it.
#[cfg_attr(not(unix), allow(dead_code))]
fn parse_lsof_fields(stdout: &str) -> Vec<ProcessInfo> {
    let mut processes: Vec<ProcessInfo> = Vec::new();
    for line in stdout.lines() {
        if let Some(pid) = line.strip_prefix('p').and_then(|p| p.parse::<u32>().ok()) {
            if !processes.iter().any(|p| p.pid == pid) {
                processes.push(ProcessInfo {
                    pid,
                    name: "unknown".to_string(),
                });
            }
        } else if let Some(name) = line.strip_prefix('c') {
            if let Some(last) = processes.last_mut() {
                if last.name == "unknown" {
                    last.name = name.to_string();
                }
            }
        }
    }
    processes
}

/// PIDs in LISTENING rows of `netstat -ano` whose local address ends in
/// `:port`.
#[cfg_attr(not(windows), allow(dead_code))]
fn parse_netstat_listeners(stdout: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{}", port);
    let mut pids = Vec::new();
    for line in stdout.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // Proto  Local Address  Foreign Address  State  PID
        if fields.len() < 5 || !fields[3].eq_ignore_ascii_case("LISTENING") {
            continue;
        }
        if !fields[1].ends_with(&suffix) {
            continue;
        }
        if let Ok(pid) = fields[4].parse::<u32>() {
            if pid != 0 && !pids.contains(&pid) {
                pids.push(pid);
            }
        }
    }
    pids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ss_users_column() {
        let out = "State  Recv-Q Send-Q Local Address:Port Peer Address:Port Process\n\
                   LISTEN 0      511    0.0.0.0:3000       0.0.0.0:*     users:((\"node\",pid=4242,fd=21),(\"node\",pid=4243,fd=21))\n";
        assert_eq!(parse_ss_output(out), vec![4242, 4243]);
    }

    #[test]
    fn parses_lsof_field_output() {
        let out = "p101\ncpython3\np202\ncnode\np101\n";
        let processes = parse_lsof_fields(out);
        assert_eq!(
            processes,
            vec![
                ProcessInfo {
                    pid: 101,
                    name: "python3".into()
                },
                ProcessInfo {
                    pid: 202,
                    name: "node".into()
                },
            ]
        );
    }

    #[test]
    fn parses_netstat_listening_rows_only() {
        let out = "\
  Proto  Local Address          Foreign Address        State           PID
  TCP    0.0.0.0:3000           0.0.0.0:0              LISTENING       5120
  TCP    127.0.0.1:30000        0.0.0.0:0              LISTENING       6000
  TCP    127.0.0.1:3000         127.0.0.1:51000        ESTABLISHED     7000
";
        assert_eq!(parse_netstat_listeners(out, 3000), vec![5120]);
    }

    #[test]
    fn refuses_to_terminate_self() {
        let err = SystemOccupants.terminate(std::process::id()).unwrap_err();
        assert!(matches!(err, Error::InvalidPid { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn kill_command_timeout_is_enforced() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let err = run_with_timeout(&mut cmd, Duration::from_millis(100)).unwrap_err();
        assert!(err.contains("timed out"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn finds_own_listener_when_tools_available() {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        // ss/lsof may be missing in minimal containers; only check consistency.
        for info in SystemOccupants.find_occupants(port) {
            assert_eq!(info.pid, std::process::id());
        }
    }
}
