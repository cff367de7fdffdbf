//! Conflict-resolution strategies.
//!
//! The allocator never talks to a terminal itself. When a port it needs is
//! held by another process it hands a [`ConflictContext`] to a
//! [`ConflictResolver`] and acts on the answer.

use super::ProcessInfo;
use crate::config::NON_INTERACTIVE_ENV;
use crate::error::Result;
use std::io::{stdin, stdout, Write};

/// What to do about an occupied port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictAction {
    /// Terminate the occupant, then re-check the port.
    KillAndRetry,
    /// Pick a different port by scanning the range.
    Reassign,
    /// Give up; the allocation fails with a cancellation.
    Abort,
}

/// Everything a resolver may want to show before deciding.
#[derive(Debug, Clone)]
pub struct ConflictContext {
    pub service: String,
    pub port: u16,
    /// The port came from fixed project configuration.
    pub explicit: bool,
    pub occupant: Option<ProcessInfo>,
}

/// Decides how a port conflict is resolved.
///
/// Called with no allocator lock held, so an implementation may block on
/// user input for as long as it likes.
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, conflict: &ConflictContext) -> Result<ConflictAction>;
}

/// Always returns the same action.
#[derive(Debug, Clone, Copy)]
pub struct FixedResolver(pub ConflictAction);

impl ConflictResolver for FixedResolver {
    fn resolve(&self, _conflict: &ConflictContext) -> Result<ConflictAction> {
        Ok(self.0)
    }
}

/// Non-interactive policy: never kill anything, always move to another port.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoAssignResolver;

impl ConflictResolver for AutoAssignResolver {
    fn resolve(&self, conflict: &ConflictContext) -> Result<ConflictAction> {
        tracing::info!(
            "Port {} for service '{}' is in use, assigning another port",
            conflict.port,
            conflict.service
        );
        Ok(ConflictAction::Reassign)
    }
}

/// Asks the user on the terminal, falling back to [`AutoAssignResolver`]
/// when there is no terminal to ask.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalResolver;

impl ConflictResolver for TerminalResolver {
    fn resolve(&self, conflict: &ConflictContext) -> Result<ConflictAction> {
        if is_interactive() {
            prompt_user(conflict)
        } else {
            AutoAssignResolver.resolve(conflict)
        }
    }
}

/// Check if running in interactive TTY
pub fn is_interactive() -> bool {
    use std::io::IsTerminal;
    if std::env::var_os(NON_INTERACTIVE_ENV).is_some() {
        return false;
    }
    // Cargo test binaries run from target/*/deps/ - never interactive
    if let Ok(exe) = std::env::current_exe() {
        if let Some(path) = exe.to_str() {
            if path.contains("/deps/") || path.contains("\\deps\\") {
                return false;
            }
        }
    }
    stdin().is_terminal() && stdout().is_terminal()
}

fn prompt_user(conflict: &ConflictContext) -> Result<ConflictAction> {
    let mut out = stdout();
    writeln!(out)?;
    writeln!(
        out,
        "Port {} for service '{}' is already in use",
        conflict.port, conflict.service
    )?;
    if let Some(occupant) = &conflict.occupant {
        writeln!(out, "  Process: {}", occupant.name)?;
        writeln!(out, "  PID:     {}", occupant.pid)?;
    }
    writeln!(out)?;
    writeln!(out, "Options:")?;
    writeln!(out, "  [k] Kill the process using port {}", conflict.port)?;
    if conflict.explicit {
        writeln!(out, "  [a] Auto-assign a different port (you can save it to your config)")?;
    } else {
        writeln!(out, "  [a] Use a different port")?;
    }
    writeln!(out, "  [Esc/q] Cancel")?;
    write!(out, "Your choice: ")?;
    out.flush()?;

    loop {
        use crossterm::event::{read, Event, KeyCode, KeyEvent, KeyEventKind};

        crossterm::terminal::enable_raw_mode()?;
        let event = read();
        crossterm::terminal::disable_raw_mode()?;

        let Event::Key(KeyEvent { code, kind, .. }) = event? else {
            continue;
        };
        if kind != KeyEventKind::Press {
            continue;
        }
        let action = match code {
            KeyCode::Char('k') | KeyCode::Char('K') | KeyCode::Char('1') => {
                ConflictAction::KillAndRetry
            }
            KeyCode::Char('a') | KeyCode::Char('A') | KeyCode::Char('2') => {
                ConflictAction::Reassign
            }
            KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Char('3') | KeyCode::Esc => {
                ConflictAction::Abort
            }
            _ => continue,
        };
        writeln!(out)?;
        return Ok(action);
    }
}
