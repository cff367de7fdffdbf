//! Building blocks for supervising one service process.
//!
//! - [`ServiceSpec`] describes what to launch; [`ServiceRuntimeEntry`] is
//!   what the supervisor reports about it.
//! - [`process::spawn`] starts the child and splits it into a
//!   [`ProcessHandle`] and a [`ProcessDriver`].
//! - [`LogCapture`] feeds stdout/stderr into a [`LogBuffer`].
//! - [`Terminator`] stops a process the way the platform allows.
//!
//! # Example
//!
//! ```no_run
//! use devstack::service::{LogBuffer, LogEntry};
//!
//! let buffer = LogBuffer::new("web", 1000);
//! let mut feed = buffer.subscribe();
//! buffer.add(LogEntry::new("web", "listening on 3000", false));
//! assert_eq!(feed.try_recv().unwrap().message, "listening on 3000");
//! ```

mod log_buffer;
mod log_capture;
pub mod process;
mod termination;
mod types;

pub use log_buffer::*;
pub use log_capture::*;
pub use process::{ExitInfo, ProcessDriver, ProcessHandle};
pub use termination::*;
pub use types::*;
