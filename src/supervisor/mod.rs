mod core;
mod monitoring;
mod shutdown;

pub use core::{Supervisor, SupervisorBuilder};
pub use shutdown::shutdown_signal;
