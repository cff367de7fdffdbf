mod ports;
mod run;

pub use ports::run_ports;
pub use run::{run_services, RunOptions};
