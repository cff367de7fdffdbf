use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "devstack")]
#[command(about = "devstack - run and supervise local development services")]
pub struct Cli {
    /// Project directory holding `.devstack/` (defaults to the current directory)
    #[arg(long, global = true, value_name = "DIR")]
    pub project_dir: Option<PathBuf>,

    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Allocate ports, start services and stream their output until Ctrl-C
    Run {
        /// Service to run, as NAME=COMMAND (repeatable)
        #[arg(short, long = "service", value_name = "NAME=COMMAND", required = true)]
        services: Vec<String>,

        /// Preferred port for a service, as NAME=PORT (repeatable)
        #[arg(short, long = "port", value_name = "NAME=PORT")]
        ports: Vec<String>,

        /// Treat the --port of NAME as mandatory (repeatable)
        #[arg(long, value_name = "NAME")]
        explicit: Vec<String>,

        /// Readiness check: http, tcp, process or none
        #[arg(long, default_value = "tcp")]
        health: String,

        /// Path probed by the http readiness check
        #[arg(long, default_value = "/")]
        health_path: String,

        /// Also write each service's output to .devstack/logs/<service>.log
        #[arg(long)]
        log_files: bool,

        /// Never prompt on port conflicts; pick another port instead
        #[arg(short, long)]
        yes: bool,
    },
    /// Inspect or edit persisted port assignments
    #[command(subcommand)]
    Ports(PortsCommands),
}

#[derive(Subcommand, Clone)]
pub enum PortsCommands {
    /// List current port assignments
    #[command(alias = "ls")]
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Forget the port assigned to a service
    Release {
        /// Service name
        service: String,
    },
    /// Drop assignments unused for more than 7 days
    Clean,
}
