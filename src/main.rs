mod cli;
mod commands;
mod output;

use clap::Parser;
use cli::{Cli, Commands};
use devstack::Error as DevstackError;
use output::UserOutput;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        if let Some(devstack_error) = e.downcast_ref::<DevstackError>() {
            eprintln!("Error: {}", devstack_error.with_suggestion());
        } else {
            eprintln!("Error: {:#}", e);
        }
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let project_dir = match cli.project_dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let out: Arc<dyn UserOutput> = Arc::new(output::CliOutput);

    match cli.command {
        Commands::Run {
            services,
            ports,
            explicit,
            health,
            health_path,
            log_files,
            yes,
        } => {
            let opts = commands::RunOptions {
                services,
                ports,
                explicit,
                health,
                health_path,
                log_files,
                yes,
            };
            commands::run_services(&project_dir, opts, out).await
        }
        Commands::Ports(ports_cmd) => commands::run_ports(&ports_cmd, &project_dir, out.as_ref()),
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    // stdout carries service output; diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}
