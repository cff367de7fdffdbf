use crate::output::{summary_line, UserOutput};
use anyhow::{bail, Context};
use devstack::config::{HealthCheckConfig, HealthCheckKind, PortRange, SupervisorConfig};
use devstack::port::{AllocatorRegistry, AutoAssignResolver, ConflictResolver, TerminalResolver};
use devstack::service::ServiceSpec;
use devstack::supervisor::{shutdown_signal, Supervisor};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// How long to wait for log streams to drain after shutdown.
const STREAM_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct RunOptions {
    pub services: Vec<String>,
    pub ports: Vec<String>,
    pub explicit: Vec<String>,
    pub health: String,
    pub health_path: String,
    pub log_files: bool,
    pub yes: bool,
}

pub async fn run_services(
    project_dir: &Path,
    opts: RunOptions,
    out: Arc<dyn UserOutput>,
) -> anyhow::Result<()> {
    let services = parse_services(&opts.services)?;
    let ports = parse_ports(&opts.ports)?;
    for name in &opts.explicit {
        if !ports.contains_key(name) {
            bail!("--explicit {} needs a matching --port {}=PORT", name, name);
        }
    }
    let health = health_config(&opts.health, &opts.health_path)?;

    let resolver: Arc<dyn ConflictResolver> = if opts.yes {
        Arc::new(AutoAssignResolver)
    } else {
        Arc::new(TerminalResolver)
    };
    let registry = AllocatorRegistry::new(PortRange::from_env(), resolver);
    let allocator = registry.allocator_for(project_dir)?;

    let config = SupervisorConfig {
        file_logging: opts.log_files,
        ..SupervisorConfig::from_env()
    };
    let supervisor = Supervisor::builder(project_dir)
        .config(config)
        .allocator(allocator.clone())
        .build();

    let name_width = services.iter().map(|(name, _)| name.len()).max().unwrap_or(0);
    let mut streams = JoinSet::new();

    out.status(&format!("Starting {} service(s)", services.len()));
    for (name, command) in &services {
        let preferred = ports.get(name).copied();
        let explicit = opts.explicit.contains(name);

        // The allocator may prompt or kill a process; keep it off the runtime.
        let allocation = {
            let allocator = allocator.clone();
            let service = name.clone();
            tokio::task::spawn_blocking(move || allocator.assign_port(&service, preferred, explicit))
                .await?
        };
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                out.error(&format!("Could not assign a port to '{}': {}", name, e));
                let _ = supervisor.shutdown().await;
                return Err(e.into());
            }
        };
        if allocation.was_auto_assigned {
            out.warning(&format!(
                "'{}' moved from port {} to {}; update its configured port to keep it",
                name,
                preferred.unwrap_or_default(),
                allocation.port
            ));
        }

        let spec = ServiceSpec::shell(name, command)
            .with_port(allocation.port)
            .with_working_dir(project_dir)
            .with_health(health.clone());
        if let Err(e) = supervisor.start_service(spec).await {
            out.error(&format!("Failed to start '{}': {}", name, e));
            let _ = supervisor.shutdown().await;
            return Err(e.into());
        }
        out.status(&format!("  {} -> port {}", name, allocation.port));

        if let Some(buffer) = supervisor.logs(name) {
            let (backlog, mut feed) = buffer.subscribe_with_backlog();
            let out = out.clone();
            streams.spawn(async move {
                for entry in &backlog {
                    out.log_line(entry, name_width);
                }
                while let Some(entry) = feed.recv().await {
                    out.log_line(&entry, name_width);
                }
            });
        }
    }
    out.status("Press Ctrl-C to stop");
    out.blank();

    let result = supervisor.run_until_shutdown(shutdown_signal()).await;

    // Shutdown closed every buffer, which ends the feeds.
    let drained = tokio::time::timeout(STREAM_DRAIN_TIMEOUT, async {
        while streams.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        streams.abort_all();
    }

    out.blank();
    for entry in supervisor.snapshot() {
        out.status(&summary_line(&entry, name_width));
    }
    match &result {
        Ok(()) => out.success("All services stopped"),
        Err(e) => out.error(&format!("Shutdown finished with errors: {}", e)),
    }
    result.map_err(Into::into)
}

/// `NAME=COMMAND` pairs, in the order given.
fn parse_services(raw: &[String]) -> anyhow::Result<Vec<(String, String)>> {
    let mut services: Vec<(String, String)> = Vec::with_capacity(raw.len());
    for item in raw {
        let (name, command) = split_pair(item, "--service", "NAME=COMMAND")?;
        if services.iter().any(|(existing, _)| *existing == name) {
            bail!("service '{}' given more than once", name);
        }
        services.push((name, command));
    }
    Ok(services)
}

fn parse_ports(raw: &[String]) -> anyhow::Result<HashMap<String, u16>> {
    raw.iter()
        .map(|item| {
            let (name, port) = split_pair(item, "--port", "NAME=PORT")?;
            let port: u16 = port
                .parse()
                .with_context(|| format!("invalid port '{}' for service '{}'", port, name))?;
            Ok((name, port))
        })
        .collect()
}

fn split_pair(item: &str, flag: &str, shape: &str) -> anyhow::Result<(String, String)> {
    match item.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() && !value.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => bail!("{} expects {}, got '{}'", flag, shape, item),
    }
}

fn health_config(kind: &str, path: &str) -> anyhow::Result<HealthCheckConfig> {
    let config = match kind.parse::<HealthCheckKind>()? {
        HealthCheckKind::None => HealthCheckConfig::none(),
        HealthCheckKind::Tcp => HealthCheckConfig::tcp(),
        HealthCheckKind::Process => HealthCheckConfig::process(),
        HealthCheckKind::Http { .. } => HealthCheckConfig::http(path),
    };
    Ok(config.with_env_overrides())
}
