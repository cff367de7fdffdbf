use crate::cli::PortsCommands;
use crate::output::UserOutput;
use devstack::port::{AutoAssignResolver, PortAllocator};
use std::path::Path;
use std::sync::Arc;

pub fn run_ports(cmd: &PortsCommands, project_dir: &Path, out: &dyn UserOutput) -> anyhow::Result<()> {
    // Nothing here assigns ports, so conflicts can never prompt.
    let allocator = PortAllocator::builder(project_dir)
        .resolver(Arc::new(AutoAssignResolver))
        .build()?;

    match cmd {
        PortsCommands::List { json } => list_ports(&allocator, *json, out),
        PortsCommands::Release { service } => release_port(&allocator, service, out),
        PortsCommands::Clean => clean_ports(&allocator, out),
    }
}

fn list_ports(allocator: &PortAllocator, json: bool, out: &dyn UserOutput) -> anyhow::Result<()> {
    let assignments = allocator.assignments();

    if json {
        println!("{}", serde_json::to_string_pretty(&assignments)?);
        return Ok(());
    }

    if assignments.is_empty() {
        out.status("No ports are currently assigned.");
        out.status("Ports are assigned on `devstack run`.");
        return Ok(());
    }

    let width = assignments
        .iter()
        .map(|a| a.service_name.len())
        .max()
        .unwrap_or(0);
    println!("Port assignments ({})", allocator.range());
    for assignment in &assignments {
        let free = if allocator.is_available(assignment.port) {
            "free"
        } else {
            "in use"
        };
        println!(
            "  {:>5}  {:<width$}  {:<6}  last used {}",
            assignment.port,
            assignment.service_name,
            free,
            assignment.last_used.format("%Y-%m-%d %H:%M"),
            width = width
        );
    }
    Ok(())
}

fn release_port(allocator: &PortAllocator, service: &str, out: &dyn UserOutput) -> anyhow::Result<()> {
    match allocator.get_assignment(service) {
        Some(port) => {
            allocator.release_port(service)?;
            out.success(&format!("Released port {} from '{}'", port, service));
        }
        None => out.warning(&format!("'{}' has no assigned port", service)),
    }
    Ok(())
}

fn clean_ports(allocator: &PortAllocator, out: &dyn UserOutput) -> anyhow::Result<()> {
    let removed = allocator.clean_stale_ports()?;
    if removed.is_empty() {
        out.status("No stale port assignments.");
    } else {
        out.success(&format!(
            "Removed {} stale assignment(s): {}",
            removed.len(),
            removed.join(", ")
        ));
    }
    Ok(())
}
