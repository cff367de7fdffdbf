#![allow(unused_assignments)]

//! # devstack
//!
//! Runs a handful of local development services side by side: it assigns
//! each one a port, launches and supervises its process, collects its
//! output and tears everything down cleanly.
//!
//! ## Features
//!
//! - **Port Allocation**: Per-project `service -> port` assignments persisted in
//!   `.devstack/ports.json`, randomized bounded scanning, and conflict
//!   resolution against processes that already hold a port
//! - **Supervision**: One isolated monitoring task per service; a crash or a
//!   panic only affects that service
//! - **Readiness**: HTTP, TCP or process checks polled with exponential backoff
//! - **Graceful Shutdown**: Interrupt-then-kill where the platform supports it,
//!   concurrent shutdown of every service, run exactly once
//! - **Log Aggregation**: A bounded ring buffer per service with live
//!   subscriptions and optional on-disk logs
//!
//! ## Quick Start
//!
//! ```no_run
//! use devstack::port::PortAllocator;
//! use devstack::service::ServiceSpec;
//! use devstack::supervisor::{shutdown_signal, Supervisor};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), devstack::Error> {
//! let allocator = Arc::new(PortAllocator::open(".")?);
//! let web = allocator.assign_port("web", Some(3000), false)?;
//!
//! let supervisor = Supervisor::builder(".").allocator(allocator.clone()).build();
//! supervisor
//!     .start_service(ServiceSpec::shell("web", "npm run dev").with_port(web.port))
//!     .await?;
//!
//! // Supervise until Ctrl-C, then stop everything and release ports.
//! supervisor.run_until_shutdown(shutdown_signal()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency Model
//!
//! - Allocation for one project is serialized by the allocator's lock, which
//!   is released while a conflict prompt waits for input
//! - Supervisor methods take `&self`; every service has its own task
//! - Shutdown runs exactly once even with concurrent calls

pub mod config;
pub mod error;
pub mod healthcheck;
pub mod port;
pub mod service;
pub mod supervisor;

// Re-export commonly used types
pub use config::{HealthCheckConfig, PortRange, SupervisorConfig};
pub use error::{Error, Result};
pub use port::{AllocatorRegistry, PortAllocation, PortAllocator};
pub use service::{LogBuffer, LogEntry, ServiceRuntimeEntry, ServiceSpec, Status};
pub use supervisor::Supervisor;
