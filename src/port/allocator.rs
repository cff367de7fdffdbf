//! Per-project port allocation.
//!
//! # Locking
//!
//! One `parking_lot::Mutex` guards the in-memory assignment map, and every
//! mutation (including the write-through to the [`PortStore`]) happens while
//! holding it. The lock is dropped before consulting the
//! [`ConflictResolver`] or terminating an occupant, and re-acquired
//! afterwards. State may change in between, so anything read before the
//! prompt is re-read after it.
//!
//! # Availability is advisory
//!
//! A port reported free here can be taken by another process before the
//! service binds it. Callers that hit a bind failure later should release
//! and allocate again ([`Error::is_retryable_bind`]).

use super::{
    Assignments, ConflictAction, ConflictContext, ConflictResolver, JsonFilePortStore,
    OccupantInspector, PortAssignment, PortProbe, PortStore, SystemOccupants, TcpPortProbe,
    TerminalResolver,
};
use crate::config::PortRange;
use crate::error::{Error, Result};
use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use rand::Rng;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Most ports probed by one scan.
pub const MAX_PORT_SCAN_ATTEMPTS: usize = 100;

/// Assignments unused for this many days are dropped by
/// [`PortAllocator::clean_stale_ports`].
pub const STALE_ASSIGNMENT_DAYS: i64 = 7;

/// Result of [`PortAllocator::assign_port`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAllocation {
    pub port: u16,
    /// An explicit port was replaced by a scanned one. The caller may offer
    /// to write the new value back to project configuration.
    pub was_auto_assigned: bool,
}

impl PortAllocation {
    fn kept(port: u16) -> Self {
        Self {
            port,
            was_auto_assigned: false,
        }
    }
}

/// Tracks which port belongs to which service within one project.
pub struct PortAllocator {
    project_dir: PathBuf,
    range: PortRange,
    assignments: Mutex<Assignments>,
    store: Box<dyn PortStore>,
    probe: Arc<dyn PortProbe>,
    occupants: Arc<dyn OccupantInspector>,
    resolver: Arc<dyn ConflictResolver>,
}

/// Builder for [`PortAllocator`]; every collaborator has a production
/// default.
pub struct PortAllocatorBuilder {
    project_dir: PathBuf,
    range: Option<PortRange>,
    store: Option<Box<dyn PortStore>>,
    probe: Arc<dyn PortProbe>,
    occupants: Arc<dyn OccupantInspector>,
    resolver: Arc<dyn ConflictResolver>,
}

impl PortAllocatorBuilder {
    pub fn range(mut self, range: PortRange) -> Self {
        self.range = Some(range);
        self
    }

    pub fn store(mut self, store: impl PortStore + 'static) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    pub fn probe(mut self, probe: Arc<dyn PortProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn occupants(mut self, occupants: Arc<dyn OccupantInspector>) -> Self {
        self.occupants = occupants;
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Load persisted assignments and build the allocator.
    pub fn build(self) -> Result<PortAllocator> {
        let store = self
            .store
            .unwrap_or_else(|| Box::new(JsonFilePortStore::new(&self.project_dir)));
        let assignments = store.load()?;
        let range = self.range.unwrap_or_else(PortRange::from_env);
        tracing::debug!(
            "Loaded {} port assignment(s) for {} (range {})",
            assignments.len(),
            self.project_dir.display(),
            range
        );
        Ok(PortAllocator {
            project_dir: self.project_dir,
            range,
            assignments: Mutex::new(assignments),
            store,
            probe: self.probe,
            occupants: self.occupants,
            resolver: self.resolver,
        })
    }
}

impl PortAllocator {
    pub fn builder(project_dir: impl Into<PathBuf>) -> PortAllocatorBuilder {
        PortAllocatorBuilder {
            project_dir: project_dir.into(),
            range: None,
            store: None,
            probe: Arc::new(TcpPortProbe),
            occupants: Arc::new(SystemOccupants),
            resolver: Arc::new(TerminalResolver),
        }
    }

    /// Allocator with production defaults for `project_dir`.
    pub fn open(project_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::builder(project_dir).build()
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Assign a port to `service`.
    ///
    /// With `explicit` the preferred port is mandatory: it must be inside the
    /// configured range, and if something else holds it the resolver decides
    /// between killing the holder, moving to a scanned port (reported through
    /// [`PortAllocation::was_auto_assigned`]) or aborting.
    ///
    /// Without `explicit` the preference is only a hint. A prior assignment
    /// that is still free wins, then the preferred port, then a scan.
    pub fn assign_port(
        &self,
        service: &str,
        preferred: Option<u16>,
        explicit: bool,
    ) -> Result<PortAllocation> {
        if service.trim().is_empty() {
            return Err(Error::Validation("service name cannot be empty".to_string()));
        }

        if explicit {
            let port = match preferred {
                Some(port) if port != 0 => port,
                _ => {
                    return Err(Error::Validation(
                        "explicit port must be between 1-65535".to_string(),
                    ))
                }
            };
            if !self.range.contains(port) {
                return Err(Error::PortOutOfRange {
                    service: service.to_string(),
                    port,
                    start: self.range.start,
                    end: self.range.end,
                });
            }
            self.assign_explicit(service, port)
        } else {
            self.assign_flexible(service, preferred)
        }
    }

    fn assign_explicit(&self, service: &str, port: u16) -> Result<PortAllocation> {
        {
            let mut guard = self.assignments.lock();
            self.ensure_unowned(&guard, port, service)?;
            if self.probe.is_available(port) {
                self.commit(&mut guard, service, port)?;
                tracing::debug!("Assigned explicit port {} to '{}'", port, service);
                return Ok(PortAllocation::kept(port));
            }
        }

        match self.ask(service, port, true)? {
            ConflictAction::KillAndRetry => {
                self.free_port(port)?;
                let mut guard = self.assignments.lock();
                self.ensure_unowned(&guard, port, service)?;
                self.commit(&mut guard, service, port)?;
                Ok(PortAllocation::kept(port))
            }
            ConflictAction::Reassign => {
                let mut guard = self.assignments.lock();
                let port = self.scan(&guard, service)?;
                self.commit(&mut guard, service, port)?;
                tracing::info!(
                    "Service '{}' auto-assigned port {} instead of its configured port",
                    service,
                    port
                );
                Ok(PortAllocation {
                    port,
                    was_auto_assigned: true,
                })
            }
            ConflictAction::Abort => Err(Error::Cancelled(service.to_string())),
        }
    }

    fn assign_flexible(&self, service: &str, preferred: Option<u16>) -> Result<PortAllocation> {
        let mut guard = self.assignments.lock();

        if let Some(existing) = guard.get(service).map(|a| a.port) {
            if self.probe.is_available(existing) {
                self.commit(&mut guard, service, existing)?;
                tracing::debug!("Reusing port {} for '{}'", existing, service);
                return Ok(PortAllocation::kept(existing));
            }
            drop(guard);

            let action = self.ask(service, existing, false)?;
            guard = self.assignments.lock();
            match action {
                ConflictAction::KillAndRetry => {
                    drop(guard);
                    let freed = self.free_port_lenient(existing);
                    guard = self.assignments.lock();
                    if freed && self.ensure_unowned(&guard, existing, service).is_ok() {
                        self.commit(&mut guard, service, existing)?;
                        return Ok(PortAllocation::kept(existing));
                    }
                }
                ConflictAction::Reassign => {}
                ConflictAction::Abort => return Err(Error::Cancelled(service.to_string())),
            }
        } else if let Some(port) = preferred.filter(|p| *p != 0 && self.range.contains(*p)) {
            if self.owner_of(&guard, port, service).is_none() {
                if self.probe.is_available(port) {
                    self.commit(&mut guard, service, port)?;
                    return Ok(PortAllocation::kept(port));
                }
                drop(guard);

                let action = self.ask(service, port, false)?;
                match action {
                    ConflictAction::KillAndRetry => {
                        let freed = self.free_port_lenient(port);
                        guard = self.assignments.lock();
                        if freed && self.ensure_unowned(&guard, port, service).is_ok() {
                            self.commit(&mut guard, service, port)?;
                            return Ok(PortAllocation::kept(port));
                        }
                    }
                    ConflictAction::Reassign => guard = self.assignments.lock(),
                    ConflictAction::Abort => return Err(Error::Cancelled(service.to_string())),
                }
            } else {
                tracing::debug!(
                    "Preferred port {} for '{}' belongs to another service, scanning",
                    port,
                    service
                );
            }
        }

        let port = self.scan(&guard, service)?;
        self.commit(&mut guard, service, port)?;
        tracing::debug!("Assigned port {} to '{}'", port, service);
        Ok(PortAllocation::kept(port))
    }

    /// Forget the assignment for `service`. Unknown services are a no-op.
    pub fn release_port(&self, service: &str) -> Result<()> {
        let mut guard = self.assignments.lock();
        let Some(previous) = guard.remove(service) else {
            return Ok(());
        };
        if let Err(e) = self.store.save(&guard) {
            guard.insert(service.to_string(), previous);
            return Err(e);
        }
        tracing::debug!("Released port {} from '{}'", previous.port, service);
        Ok(())
    }

    pub fn get_assignment(&self, service: &str) -> Option<u16> {
        self.assignments.lock().get(service).map(|a| a.port)
    }

    /// Whether `port` can be bound right now. Advisory only.
    pub fn is_available(&self, port: u16) -> bool {
        self.probe.is_available(port)
    }

    /// Drop assignments unused for more than [`STALE_ASSIGNMENT_DAYS`] and
    /// return the affected service names.
    pub fn clean_stale_ports(&self) -> Result<Vec<String>> {
        let cutoff = Utc::now() - chrono::Duration::days(STALE_ASSIGNMENT_DAYS);
        let mut guard = self.assignments.lock();

        let stale: Vec<String> = guard
            .values()
            .filter(|a| a.last_used < cutoff)
            .map(|a| a.service_name.clone())
            .collect();
        if stale.is_empty() {
            return Ok(stale);
        }

        let before = guard.clone();
        for name in &stale {
            guard.remove(name);
        }
        if let Err(e) = self.store.save(&guard) {
            *guard = before;
            return Err(e);
        }
        tracing::info!("Removed {} stale port assignment(s)", stale.len());
        Ok(stale)
    }

    /// All assignments, sorted by service name.
    pub fn assignments(&self) -> Vec<PortAssignment> {
        let mut all: Vec<PortAssignment> = self.assignments.lock().values().cloned().collect();
        all.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        all
    }

    /// Record `service -> port`, refresh its timestamp and write through.
    /// The in-memory map is rolled back if the write fails.
    fn commit(&self, guard: &mut MutexGuard<'_, Assignments>, service: &str, port: u16) -> Result<()> {
        let previous = guard.insert(service.to_string(), PortAssignment::new(service, port));
        if let Err(e) = self.store.save(guard) {
            match previous {
                Some(previous) => guard.insert(service.to_string(), previous),
                None => guard.remove(service),
            };
            tracing::error!("Failed to persist port {} for '{}': {}", port, service, e);
            return Err(e);
        }
        Ok(())
    }

    fn owner_of<'a>(&self, assignments: &'a Assignments, port: u16, service: &str) -> Option<&'a str> {
        assignments
            .values()
            .find(|a| a.port == port && a.service_name != service)
            .map(|a| a.service_name.as_str())
    }

    fn ensure_unowned(&self, assignments: &Assignments, port: u16, service: &str) -> Result<()> {
        match self.owner_of(assignments, port, service) {
            Some(owner) => Err(Error::PortAlreadyAssigned {
                port,
                owner: owner.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Randomized bounded scan: start at a random offset in the range and
    /// probe at most [`MAX_PORT_SCAN_ATTEMPTS`] ports, wrapping at the end.
    fn scan(&self, assignments: &Assignments, service: &str) -> Result<u16> {
        self.range.validate()?;
        let size = self.range.len();
        let attempts = MAX_PORT_SCAN_ATTEMPTS.min(size);

        let taken: HashSet<u16> = assignments
            .values()
            .filter(|a| a.service_name != service)
            .map(|a| a.port)
            .collect();

        let offset = rand::thread_rng().gen_range(0..size);
        for i in 0..attempts {
            let port = self.range.start + ((offset + i) % size) as u16;
            if taken.contains(&port) {
                continue;
            }
            if self.probe.is_available(port) {
                return Ok(port);
            }
        }

        Err(Error::PortExhausted {
            attempts,
            start: self.range.start,
            end: self.range.end,
        })
    }

    /// Consult the resolver. Must be called without the lock held.
    fn ask(&self, service: &str, port: u16, explicit: bool) -> Result<ConflictAction> {
        let occupant = self.occupants.find_occupant(port);
        match &occupant {
            Some(p) => tracing::warn!("Port {} for '{}' is held by {}", port, service, p),
            None => tracing::warn!("Port {} for '{}' is in use", port, service),
        }
        self.resolver.resolve(&ConflictContext {
            service: service.to_string(),
            port,
            explicit,
            occupant,
        })
    }

    /// Terminate everything listening on `port`, wait for it to settle and
    /// verify the port is free. A port that stays busy is a hard error.
    fn free_port(&self, port: u16) -> Result<()> {
        let occupants = self.occupants.find_occupants(port);
        if occupants.is_empty() {
            return Err(Error::PortConflict {
                port,
                pid: None,
                process_name: None,
            });
        }
        for occupant in &occupants {
            tracing::info!("Terminating {} to free port {}", occupant, port);
            self.occupants.terminate(occupant.pid)?;
        }
        std::thread::sleep(self.occupants.settle_delay());

        if !self.probe.is_available(port) {
            return Err(Error::PortStillInUse(port));
        }
        Ok(())
    }

    fn free_port_lenient(&self, port: u16) -> bool {
        match self.free_port(port) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Could not free port {}: {}. Choosing another port", port, e);
                false
            }
        }
    }
}
