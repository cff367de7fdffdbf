//! Port allocation for supervised services.
//!
//! [`PortAllocator`] owns one project's `service -> port` map and persists
//! it through a [`PortStore`]. Conflicts with foreign processes are
//! reported to a pluggable [`ConflictResolver`], and [`AllocatorRegistry`]
//! keeps a bounded set of per-project allocators resident.

pub mod allocator;
pub mod conflict;
pub mod probe;
pub mod prompt;
pub mod registry;
pub mod store;

pub use allocator::{
    PortAllocation, PortAllocator, PortAllocatorBuilder, MAX_PORT_SCAN_ATTEMPTS,
    STALE_ASSIGNMENT_DAYS,
};
pub use conflict::{
    OccupantInspector, ProcessInfo, SystemOccupants, KILL_PROCESS_TIMEOUT, PROCESS_CLEANUP_WAIT,
};
pub use probe::{PortProbe, TcpPortProbe};
pub use prompt::{
    is_interactive, AutoAssignResolver, ConflictAction, ConflictContext, ConflictResolver,
    FixedResolver, TerminalResolver,
};
pub use registry::{normalize_project_path, AllocatorRegistry, DEFAULT_REGISTRY_CAPACITY};
pub use store::{Assignments, JsonFilePortStore, MemoryPortStore, PortAssignment, PortStore};
