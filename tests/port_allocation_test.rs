//! End-to-end port allocation against the real `ports.json` store.
//!
//! Deterministic cases inject a probe; the conflict cases bind real
//! listeners on ephemeral ports.

use devstack::config::PortRange;
use devstack::port::{
    ConflictAction, FixedResolver, MemoryPortStore, OccupantInspector, PortAllocator, PortProbe,
    ProcessInfo,
};
use devstack::Error;
use proptest::prelude::*;
use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::Arc;
use tempfile::TempDir;

/// Helper to create a temp directory for tests
fn create_test_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

/// No process is ever found holding a port.
struct NoOccupants;

impl OccupantInspector for NoOccupants {
    fn find_occupants(&self, _port: u16) -> Vec<ProcessInfo> {
        Vec::new()
    }

    fn terminate(&self, pid: u32) -> devstack::Result<()> {
        panic!("nothing to terminate, got PID {}", pid);
    }
}

fn all_free() -> Arc<dyn PortProbe> {
    Arc::new(|_port: u16| true)
}

fn allocator_with_free_ports(dir: &TempDir) -> PortAllocator {
    PortAllocator::builder(dir.path())
        .range(PortRange::default())
        .probe(all_free())
        .occupants(Arc::new(NoOccupants))
        .resolver(Arc::new(FixedResolver(ConflictAction::Abort)))
        .build()
        .unwrap()
}

fn read_ports_file(dir: &TempDir) -> serde_json::Value {
    let raw = std::fs::read_to_string(dir.path().join(".devstack").join("ports.json"))
        .expect("ports.json should exist");
    serde_json::from_str(&raw).expect("ports.json should be valid JSON")
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn test_fresh_project_gets_preferred_port_and_persists_it() {
    let dir = create_test_dir();
    let allocator = allocator_with_free_ports(&dir);

    let allocation = allocator.assign_port("web", Some(3000), false).unwrap();
    assert_eq!(allocation.port, 3000);
    assert!(!allocation.was_auto_assigned);
    assert_eq!(allocator.get_assignment("web"), Some(3000));

    let json = read_ports_file(&dir);
    assert_eq!(json["web"]["port"], 3000);
    assert_eq!(json["web"]["serviceName"], "web");
    assert!(json["web"]["lastUsed"].is_string());
}

#[test]
fn test_assignment_is_idempotent_while_port_is_free() {
    let dir = create_test_dir();
    let allocator = allocator_with_free_ports(&dir);

    let first = allocator.assign_port("api", None, false).unwrap();
    let second = allocator.assign_port("api", None, false).unwrap();
    assert_eq!(first, second);

    // A different preference does not move an assignment that still works.
    let third = allocator.assign_port("api", Some(4000), false).unwrap();
    assert_eq!(third.port, first.port);
}

#[test]
fn test_released_port_is_immediately_reusable() {
    let dir = create_test_dir();
    let allocator = allocator_with_free_ports(&dir);

    allocator.assign_port("web", Some(3000), false).unwrap();
    allocator.release_port("web").unwrap();
    assert_eq!(allocator.get_assignment("web"), None);

    let other = allocator.assign_port("other", Some(3000), false).unwrap();
    assert_eq!(other.port, 3000);
    let json = read_ports_file(&dir);
    assert!(json.get("web").is_none());
    assert_eq!(json["other"]["port"], 3000);
}

#[test]
fn test_explicit_port_outside_range_is_rejected_without_allocating() {
    let dir = create_test_dir();
    let allocator = allocator_with_free_ports(&dir);

    let err = allocator.assign_port("web", Some(80), true).unwrap_err();
    assert!(
        matches!(err, Error::PortOutOfRange { port: 80, .. }),
        "unexpected error: {}",
        err
    );
    assert_eq!(
        err.to_string(),
        "explicit port 80 for service 'web' is outside valid range 3000-65535"
    );
    assert_eq!(allocator.get_assignment("web"), None);
    assert!(!dir.path().join(".devstack").join("ports.json").exists());
}

#[test]
fn test_empty_service_name_is_rejected() {
    let dir = create_test_dir();
    let allocator = allocator_with_free_ports(&dir);
    let err = allocator.assign_port("", Some(3000), false).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[test]
fn test_assignments_survive_reopening_the_project() {
    let dir = create_test_dir();
    {
        let allocator = allocator_with_free_ports(&dir);
        allocator.assign_port("web", Some(3100), false).unwrap();
        allocator.assign_port("api", Some(3200), false).unwrap();
    }

    let reopened = allocator_with_free_ports(&dir);
    assert_eq!(reopened.get_assignment("web"), Some(3100));
    assert_eq!(reopened.get_assignment("api"), Some(3200));
    let names: Vec<String> = reopened
        .assignments()
        .into_iter()
        .map(|a| a.service_name)
        .collect();
    assert_eq!(names, vec!["api", "web"]);
}

#[test]
fn test_failed_write_is_an_error_and_leaves_no_assignment() {
    let allocator = PortAllocator::builder("/nonexistent/project")
        .range(PortRange::default())
        .store(MemoryPortStore::failing())
        .probe(all_free())
        .occupants(Arc::new(NoOccupants))
        .build()
        .unwrap();

    let err = allocator.assign_port("web", Some(3000), false).unwrap_err();
    assert!(matches!(err, Error::Persistence(_)));
    assert_eq!(allocator.get_assignment("web"), None);
}

#[test]
fn test_concurrent_services_never_share_a_port() {
    let dir = create_test_dir();
    // A narrow range forces the scans to collide if the lock were missing.
    let allocator = Arc::new(
        PortAllocator::builder(dir.path())
            .range(PortRange::new(5000, 5019))
            .probe(all_free())
            .occupants(Arc::new(NoOccupants))
            .build()
            .unwrap(),
    );

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let allocator = allocator.clone();
            std::thread::spawn(move || {
                allocator
                    .assign_port(&format!("svc-{}", i), None, false)
                    .unwrap()
                    .port
            })
        })
        .collect();

    let ports: HashSet<u16> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(ports.len(), 20, "every service must get its own port");
    assert!(ports.iter().all(|p| (5000..=5019).contains(p)));

    let err = allocator.assign_port("one-too-many", None, false).unwrap_err();
    assert!(err.is_retryable_bind());
}

// =============================================================================
// Real sockets
// =============================================================================

fn range_around(port: u16) -> PortRange {
    PortRange::new(port, port.saturating_add(300))
}

#[test]
fn test_explicit_conflict_with_reassign_moves_to_free_port() {
    let dir = create_test_dir();
    let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let held = listener.local_addr().unwrap().port();
    let range = range_around(held);

    let allocator = PortAllocator::builder(dir.path())
        .range(range)
        .occupants(Arc::new(NoOccupants))
        .resolver(Arc::new(FixedResolver(ConflictAction::Reassign)))
        .build()
        .unwrap();

    let allocation = allocator.assign_port("web", Some(held), true).unwrap();
    assert_ne!(allocation.port, held);
    assert!(allocation.was_auto_assigned);
    assert!(range.contains(allocation.port));
    assert_eq!(allocator.get_assignment("web"), Some(allocation.port));
    drop(listener);
}

#[test]
fn test_explicit_conflict_with_abort_is_cancellation() {
    let dir = create_test_dir();
    let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let held = listener.local_addr().unwrap().port();

    let allocator = PortAllocator::builder(dir.path())
        .range(range_around(held))
        .occupants(Arc::new(NoOccupants))
        .resolver(Arc::new(FixedResolver(ConflictAction::Abort)))
        .build()
        .unwrap();

    let err = allocator.assign_port("web", Some(held), true).unwrap_err();
    assert!(err.is_cancellation(), "unexpected error: {}", err);
    assert_eq!(allocator.get_assignment("web"), None);
}

#[test]
fn test_flexible_preference_that_is_taken_falls_back_to_scan() {
    let dir = create_test_dir();
    let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let held = listener.local_addr().unwrap().port();
    let range = range_around(held);

    let allocator = PortAllocator::builder(dir.path())
        .range(range)
        .occupants(Arc::new(NoOccupants))
        .resolver(Arc::new(FixedResolver(ConflictAction::Reassign)))
        .build()
        .unwrap();

    let allocation = allocator.assign_port("api", Some(held), false).unwrap();
    assert_ne!(allocation.port, held);
    assert!(!allocation.was_auto_assigned);
    assert!(range.contains(allocation.port));
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_scanned_ports_stay_inside_range(
        start in 1024u16..60000,
        width in 0u16..2000,
        services in 1usize..8,
    ) {
        let range = PortRange::new(start, start.saturating_add(width));
        let allocator = PortAllocator::builder("/unused")
            .range(range)
            .store(MemoryPortStore::new())
            .probe(all_free())
            .occupants(Arc::new(NoOccupants))
            .build()
            .unwrap();

        let mut seen = HashSet::new();
        for i in 0..services.min(range.len()) {
            let allocation = allocator.assign_port(&format!("s{}", i), None, false).unwrap();
            prop_assert!(range.contains(allocation.port));
            prop_assert!(seen.insert(allocation.port), "port handed out twice");
        }
    }
}
