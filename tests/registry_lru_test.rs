//! Allocator registry eviction at the default capacity.

use devstack::port::{AllocatorRegistry, AutoAssignResolver, DEFAULT_REGISTRY_CAPACITY};
use devstack::PortRange;
use std::sync::Arc;
use tempfile::TempDir;

fn project_dirs(count: usize) -> Vec<TempDir> {
    (0..count)
        .map(|_| tempfile::tempdir().expect("Failed to create temp dir"))
        .collect()
}

fn registry() -> AllocatorRegistry {
    AllocatorRegistry::new(PortRange::new(3000, 3999), Arc::new(AutoAssignResolver))
}

#[test]
fn test_fifty_five_projects_keep_the_last_fifty() {
    let dirs = project_dirs(55);
    let reg = registry();
    for dir in &dirs {
        reg.allocator_for(dir.path()).unwrap();
    }

    assert_eq!(DEFAULT_REGISTRY_CAPACITY, 50);
    assert_eq!(reg.len(), 50);
    for (i, dir) in dirs.iter().enumerate() {
        assert_eq!(reg.contains(dir.path()), i >= 5, "project {}", i);
    }
}

#[test]
fn test_access_refreshes_recency() {
    let dirs = project_dirs(51);
    let reg = registry();
    for dir in &dirs[..50] {
        reg.allocator_for(dir.path()).unwrap();
    }

    // Project 0 was inserted first but used most recently.
    reg.allocator_for(dirs[0].path()).unwrap();
    reg.allocator_for(dirs[50].path()).unwrap();

    assert_eq!(reg.len(), 50);
    assert!(reg.contains(dirs[0].path()));
    assert!(!reg.contains(dirs[1].path()));
    assert!(reg.contains(dirs[50].path()));
}

#[test]
fn test_evicted_project_reloads_its_assignments() {
    let dirs = project_dirs(3);
    let reg = registry().with_capacity(1);

    let first = reg.allocator_for(dirs[0].path()).unwrap();
    let port = first.assign_port("web", None, false).unwrap().port;
    drop(first);

    reg.allocator_for(dirs[1].path()).unwrap();
    assert!(!reg.contains(dirs[0].path()));

    let reloaded = reg.allocator_for(dirs[0].path()).unwrap();
    assert_eq!(reloaded.get_assignment("web"), Some(port));
}
