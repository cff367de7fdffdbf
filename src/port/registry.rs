use super::{
    ConflictResolver, OccupantInspector, PortAllocator, PortProbe, SystemOccupants, TcpPortProbe,
    TerminalResolver,
};
use crate::config::PortRange;
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Most projects kept resident at once.
pub const DEFAULT_REGISTRY_CAPACITY: usize = 50;

struct CacheEntry {
    allocator: Arc<PortAllocator>,
    last_access: u64,
}

/// Project-path keyed cache of [`PortAllocator`]s with LRU eviction.
///
/// Owned by the process root and passed to whoever needs allocators. The
/// cache lock is separate from each allocator's own lock, so a slow
/// allocation in one project never blocks lookups for another.
pub struct AllocatorRegistry {
    entries: Mutex<HashMap<PathBuf, CacheEntry>>,
    capacity: usize,
    clock: AtomicU64,
    range: PortRange,
    probe: Arc<dyn PortProbe>,
    occupants: Arc<dyn OccupantInspector>,
    resolver: Arc<dyn ConflictResolver>,
}

impl Default for AllocatorRegistry {
    fn default() -> Self {
        Self::new(PortRange::from_env(), Arc::new(TerminalResolver))
    }
}

impl AllocatorRegistry {
    pub fn new(range: PortRange, resolver: Arc<dyn ConflictResolver>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: DEFAULT_REGISTRY_CAPACITY,
            clock: AtomicU64::new(0),
            range,
            probe: Arc::new(TcpPortProbe),
            occupants: Arc::new(SystemOccupants),
            resolver,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn PortProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_occupants(mut self, occupants: Arc<dyn OccupantInspector>) -> Self {
        self.occupants = occupants;
        self
    }

    /// The allocator for `project_dir`, loading it on first use.
    pub fn allocator_for(&self, project_dir: &Path) -> Result<Arc<PortAllocator>> {
        let key = normalize_project_path(project_dir)?;
        let mut entries = self.entries.lock();
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);
        if let Some(entry) = entries.get_mut(&key) {
            entry.last_access = tick;
            return Ok(entry.allocator.clone());
        }

        if entries.len() >= self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(path, _)| path.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
                tracing::debug!("Evicted port allocator for {}", oldest.display());
            }
        }

        let allocator = Arc::new(
            PortAllocator::builder(key.clone())
                .range(self.range)
                .probe(self.probe.clone())
                .occupants(self.occupants.clone())
                .resolver(self.resolver.clone())
                .build()?,
        );
        entries.insert(
            key,
            CacheEntry {
                allocator: allocator.clone(),
                last_access: tick,
            },
        );
        Ok(allocator)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, project_dir: &Path) -> bool {
        normalize_project_path(project_dir)
            .map(|key| self.entries.lock().contains_key(&key))
            .unwrap_or(false)
    }

    /// Drop a cached allocator. Outstanding `Arc`s stay usable.
    pub fn remove(&self, project_dir: &Path) -> bool {
        normalize_project_path(project_dir)
            .map(|key| self.entries.lock().remove(&key).is_some())
            .unwrap_or(false)
    }
}

/// Absolute, canonical where the path exists, and case-folded on platforms
/// whose default filesystems ignore case.
pub fn normalize_project_path(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let resolved = absolute.canonicalize().unwrap_or(absolute);

    if cfg!(any(windows, target_os = "macos")) {
        Ok(PathBuf::from(resolved.to_string_lossy().to_lowercase()))
    } else {
        Ok(resolved)
    }
}
