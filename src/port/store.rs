use crate::config;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const PORTS_FILE_NAME: &str = "ports.json";
const LOCK_FILE_NAME: &str = "ports.lock";

/// A port owned by one service of one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortAssignment {
    pub service_name: String,
    pub port: u16,
    pub last_used: DateTime<Utc>,
}

impl PortAssignment {
    pub fn new(service_name: impl Into<String>, port: u16) -> Self {
        Self {
            service_name: service_name.into(),
            port,
            last_used: Utc::now(),
        }
    }
}

/// Assignments keyed by service name.
pub type Assignments = HashMap<String, PortAssignment>;

/// Storage backend for a project's port assignments.
///
/// The allocator always hands over the complete mapping, so a backend only
/// has to replace its contents wholesale.
///
/// # Implementations
///
/// - [`JsonFilePortStore`] - `<project>/.devstack/ports.json`, atomic replace
/// - [`MemoryPortStore`] - in-process only, for tests and throwaway projects
pub trait PortStore: Send + Sync {
    fn load(&self) -> Result<Assignments>;

    fn save(&self, assignments: &Assignments) -> Result<()>;
}

/// Port store backed by `ports.json` in the project's state directory.
pub struct JsonFilePortStore {
    project_dir: PathBuf,
}

impl JsonFilePortStore {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
        }
    }

    pub fn path(&self) -> PathBuf {
        config::state_dir(&self.project_dir).join(PORTS_FILE_NAME)
    }

    /// Write to a sibling temp file, sync it, then rename over the target so
    /// readers only ever see a complete file.
    fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
        let temp_path = path.with_extension("json.tmp");

        let write_temp = || -> std::io::Result<()> {
            let mut file = open_private(&temp_path)?;
            file.write_all(contents)?;
            file.sync_all()
        };
        if let Err(e) = write_temp() {
            let _ = fs::remove_file(&temp_path);
            return Err(Error::Persistence(format!(
                "failed to write {}: {}",
                temp_path.display(),
                e
            )));
        }

        if let Err(e) = fs::rename(&temp_path, path) {
            let _ = fs::remove_file(&temp_path);
            return Err(Error::Persistence(format!(
                "failed to replace {}: {}",
                path.display(),
                e
            )));
        }
        Ok(())
    }
}

impl PortStore for JsonFilePortStore {
    fn load(&self) -> Result<Assignments> {
        let path = self.path();
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Assignments::new()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<Assignments>(&data) {
            Ok(assignments) => Ok(assignments),
            Err(e) => {
                tracing::warn!(
                    "Ignoring unreadable port assignments in {}: {}",
                    path.display(),
                    e
                );
                Ok(Assignments::new())
            }
        }
    }

    fn save(&self, assignments: &Assignments) -> Result<()> {
        use fs2::FileExt;

        let dir = config::ensure_state_dir(&self.project_dir).map_err(|e| {
            Error::Persistence(format!(
                "failed to create {}: {}",
                config::state_dir(&self.project_dir).display(),
                e
            ))
        })?;

        // Serialize writers from other devstack processes on the same project.
        let lock_file = open_private(&dir.join(LOCK_FILE_NAME))
            .map_err(|e| Error::Persistence(format!("failed to open lock file: {}", e)))?;
        FileExt::lock_exclusive(&lock_file)
            .map_err(|e| Error::Persistence(format!("failed to lock ports file: {}", e)))?;

        let json = serde_json::to_vec_pretty(assignments)?;
        let result = Self::atomic_write(&dir.join(PORTS_FILE_NAME), &json);

        let _ = FileExt::unlock(&lock_file);
        result
    }
}

fn open_private(path: &Path) -> std::io::Result<fs::File> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

/// Keeps assignments in memory only.
#[derive(Default)]
pub struct MemoryPortStore {
    saved: Mutex<Assignments>,
    fail_writes: bool,
}

impl MemoryPortStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose writes always fail, for exercising persistence errors.
    pub fn failing() -> Self {
        Self {
            saved: Mutex::new(Assignments::new()),
            fail_writes: true,
        }
    }

    pub fn with_assignments(assignments: Assignments) -> Self {
        Self {
            saved: Mutex::new(assignments),
            fail_writes: false,
        }
    }

    pub fn snapshot(&self) -> Assignments {
        self.saved.lock().clone()
    }
}

impl PortStore for MemoryPortStore {
    fn load(&self) -> Result<Assignments> {
        Ok(self.saved.lock().clone())
    }

    fn save(&self, assignments: &Assignments) -> Result<()> {
        if self.fail_writes {
            return Err(Error::Persistence("writes disabled".to_string()));
        }
        *self.saved.lock() = assignments.clone();
        Ok(())
    }
}
