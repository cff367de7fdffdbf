//! Runtime configuration read from the environment.
//!
//! Nothing here parses project files; the driver builds [`ServiceSpec`]s
//! itself and these types only carry the knobs that tune allocation,
//! health checking and shutdown.
//!
//! [`ServiceSpec`]: crate::service::ServiceSpec

mod duration;
mod health;
mod ports;
mod supervisor;

pub use duration::parse_duration_string;
pub use health::{HealthCheckConfig, HealthCheckKind};
pub use ports::{
    PortRange, DEFAULT_PORT_RANGE_END, DEFAULT_PORT_RANGE_START, PORT_RANGE_END_ENV,
    PORT_RANGE_START_ENV,
};
pub use supervisor::SupervisorConfig;

pub(crate) use duration::duration_override;

use std::path::{Path, PathBuf};

/// Name of the project-local state directory.
pub const STATE_DIR_NAME: &str = ".devstack";

/// Env var that forces non-interactive conflict resolution.
pub const NON_INTERACTIVE_ENV: &str = "DEVSTACK_NON_INTERACTIVE";

/// `<project>/.devstack`
pub fn state_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(STATE_DIR_NAME)
}

/// `<project>/.devstack/logs`
pub fn log_dir(project_dir: &Path) -> PathBuf {
    state_dir(project_dir).join("logs")
}

/// Environment lookup used by the `from_env` constructors.
pub(crate) fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Create the state directory with owner-only permissions on unix.
pub(crate) fn ensure_state_dir(project_dir: &Path) -> std::io::Result<PathBuf> {
    let dir = state_dir(project_dir);
    create_private_dir(&dir)?;
    Ok(dir)
}

pub(crate) fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
    }
    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(dir)
    }
}
