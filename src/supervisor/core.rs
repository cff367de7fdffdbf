use super::monitoring::{Monitor, SharedEntry};
use crate::config::SupervisorConfig;
use crate::error::{Error, Result};
use crate::healthcheck::{self, HealthChecker};
use crate::port::PortAllocator;
use crate::service::{
    self, platform_terminator, Health, LogBuffer, LogCapture, LogManager, ProcessHandle,
    ServiceRuntimeEntry, ServiceSpec, Status, Terminator,
};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// One supervised service: its launch spec, shared runtime entry, and the
/// handles of its current process (if it was ever started).
struct ManagedService {
    spec: ServiceSpec,
    entry: SharedEntry,
    process: Option<ProcessHandle>,
    capture: Option<Arc<LogCapture>>,
}

/// Starts, monitors and stops the services of one project.
///
/// # Concurrency Model
///
/// - All methods take `&self`; share the supervisor behind an `Arc`.
/// - Each started service is watched by its own task in a [`JoinSet`].
///   A task that panics or whose process dies only changes that service's
///   entry.
/// - The `services` map lock is never held across an `.await`; the
///   per-service entry is a separate `Arc<Mutex<_>>` shared with the
///   monitoring task.
///
/// # Example
///
/// ```no_run
/// use devstack::service::ServiceSpec;
/// use devstack::supervisor::{shutdown_signal, Supervisor};
///
/// # async fn example() -> devstack::Result<()> {
/// let supervisor = Supervisor::builder(".").build();
/// supervisor.start_service(ServiceSpec::shell("web", "npm run dev").with_port(3000)).await?;
///
/// // Runs until Ctrl-C / SIGTERM, then stops everything.
/// supervisor.run_until_shutdown(shutdown_signal()).await?;
/// # Ok(())
/// # }
/// ```
pub struct Supervisor {
    project_dir: PathBuf,
    pub(super) config: SupervisorConfig,
    services: RwLock<HashMap<String, ManagedService>>,
    logs: LogManager,
    allocator: Option<Arc<PortAllocator>>,
    terminator: Arc<dyn Terminator>,
    pub(super) monitors: Mutex<JoinSet<()>>,
    pub(super) cancellation_token: CancellationToken,
    /// Guard to ensure shutdown runs exactly once
    pub(super) shutdown_started: AtomicBool,
}

pub struct SupervisorBuilder {
    project_dir: PathBuf,
    config: SupervisorConfig,
    allocator: Option<Arc<PortAllocator>>,
    terminator: Option<Arc<dyn Terminator>>,
}

impl SupervisorBuilder {
    pub fn config(mut self, config: SupervisorConfig) -> Self {
        self.config = config;
        self
    }

    /// Ports are released through `allocator` when services stop.
    pub fn allocator(mut self, allocator: Arc<PortAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    pub fn terminator(mut self, terminator: Arc<dyn Terminator>) -> Self {
        self.terminator = Some(terminator);
        self
    }

    pub fn build(self) -> Supervisor {
        let terminator = self.terminator.unwrap_or_else(platform_terminator);
        tracing::debug!(
            "Supervisor for {} using {} termination",
            self.project_dir.display(),
            terminator.name()
        );
        Supervisor {
            logs: LogManager::new(self.project_dir.clone()),
            project_dir: self.project_dir,
            config: self.config,
            services: RwLock::new(HashMap::new()),
            allocator: self.allocator,
            terminator,
            monitors: Mutex::new(JoinSet::new()),
            cancellation_token: CancellationToken::new(),
            shutdown_started: AtomicBool::new(false),
        }
    }
}

impl Supervisor {
    pub fn builder(project_dir: impl Into<PathBuf>) -> SupervisorBuilder {
        SupervisorBuilder {
            project_dir: project_dir.into(),
            config: SupervisorConfig::default(),
            allocator: None,
            terminator: None,
        }
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Start `spec` using the health check its config asks for.
    ///
    /// Returns once the process is spawned; readiness is tracked by the
    /// service's monitoring task and shows up in [`entry`](Self::entry).
    pub async fn start_service(&self, spec: ServiceSpec) -> Result<()> {
        self.start(spec, None)
    }

    /// Start `spec` with a caller-provided readiness probe.
    pub async fn start_service_with_checker(
        &self,
        spec: ServiceSpec,
        checker: Box<dyn HealthChecker>,
    ) -> Result<()> {
        self.start(spec, Some(checker))
    }

    fn start(&self, spec: ServiceSpec, checker: Option<Box<dyn HealthChecker>>) -> Result<()> {
        if spec.name.trim().is_empty() {
            return Err(Error::Validation("service name cannot be empty".to_string()));
        }
        if self.cancellation_token.is_cancelled() {
            return Err(Error::Cancelled(spec.name));
        }

        let name = spec.name.clone();
        // Held until the process handle is stored, so a concurrent stop
        // never sees a `Starting` entry without its process.
        let mut services = self.services.write();
        let entry = Self::claim_entry(&mut services, &spec)?;

        let buffer = self
            .logs
            .create_buffer(&name, self.config.log_capacity, self.config.file_logging);
        let capture = Arc::new(LogCapture::new(&name, buffer));

        let (handle, driver) = match service::process::spawn(&spec, &capture) {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::error!("{}", e);
                entry.lock().fail(e.to_string());
                return Err(e);
            }
        };

        let checker = match checker {
            Some(checker) => Some(checker),
            None => match healthcheck::checker_for(&spec, &handle) {
                Ok(checker) => checker,
                Err(e) => {
                    // Dropping the driver kills the child.
                    drop(driver);
                    entry.lock().fail(e.to_string());
                    return Err(e);
                }
            },
        };

        {
            let mut entry = entry.lock();
            entry.pid = handle.pid();
            entry.start_time = Some(Utc::now());
        }

        if let Some(service) = services.get_mut(&name) {
            service.process = Some(handle);
            service.capture = Some(capture);
        }

        let monitor = Monitor {
            name: name.clone(),
            entry: entry.clone(),
            driver,
            checker,
            health: spec.health.clone(),
        };
        self.monitors.lock().spawn(monitor.run());
        Ok(())
    }

    /// Register or reuse the entry for `spec` and move it to `Starting`.
    fn claim_entry(
        services: &mut HashMap<String, ManagedService>,
        spec: &ServiceSpec,
    ) -> Result<SharedEntry> {
        let mut entry = ServiceRuntimeEntry::new(spec);
        entry.transition(Status::Starting);
        let entry = Arc::new(Mutex::new(entry));

        if let Some(existing) = services.get_mut(&spec.name) {
            let status = existing.entry.lock().status;
            if !matches!(status, Status::Stopped | Status::Error) {
                return Err(Error::ServiceAlreadyRunning(spec.name.clone()));
            }
            // An errored service may still have a live process; it has to be
            // stopped before it can be started again.
            if existing.process.as_ref().is_some_and(|p| !p.has_exited()) {
                return Err(Error::ServiceAlreadyRunning(spec.name.clone()));
            }
            // Fresh entry per run: the previous run's monitor keeps its own.
            existing.entry = entry.clone();
            existing.spec = spec.clone();
            existing.process = None;
            existing.capture = None;
            return Ok(entry);
        }

        services.insert(
            spec.name.clone(),
            ManagedService {
                spec: spec.clone(),
                entry: entry.clone(),
                process: None,
                capture: None,
            },
        );
        Ok(entry)
    }

    /// Stop one service: graceful-then-forceful (per platform), drain its
    /// output, mark it `Stopped` and release its port.
    ///
    /// Stopping a service that is already stopped (or being stopped) is a
    /// no-op.
    pub async fn stop_service(&self, name: &str) -> Result<()> {
        let (entry, process, capture, port) = {
            let services = self.services.read();
            let service = services
                .get(name)
                .ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;
            (
                service.entry.clone(),
                service.process.clone(),
                service.capture.clone(),
                service.spec.port,
            )
        };

        {
            let mut entry = entry.lock();
            if matches!(entry.status, Status::Stopped | Status::Stopping) {
                tracing::debug!("Service '{}' already {}, nothing to stop", name, entry.status);
                return Ok(());
            }
            entry.transition(Status::Stopping);
        }
        tracing::info!("Stopping service '{}'", name);

        let terminated = match &process {
            Some(process) => {
                self.terminator
                    .terminate(process, self.config.shutdown_timeout)
                    .await
            }
            None => Ok(()),
        };

        if let Some(capture) = &capture {
            capture.finish().await;
            capture.buffer().close();
        }

        {
            let mut entry = entry.lock();
            if let Err(e) = &terminated {
                tracing::error!("{}", e);
                entry.fail(e.to_string());
            } else {
                entry.transition(Status::Stopped);
                entry.health = Health::Unknown;
                entry.pid = None;
            }
        }
        terminated?;

        if port.is_some() && self.config.release_ports_on_stop {
            self.release_port(name).await?;
        }
        tracing::info!("Service '{}' stopped", name);
        Ok(())
    }

    async fn release_port(&self, name: &str) -> Result<()> {
        let Some(allocator) = self.allocator.clone() else {
            return Ok(());
        };
        let service = name.to_string();
        tokio::task::spawn_blocking(move || allocator.release_port(&service))
            .await
            .map_err(|e| Error::Persistence(format!("port release task failed: {}", e)))?
    }

    /// Stop every service concurrently. Every stop runs to completion; the
    /// errors are collected rather than short-circuiting.
    pub async fn stop_all(&self) -> Result<()> {
        let names: Vec<String> = self.services.read().keys().cloned().collect();
        let stops = names.iter().map(|name| self.stop_service(name));
        let results = futures::future::join_all(stops).await;

        let mut errors: Vec<Error> = results.into_iter().filter_map(|r| r.err()).collect();
        self.logs.close_all();
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Multiple(errors)),
        }
    }

    /// Read-only view of every service, sorted by name.
    pub fn snapshot(&self) -> Vec<ServiceRuntimeEntry> {
        let mut entries: Vec<ServiceRuntimeEntry> = self
            .services
            .read()
            .values()
            .map(|s| s.entry.lock().clone())
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    pub fn entry(&self, name: &str) -> Option<ServiceRuntimeEntry> {
        self.services.read().get(name).map(|s| s.entry.lock().clone())
    }

    pub fn status(&self, name: &str) -> Option<Status> {
        self.services.read().get(name).map(|s| s.entry.lock().status)
    }

    /// The log buffer of `name`'s most recent run.
    pub fn logs(&self, name: &str) -> Option<Arc<LogBuffer>> {
        self.logs.get(name)
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Ask [`run_until_shutdown`](Self::run_until_shutdown) to return.
    pub fn cancel(&self) {
        self.cancellation_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("project_dir", &self.project_dir)
            .field("config", &self.config)
            .field("terminator", &self.terminator.name())
            .field("services", &self.service_names())
            .field("is_cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::HealthCheckConfig;
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    fn supervisor(dir: &TempDir) -> Supervisor {
        let config = SupervisorConfig {
            shutdown_timeout: Duration::from_secs(2),
            ..SupervisorConfig::default()
        };
        Supervisor::builder(dir.path()).config(config).build()
    }

    async fn wait_for_status(sup: &Supervisor, name: &str, status: Status) {
        for _ in 0..200 {
            if sup.status(name) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!(
            "'{}' never reached {}; entry: {:?}",
            name,
            status,
            sup.entry(name)
        );
    }

    #[tokio::test]
    async fn process_check_makes_service_ready() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        let spec = ServiceSpec::shell("web", "echo up; sleep 30").with_health(HealthCheckConfig::process());
        sup.start_service(spec).await.unwrap();
        wait_for_status(&sup, "web", Status::Ready).await;

        let entry = sup.entry("web").unwrap();
        assert_eq!(entry.health, Health::Healthy);
        assert!(entry.pid.is_some());
        assert!(entry.start_time.is_some());

        sup.stop_service("web").await.unwrap();
        assert_eq!(sup.status("web"), Some(Status::Stopped));
        assert!(sup
            .logs("web")
            .unwrap()
            .get_recent(0)
            .iter()
            .any(|e| e.message == "up"));
    }

    #[tokio::test]
    async fn exit_before_ready_is_error() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        // Nothing ever listens on the port, so only the exit can end startup.
        let spec = ServiceSpec::shell("api", "exit 4")
            .with_port(1)
            .with_health(HealthCheckConfig::tcp());
        sup.start_service(spec).await.unwrap();
        wait_for_status(&sup, "api", Status::Error).await;
        assert_eq!(
            sup.entry("api").unwrap().error.as_deref(),
            Some("exited before becoming ready (code 4)")
        );
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_running() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        let spec = ServiceSpec::shell("web", "sleep 30").with_health(HealthCheckConfig::none());
        sup.start_service(spec.clone()).await.unwrap();
        let err = sup.start_service(spec).await.unwrap_err();
        assert!(matches!(err, Error::ServiceAlreadyRunning(_)));
        sup.stop_all().await.unwrap();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        sup.start_service(ServiceSpec::shell("w", "sleep 30").with_health(HealthCheckConfig::none()))
            .await
            .unwrap();
        sup.stop_service("w").await.unwrap();
        sup.stop_service("w").await.unwrap();
        assert_eq!(sup.status("w"), Some(Status::Stopped));
        assert!(matches!(
            sup.stop_service("nope").await.unwrap_err(),
            Error::ServiceNotFound(_)
        ));
    }

    #[tokio::test]
    async fn stopped_service_can_restart() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        let spec = ServiceSpec::shell("w", "sleep 30").with_health(HealthCheckConfig::process());
        sup.start_service(spec.clone()).await.unwrap();
        wait_for_status(&sup, "w", Status::Ready).await;
        sup.stop_service("w").await.unwrap();

        sup.start_service(spec).await.unwrap();
        wait_for_status(&sup, "w", Status::Ready).await;
        sup.stop_all().await.unwrap();
    }

    #[tokio::test]
    async fn tcp_check_without_port_is_rejected() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        let err = sup
            .start_service(ServiceSpec::shell("w", "sleep 30").with_health(HealthCheckConfig::tcp()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(sup.status("w"), Some(Status::Error));
    }

    struct PanickingChecker;

    #[async_trait]
    impl HealthChecker for PanickingChecker {
        async fn check(&self) -> Result<bool> {
            panic!("checker blew up");
        }

        fn timeout(&self) -> Duration {
            Duration::from_secs(1)
        }

        fn target(&self) -> String {
            "panic".into()
        }
    }

    #[tokio::test]
    async fn panicking_monitor_only_fails_its_service() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        sup.start_service(ServiceSpec::shell("good", "sleep 30").with_health(HealthCheckConfig::process()))
            .await
            .unwrap();
        sup.start_service_with_checker(ServiceSpec::shell("bad", "sleep 30"), Box::new(PanickingChecker))
            .await
            .unwrap();

        wait_for_status(&sup, "bad", Status::Error).await;
        wait_for_status(&sup, "good", Status::Ready).await;
        let bad = sup.entry("bad").unwrap();
        assert!(bad.error.unwrap().contains("checker blew up"));

        sup.stop_all().await.unwrap();
        assert_eq!(sup.status("good"), Some(Status::Stopped));
        assert_eq!(sup.status("bad"), Some(Status::Stopped));
    }

    #[tokio::test]
    async fn snapshot_is_sorted() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        for name in ["zeta", "alpha", "mid"] {
            sup.start_service(ServiceSpec::shell(name, "sleep 30").with_health(HealthCheckConfig::none()))
                .await
                .unwrap();
        }
        let names: Vec<String> = sup.snapshot().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
        sup.stop_all().await.unwrap();
    }
}
