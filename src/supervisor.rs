//! Launching and supervising the configured services
//!
//! A service goes through three steps: its strings are resolved against the
//! port table, its command is resolved to an executable file, and the
//! process is spawned with a bounded retry loop. Services that ask for
//! auto-reload get a [`watcher`](crate::watcher) on their executable.

use crate::config::Service;
use crate::error::{GatewayError, Result};
use crate::paths;
use crate::ports::PortTable;
use crate::watcher;
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Launch attempts before a service is given up on
pub const MAX_LAUNCH_ATTEMPTS: u32 = 10;

/// Pause between two launch attempts
pub const LAUNCH_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_LAUNCH_ATTEMPTS,
            delay: LAUNCH_RETRY_DELAY,
        }
    }
}

/// Whether services are started one after another or all at once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    Sequential,
    Parallel,
}

impl StartMode {
    pub fn from_parallel(parallel: bool) -> Self {
        if parallel {
            StartMode::Parallel
        } else {
            StartMode::Sequential
        }
    }
}

/// A service invocation with every path and placeholder resolved
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    /// Absolute path of the executable; also the path watched for reloads
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Replacement environment; `None` inherits the gateway's
    pub env: Option<Vec<(String, String)>>,
    pub dir: Option<PathBuf>,
}

impl LaunchSpec {
    /// Resolve placeholders, the executable and the working directory of
    /// the service at `index` (0-based)
    pub fn resolve(index: usize, service: &Service, ports: &PortTable) -> Result<Self> {
        if service.cmd.is_empty() {
            return Err(GatewayError::config(format!(
                "cmd must not be empty - service {}",
                index + 1
            )));
        }

        let cmd = ports.resolve(&service.cmd);
        let args = ports.resolve(&service.args);
        let env = ports.resolve(&service.env);

        let (program, dir) = resolve_program(&cmd, &service.dir)?;

        Ok(Self {
            program,
            args: split_args(&args),
            env: parse_env(&env, service.label()),
            dir,
        })
    }

    fn command(&self, silent: bool) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.stdin(Stdio::null());

        if silent {
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
        } else {
            cmd.stdout(Stdio::inherit());
            cmd.stderr(Stdio::inherit());
        }

        if let Some(ref dir) = self.dir {
            cmd.current_dir(dir);
        }

        if let Some(ref env) = self.env {
            cmd.env_clear();
            for (key, value) in env {
                cmd.env(key, value);
            }
        }

        cmd.kill_on_drop(true);
        cmd
    }
}

/// Split on single spaces; an empty string means no arguments
pub fn split_args(args: &str) -> Vec<String> {
    if args.is_empty() {
        return Vec::new();
    }
    args.split(' ').map(String::from).collect()
}

/// Parse space-separated `KEY=VALUE` pairs; an empty string keeps the
/// inherited environment
pub fn parse_env(env: &str, service: &str) -> Option<Vec<(String, String)>> {
    if env.is_empty() {
        return None;
    }

    let pairs = env
        .split(' ')
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match entry.split_once('=') {
            Some((key, value)) if !key.is_empty() => Some((key.to_string(), value.to_string())),
            _ => {
                warn!(service, entry, "Ignoring environment entry without KEY=VALUE form");
                None
            }
        })
        .collect();

    Some(pairs)
}

/// Find the executable for `cmd`.
///
/// Without a working directory the command is looked up on `PATH`, then as
/// a file relative to the gateway's directory. With one, `~` and `$GOPATH`
/// are expanded in both, the same two lookups are tried, and finally the
/// command is taken relative to the working directory.
pub fn resolve_program(cmd: &str, dir: &str) -> Result<(PathBuf, Option<PathBuf>)> {
    if dir.is_empty() {
        let program = look_path(Path::new(cmd))
            .or_else(|| absolute_file(Path::new(cmd)))
            .ok_or_else(|| {
                GatewayError::resolution(format!(
                    "command {} not found in PATH and is not a file",
                    cmd
                ))
            })?;
        return Ok((program, None));
    }

    let dir = paths::normalize(dir, true);
    let cmd = paths::normalize(cmd, false);

    if !dir.is_dir() {
        return Err(GatewayError::resolution(format!(
            "working directory {} for command {} not found",
            dir.display(),
            cmd.display()
        )));
    }

    if let Some(program) = look_path(&cmd).or_else(|| absolute_file(&cmd)) {
        return Ok((program, Some(dir)));
    }

    let relative = dir.join(&cmd);
    match std::fs::metadata(&relative) {
        Ok(meta) if meta.is_dir() => Err(GatewayError::resolution(format!(
            "command {} not found in PATH and {} is not a file",
            cmd.display(),
            relative.display()
        ))),
        Ok(_) => Ok((relative, Some(dir))),
        Err(_) => Err(GatewayError::resolution(format!(
            "command {} not found in PATH and {}",
            cmd.display(),
            dir.display()
        ))),
    }
}

/// `PATH` lookup. Commands containing a separator are checked as given.
fn look_path(cmd: &Path) -> Option<PathBuf> {
    if cmd.as_os_str().is_empty() {
        return None;
    }

    if cmd.is_absolute() || cmd.components().count() > 1 {
        return is_executable(cmd).then(|| paths::make_absolute(cmd));
    }

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| {
            if dir.as_os_str().is_empty() {
                PathBuf::from(".").join(cmd)
            } else {
                dir.join(cmd)
            }
        })
        .find(|candidate| is_executable(candidate))
        .map(|found| paths::make_absolute(&found))
}

/// The command as an absolute path, if that names a regular file
fn absolute_file(cmd: &Path) -> Option<PathBuf> {
    if cmd.as_os_str().is_empty() {
        return None;
    }
    let absolute = paths::make_absolute(cmd);
    std::fs::metadata(&absolute)
        .ok()
        .filter(|meta| meta.is_file())
        .map(|_| absolute)
}

fn is_executable(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }

    #[cfg(not(unix))]
    {
        true
    }
}

/// A launched service. Replaced, never mutated, on reload.
pub struct RunningService {
    child: Child,
    service: Service,
    watcher: Option<AbortHandle>,
}

impl RunningService {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn is_watched(&self) -> bool {
        self.watcher.is_some()
    }
}

/// Launches services and keeps their handles.
///
/// Like other shared managers in this crate, [`new`](ServiceSupervisor::new)
/// returns `Arc<Self>`: reload watchers hold a clone to relaunch services.
pub struct ServiceSupervisor {
    ports: Arc<PortTable>,
    /// Discard the output of every service
    silent: bool,
    retry: RetryPolicy,
    /// Running services keyed by their position in the config
    running: DashMap<usize, RunningService>,
    /// Services with a reload in progress
    reloading: Mutex<HashSet<usize>>,
    /// Services stopped explicitly; a pending reload must not bring them back
    stopped: Mutex<HashSet<usize>>,
    shutting_down: AtomicBool,
}

/// Marks one service as reloading until dropped
pub struct ReloadGuard {
    supervisor: Arc<ServiceSupervisor>,
    index: usize,
}

impl ReloadGuard {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Drop for ReloadGuard {
    fn drop(&mut self) {
        self.supervisor.reloading.lock().remove(&self.index);
        debug!(index = self.index, "Reload finished");
    }
}

impl ServiceSupervisor {
    pub fn new(ports: Arc<PortTable>, silent: bool) -> Arc<Self> {
        Self::with_retry_policy(ports, silent, RetryPolicy::default())
    }

    pub fn with_retry_policy(ports: Arc<PortTable>, silent: bool, retry: RetryPolicy) -> Arc<Self> {
        Arc::new(Self {
            ports,
            silent,
            retry,
            running: DashMap::new(),
            reloading: Mutex::new(HashSet::new()),
            stopped: Mutex::new(HashSet::new()),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Start every service. In parallel mode all services are launched even
    /// if one fails; the first failure is returned.
    pub async fn start_all(self: &Arc<Self>, services: &[Service], mode: StartMode) -> Result<()> {
        info!(count = services.len(), ?mode, "Starting services");

        match mode {
            StartMode::Sequential => {
                for (index, service) in services.iter().enumerate() {
                    self.start_service(index, service).await?;
                }
                Ok(())
            }
            StartMode::Parallel => {
                let mut tasks = JoinSet::new();
                for (index, service) in services.iter().cloned().enumerate() {
                    let supervisor = Arc::clone(self);
                    tasks.spawn(async move { supervisor.start_service(index, &service).await });
                }

                let mut first_error = None;
                while let Some(joined) = tasks.join_next().await {
                    let result = joined.unwrap_or_else(|e| {
                        Err(GatewayError::Io(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            format!("service start task failed: {}", e),
                        )))
                    });
                    if let Err(e) = result {
                        error!(error = %e, "Service failed to start");
                        first_error.get_or_insert(e);
                    }
                }

                first_error.map_or(Ok(()), Err)
            }
        }
    }

    /// Resolve and launch one service, then watch it if it asks for reloads.
    /// Clears an earlier [`stop_service`](ServiceSupervisor::stop_service).
    pub async fn start_service(self: &Arc<Self>, index: usize, service: &Service) -> Result<()> {
        self.stopped.lock().remove(&index);
        self.spawn_service(index, service).await
    }

    async fn spawn_service(self: &Arc<Self>, index: usize, service: &Service) -> Result<()> {
        let spec = LaunchSpec::resolve(index, service, &self.ports)?;
        let silent = self.silent || service.silent;

        debug!(
            service = service.label(),
            program = %spec.program.display(),
            args = ?spec.args,
            dir = ?spec.dir,
            "Service resolved"
        );

        let child = self.launch(service.label(), &spec, silent).await?;

        let watcher = if service.auto_reload {
            match watcher::watch(Arc::clone(self), index, service.clone(), spec.program.clone()) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    error!(service = service.label(), error = %e, "Auto-reload disabled");
                    None
                }
            }
        } else {
            None
        };

        let running = RunningService {
            child,
            service: service.clone(),
            watcher,
        };

        let registered = {
            let stopped = self.stopped.lock();
            if stopped.contains(&index) || self.is_shutting_down() {
                Err(running)
            } else {
                Ok(self.running.insert(index, running))
            }
        };

        let previous = match registered {
            Ok(previous) => previous,
            Err(mut running) => {
                // Stopped while launching: the new process must not outlive the stop
                debug!(service = service.label(), "Service stopped during launch");
                if let Some(handle) = running.watcher.take() {
                    handle.abort();
                }
                kill_child(service.label(), &mut running.child).await;
                return Ok(());
            }
        };

        if let Some(mut previous) = previous {
            warn!(service = service.label(), "Replacing a service that was still registered");
            if let Some(handle) = previous.watcher.take() {
                handle.abort();
            }
            kill_child(previous.service.label(), &mut previous.child).await;
        }

        Ok(())
    }

    /// Spawn the process, retrying on failure
    async fn launch(&self, label: &str, spec: &LaunchSpec, silent: bool) -> Result<Child> {
        let mut last_error = None;

        for attempt in 1..=self.retry.max_attempts {
            match spec.command(silent).spawn() {
                Ok(child) => {
                    info!(
                        service = label,
                        pid = child.id().unwrap_or(0),
                        attempt,
                        "Service started"
                    );
                    return Ok(child);
                }
                Err(e) => {
                    warn!(
                        service = label,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        error = %e,
                        "Service launch attempt failed"
                    );
                    last_error = Some(e);
                    if attempt < self.retry.max_attempts {
                        tokio::time::sleep(self.retry.delay).await;
                    }
                }
            }
        }

        let source = last_error.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "no launch attempt was made")
        });
        error!(service = label, error = %source, "Service failed to start");

        Err(GatewayError::LaunchRetryExhausted {
            service: label.to_string(),
            attempts: self.retry.max_attempts,
            source,
        })
    }

    /// Relaunch a service from its definition, unless it was stopped in the
    /// meantime. Boxed so a watcher task can await it while being spawned
    /// from inside `start_service`.
    pub fn relaunch(self: Arc<Self>, index: usize, service: Service) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            if self.is_shutting_down() {
                debug!(service = service.label(), "Shutting down, relaunch skipped");
                return Ok(());
            }
            if self.is_stopped(index) {
                debug!(service = service.label(), "Service was stopped, relaunch skipped");
                return Ok(());
            }
            self.spawn_service(index, &service).await
        })
    }

    /// Kill the current process of a service about to be relaunched. Its
    /// watcher is left alone: it is the caller.
    pub(crate) async fn terminate_for_reload(&self, index: usize) -> bool {
        let Some((_, mut running)) = self.running.remove(&index) else {
            return false;
        };
        kill_child(running.service.label(), &mut running.child).await;
        true
    }

    /// Mark a reload as started. `None` if one is already running for the
    /// service; otherwise the mark lasts until the guard is dropped.
    pub fn begin_reload(self: &Arc<Self>, index: usize) -> Option<ReloadGuard> {
        if !self.reloading.lock().insert(index) {
            return None;
        }
        Some(ReloadGuard {
            supervisor: Arc::clone(self),
            index,
        })
    }

    pub fn is_reloading(&self, index: usize) -> bool {
        self.reloading.lock().contains(&index)
    }

    pub fn is_stopped(&self, index: usize) -> bool {
        self.stopped.lock().contains(&index)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Kill a service and stop watching it. A reload already in flight for
    /// it will not relaunch it.
    pub async fn stop_service(&self, index: usize) -> bool {
        self.stopped.lock().insert(index);
        let Some((_, mut running)) = self.running.remove(&index) else {
            return false;
        };
        if let Some(handle) = running.watcher.take() {
            handle.abort();
        }
        kill_child(running.service.label(), &mut running.child).await;
        true
    }

    /// Kill every service; no relaunch happens afterwards
    pub async fn stop_all(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let indexes: Vec<usize> = self.running.iter().map(|entry| *entry.key()).collect();
        for index in indexes {
            self.stop_service(index).await;
        }
    }

    pub fn pid(&self, index: usize) -> Option<u32> {
        self.running.get(&index).and_then(|running| running.pid())
    }

    pub fn is_running(&self, index: usize) -> bool {
        self.running.contains_key(&index)
    }

    pub fn is_watched(&self, index: usize) -> bool {
        self.running
            .get(&index)
            .map(|running| running.is_watched())
            .unwrap_or(false)
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }
}

/// Kill immediately and reap
async fn kill_child(label: &str, child: &mut Child) {
    let pid = child.id();
    match child.kill().await {
        Ok(()) => info!(service = label, pid, "Service stopped"),
        Err(e) => warn!(service = label, pid, error = %e, "Error stopping service"),
    }
}
