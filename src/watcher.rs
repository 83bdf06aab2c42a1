//! Auto-reload: restart a service when its executable changes on disk

use crate::config::Service;
use crate::error::{GatewayError, Result};
use crate::supervisor::ServiceSupervisor;
use notify::event::EventKind;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

/// Quiet period after the first change before the service is restarted.
/// A rebuild usually produces a burst of events for one binary.
pub const RELOAD_DEBOUNCE: Duration = Duration::from_millis(250);

/// Watches one executable and reloads its service once. The relaunched
/// service gets a fresh watcher.
pub struct ReloadWatcher {
    supervisor: Arc<ServiceSupervisor>,
    index: usize,
    service: Service,
    path: PathBuf,
    events: mpsc::UnboundedReceiver<Event>,
    // Dropping the watcher stops the notifications
    _watcher: RecommendedWatcher,
}

/// Start watching `path` for the service at `index`. The returned handle
/// cancels the watch.
pub fn watch(
    supervisor: Arc<ServiceSupervisor>,
    index: usize,
    service: Service,
    path: PathBuf,
) -> Result<AbortHandle> {
    let watcher = ReloadWatcher::new(supervisor, index, service, path)?;
    let task = tokio::spawn(watcher.run());
    Ok(task.abort_handle())
}

/// Creations, writes, renames and removals all count as a new build
pub fn is_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

impl ReloadWatcher {
    pub fn new(
        supervisor: Arc<ServiceSupervisor>,
        index: usize,
        service: Service,
        path: PathBuf,
    ) -> Result<Self> {
        let (tx, events) = mpsc::unbounded_channel();
        let label = service.label().to_string();

        let watch_error = |source: notify::Error| GatewayError::Watch {
            service: label.clone(),
            path: path.display().to_string(),
            source,
        };

        let callback_label = label.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if is_change(&event.kind) {
                    let _ = tx.send(event);
                }
            }
            Err(e) => warn!(service = %callback_label, error = %e, "Watch error"),
        })
        .map_err(watch_error)?;

        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .map_err(watch_error)?;

        info!(service = %label, path = %path.display(), "Watching executable for changes");

        Ok(Self {
            supervisor,
            index,
            service,
            path,
            events,
            _watcher: watcher,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for a change, let the burst settle, then reload
    pub async fn run(mut self) {
        let Some(first) = self.events.recv().await else {
            debug!(service = self.service.label(), "Watch channel closed");
            return;
        };
        debug!(service = self.service.label(), kind = ?first.kind, "Executable changed");

        tokio::time::sleep(RELOAD_DEBOUNCE).await;
        while self.events.try_recv().is_ok() {}

        self.reload().await;
    }

    async fn reload(self) {
        let label = self.service.label().to_string();

        if self.supervisor.is_shutting_down() {
            return;
        }

        let Some(_reloading) = self.supervisor.begin_reload(self.index) else {
            debug!(service = %label, "Reload already in progress");
            return;
        };

        info!(service = %label, path = %self.path.display(), "Executable changed, reloading service");

        // Release the notify handle before the new watcher is installed
        let Self {
            supervisor,
            index,
            service,
            _watcher: notify_handle,
            ..
        } = self;
        drop(notify_handle);

        supervisor.terminate_for_reload(index).await;

        let result = Arc::clone(&supervisor).relaunch(index, service).await;
        match result {
            Ok(()) => info!(service = %label, "Service reloaded"),
            Err(e) => error!(service = %label, error = %e, "Service reload failed"),
        }
    }
}
