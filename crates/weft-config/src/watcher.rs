//! Filesystem watcher driving config hot-reload.
//!
//! Watches the store file's parent directory (atomic saves replace the
//! file by rename, which would orphan a watch on the file itself) and
//! nudges [`ConfigStore::reload_from_disk`] after a short debounce.
//! Consumers still poll as a fallback, so a lost watcher only delays
//! convergence.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{ConfigError, ConfigResult};
use crate::store::ConfigStore;

/// Debounce window between a filesystem event and the reload.
const DEBOUNCE: Duration = Duration::from_millis(200);

/// Handle keeping the watcher and its reload task alive.
pub struct ConfigWatcher {
    _watcher: notify::RecommendedWatcher,
    task: tokio::task::JoinHandle<()>,
}

impl ConfigWatcher {
    /// Install a watcher for `store`'s backing file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Watch`] if the watcher cannot be created
    /// or the parent directory cannot be watched.
    pub fn spawn(store: Arc<ConfigStore>) -> ConfigResult<Self> {
        let path = store.path().to_path_buf();
        let dir = path
            .parent()
            .map_or_else(|| PathBuf::from("."), PathBuf::from);

        let (tx, rx) = mpsc::unbounded_channel();
        let watched = path.clone();
        let mut watcher = notify::recommended_watcher(
            move |result: Result<notify::Event, notify::Error>| match result {
                Ok(event) => {
                    let relevant = (event.kind.is_modify()
                        || event.kind.is_create()
                        || event.kind.is_remove())
                        && event.paths.iter().any(|p| p.ends_with(
                            watched.file_name().unwrap_or_default(),
                        ));
                    if relevant {
                        let _ = tx.send(());
                    }
                },
                Err(e) => warn!(error = %e, "Config watcher error"),
            },
        )
        .map_err(|e| ConfigError::Watch(e.to_string()))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| ConfigError::Watch(e.to_string()))?;

        let task = tokio::spawn(reload_loop(store, rx));
        debug!(path = %path.display(), "Config watcher installed");

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }

    /// Stop watching.
    pub fn stop(self) {
        self.task.abort();
    }
}

/// Drain watch nudges, debounce, and reload.
async fn reload_loop(store: Arc<ConfigStore>, mut rx: mpsc::UnboundedReceiver<()>) {
    while rx.recv().await.is_some() {
        tokio::time::sleep(DEBOUNCE).await;
        // Collapse any nudges that arrived during the debounce window.
        while rx.try_recv().is_ok() {}

        if let Err(e) = store.reload_from_disk().await {
            warn!(error = %e, "Config reload after file change failed");
        }
    }
}
