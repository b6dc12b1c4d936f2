//! Source file watcher
//!
//! Feeds debounced file changes under the engine root to the orchestrator.

use crate::orchestrator::Orchestrator;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use storyrun_common::{Error, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Watches the project root while the runner is alive
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl FileWatcher {
    /// Create a new watcher over `root`, skipping `ignore_dirs`
    pub fn new(
        root: &Path,
        ignore_dirs: Vec<String>,
        debounce: Duration,
        orchestrator: Arc<Orchestrator>,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if !(event.kind.is_create() || event.kind.is_modify() || event.kind.is_remove()) {
                        return;
                    }
                    for path in event.paths {
                        if !is_ignored(&path, &ignore_dirs) {
                            let _ = tx.send(path);
                        }
                    }
                }
                Err(e) => error!("Watch error: {}", e),
            },
            notify::Config::default(),
        )
        .map_err(|e| Error::Internal(format!("Failed to create file watcher: {}", e)))?;

        // Event paths must compare equal to the engine's canonical test files
        let root = watch_root(root);
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| Error::Internal(format!("Failed to watch {}: {}", root.display(), e)))?;
        info!("Watching {} for changes", root.display());

        let task = tokio::spawn(dispatch(rx, debounce, orchestrator));
        Ok(Self {
            _watcher: watcher,
            task,
        })
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn dispatch(
    mut rx: mpsc::UnboundedReceiver<PathBuf>,
    debounce: Duration,
    orchestrator: Arc<Orchestrator>,
) {
    while let Some(paths) = next_batch(&mut rx, debounce).await {
        for path in &paths {
            debug!("File changed: {}", path.display());
        }
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            if let Err(e) = orchestrator.handle_file_changes(&paths).await {
                debug!("Watch run for {} changed file(s) failed: {}", paths.len(), e);
            }
        });
    }
}

fn watch_root(root: &Path) -> PathBuf {
    std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf())
}

/// Collect changed paths until none arrived for `window`
///
/// Paths are deduplicated, first occurrence first. Returns `None` once the
/// sender is gone and nothing is pending.
pub async fn next_batch(
    rx: &mut mpsc::UnboundedReceiver<PathBuf>,
    window: Duration,
) -> Option<Vec<PathBuf>> {
    let first = rx.recv().await?;
    let mut batch = vec![first];
    loop {
        match tokio::time::timeout(window, rx.recv()).await {
            Ok(Some(path)) => {
                if !batch.contains(&path) {
                    batch.push(path);
                }
            }
            Ok(None) | Err(_) => return Some(batch),
        }
    }
}

fn is_ignored(path: &Path, ignore_dirs: &[String]) -> bool {
    path.components().any(|c| {
        c.as_os_str()
            .to_str()
            .map_or(false, |name| ignore_dirs.iter().any(|d| d == name))
    })
}
