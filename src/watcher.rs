//! Background filesystem watcher. Debounces a burst of
//! `notify` events into a single `Index::sync_from_disk` call; falls
//! back to polling on the `MIN_RELOAD_INTERVAL` cadence when the
//! directory can't be watched yet (doesn't exist, or the platform
//! backend failed to start).

use crate::config::{DEBOUNCE_WINDOW, MIN_RELOAD_INTERVAL};
use crate::index::Index;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct WatcherHandle {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl WatcherHandle {
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Spawns the background task and returns a handle to stop it.
pub fn spawn(dir: PathBuf, index: Arc<dyn Index>) -> WatcherHandle {
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    let task = tokio::spawn(async move { run(dir, index, task_cancel).await });
    WatcherHandle { cancel, task }
}

async fn run(dir: PathBuf, index: Arc<dyn Index>, cancel: CancellationToken) {
    let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();

    let Some(_watcher) = build_watcher(&dir, tx) else {
        warn!(dir = %dir.display(), "falling back to polling reconcile, notify watcher unavailable");
        poll_loop(index, cancel).await;
        return;
    };

    let mut pending: Vec<PathBuf> = Vec::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            maybe_path = rx.recv() => {
                let Some(path) = maybe_path else { return };
                pending.push(path);
                // Drain further events for up to one debounce window so a
                // burst of writes collapses into a single reconcile.
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(DEBOUNCE_WINDOW) => break,
                        more = rx.recv() => match more {
                            Some(p) => pending.push(p),
                            None => return,
                        },
                        _ = cancel.cancelled() => return,
                    }
                }
                let changed = std::mem::take(&mut pending);
                debug!(count = changed.len(), "watcher debounce fired");
                for err in index.sync_from_disk(&changed).await {
                    warn!(error = %err, "reconcile error after watcher event");
                }
            }
        }
    }
}

fn build_watcher(dir: &std::path::Path, tx: mpsc::UnboundedSender<PathBuf>) -> Option<RecommendedWatcher> {
    if !dir.is_dir() {
        return None;
    }
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            for path in event.paths {
                let _ = tx.send(path);
            }
        }
    })
    .ok()?;
    watcher.watch(dir, RecursiveMode::NonRecursive).ok()?;
    Some(watcher)
}

async fn poll_loop(index: Arc<dyn Index>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(MIN_RELOAD_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                for err in index.reload().await {
                    warn!(error = %err, "reconcile error during poll");
                }
            }
        }
    }
}
