//! Device arrival notifications
//!
//! Watches the device directory for new nodes and falls back to a fixed poll
//! interval, so a missed or unsupported notification only delays discovery.

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Wakes the device monitor when the dial may have arrived
pub struct ArrivalWatcher {
    // Dropping the watcher stops notifications
    _watcher: Option<RecommendedWatcher>,
    arrivals: mpsc::Receiver<()>,
    poll_interval: Duration,
}

impl ArrivalWatcher {
    pub fn new(dir: Option<&Path>, poll_interval: Duration) -> Self {
        // Wake-ups coalesce: one pending signal is enough to trigger a check
        let (tx, arrivals) = mpsc::channel(1);

        let watcher = dir.and_then(|dir| match watch_dir(dir, tx) {
            Ok(watcher) => {
                debug!("Watching {} for device arrivals", dir.display());
                Some(watcher)
            }
            Err(e) => {
                warn!(
                    "Cannot watch {} ({}), polling every {:?} instead",
                    dir.display(),
                    e,
                    poll_interval
                );
                None
            }
        });

        Self {
            _watcher: watcher,
            arrivals,
            poll_interval,
        }
    }

    /// Whether arrival notifications are active (otherwise polling only)
    pub fn is_watching(&self) -> bool {
        self._watcher.is_some()
    }

    /// Resolve on the next arrival notification or poll tick, whichever comes first
    pub async fn next(&mut self) {
        tokio::select! {
            Some(()) = self.arrivals.recv() => {}
            _ = tokio::time::sleep(self.poll_interval) => {}
        }
    }
}

fn watch_dir(dir: &Path, tx: mpsc::Sender<()>) -> notify::Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(event) if matches!(event.kind, EventKind::Create(_)) => {
                // Full means a wake-up is already pending
                if tx.try_send(()).is_err() {
                    debug!("arrival already signalled");
                }
            }
            Ok(_) => {}
            Err(e) => warn!("device watch error: {}", e),
        }
    })?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}
