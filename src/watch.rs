use std::path::Path;
use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};

use crate::marker::{self, Marker};

/// Creates a watcher for a directory and returns a receiver for change events.
/// The watcher must be kept alive for events to be received.
pub fn watch_dir(dir: &Path) -> Result<(RecommendedWatcher, Receiver<()>)> {
    let (tx, rx) = mpsc::channel();

    let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        if res.is_ok() {
            // Ignore send errors (receiver dropped)
            let _ = tx.send(());
        }
    })
    .context("failed to create file watcher")?;

    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", dir.display()))?;

    Ok((watcher, rx))
}

/// Waits for a change event with timeout.
/// Returns true if an event was received, false on timeout.
pub fn wait_for_change(rx: &Receiver<()>, timeout: Duration) -> bool {
    rx.recv_timeout(timeout).is_ok()
}

/// Drains any pending events from the receiver.
pub fn drain_events(rx: &Receiver<()>) {
    while rx.try_recv().is_ok() {}
}

/// Block until the completion marker for `id` exists, or `timeout` elapses.
///
/// Watches the marker directory and re-checks on every event, with a
/// periodic re-check as a safety net for missed events.
pub fn wait_for_marker(dir: &Path, id: &str, timeout: Option<Duration>) -> Result<Option<Marker>> {
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let (_watcher, rx) = watch_dir(dir)?;
    let deadline = timeout.map(|t| Instant::now() + t);
    let recheck = Duration::from_secs(1);

    loop {
        drain_events(&rx);
        if let Some(found) = marker::read(dir, id)? {
            return Ok(Some(found));
        }
        let wait = match deadline {
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    return Ok(None);
                }
                recheck.min(d - now)
            }
            None => recheck,
        };
        wait_for_change(&rx, wait);
    }
}
