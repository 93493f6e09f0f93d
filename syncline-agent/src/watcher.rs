//! Debounced filesystem watcher and the self-echo ignore map.
//!
//! The notify backend fires callbacks on an OS-owned thread. Events cross
//! into the async core over an unbounded channel — the callback must never
//! block on backpressure, or kernel event delivery stalls during mass
//! changes. Failed sends (receiver gone during shutdown) are counted and
//! logged, never waited on.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent, Debouncer};
use tokio::sync::mpsc;

/// A coalesced change notification. Whether the path still exists (modify
/// vs. delete) is decided by the handler at processing time.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub path: PathBuf,
}

pub struct VaultWatcher {
    // Dropping the debouncer stops the watch.
    _debouncer: Debouncer<notify::RecommendedWatcher>,
    dropped: Arc<AtomicU64>,
}

impl VaultWatcher {
    /// Watch `root` recursively with the given debounce window.
    pub fn spawn(
        root: &Path,
        debounce: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WatchEvent>), notify::Error> {
        let (tx, rx) = mpsc::unbounded_channel();
        let dropped = Arc::new(AtomicU64::new(0));
        let dropped_in_callback = dropped.clone();

        let mut debouncer = new_debouncer(
            debounce,
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    for event in events {
                        let send = tx.send(WatchEvent {
                            path: event.path.clone(),
                        });
                        if send.is_err() {
                            let n = dropped_in_callback.fetch_add(1, Ordering::Relaxed) + 1;
                            log::warn!("watcher: dropped event ({n} total), receiver gone");
                            return;
                        }
                    }
                }
                Err(e) => log::error!("watcher backend error: {e}"),
            },
        )?;

        debouncer.watcher().watch(root, RecursiveMode::Recursive)?;
        log::info!("watching {}", root.display());

        Ok((
            Self {
                _debouncer: debouncer,
                dropped,
            },
            rx,
        ))
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Paths the watcher must ignore because we are writing them ourselves.
///
/// Not a boolean per doc: each entry carries an expiry `Instant` so
/// concurrent writes to different paths are fenced independently, and a
/// fence left behind by a crashed write cannot ignore the path forever.
#[derive(Clone)]
pub struct IgnoreMap {
    inner: Arc<Mutex<HashMap<PathBuf, Instant>>>,
    /// How long after a completed write events for the path stay ignored.
    /// Must exceed the watcher's coalescing window.
    grace: Duration,
    /// Upper bound on a fence whose write never completes.
    write_cap: Duration,
}

impl IgnoreMap {
    pub fn new(grace: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            grace,
            write_cap: Duration::from_secs(30),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Instant>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Call before starting a write to `path`.
    pub fn fence(&self, path: &Path) {
        self.lock()
            .insert(path.to_path_buf(), Instant::now() + self.write_cap);
    }

    /// Call after the write completed; the fence now expires after the
    /// grace period instead of the write cap.
    pub fn release_after_grace(&self, path: &Path) {
        self.lock()
            .insert(path.to_path_buf(), Instant::now() + self.grace);
    }

    /// Whether an event for `path` should be discarded. Expired fences are
    /// removed as a side effect.
    pub fn should_ignore(&self, path: &Path) -> bool {
        let mut map = self.lock();
        match map.get(path) {
            Some(expiry) if Instant::now() < *expiry => true,
            Some(_) => {
                map.remove(path);
                false
            }
            None => false,
        }
    }
}
