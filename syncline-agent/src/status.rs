//! The status lamp: the only user-visible health indicator.

use std::fmt;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Synced,
    Syncing,
    Error,
    Disconnected,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Error => "error",
            SyncStatus::Disconnected => "disconnected",
        };
        f.write_str(label)
    }
}

/// Publishes status transitions to whoever is watching (UI, tests, logs).
pub struct StatusLamp {
    tx: watch::Sender<SyncStatus>,
}

impl StatusLamp {
    pub fn new() -> (Self, watch::Receiver<SyncStatus>) {
        let (tx, rx) = watch::channel(SyncStatus::Disconnected);
        (Self { tx }, rx)
    }

    pub fn set(&self, status: SyncStatus) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            log::info!("status: {status}");
        }
    }

    pub fn get(&self) -> SyncStatus {
        *self.tx.borrow()
    }
}
