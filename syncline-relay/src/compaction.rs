//! Background compaction: squash update runs into snapshots.
//!
//! A periodic scan finds documents whose post-snapshot update count crossed
//! the threshold and rewrites each one: reconstruct in memory, encode a full
//! snapshot, swap it in with `replace_prefix`. Runs entirely off the session
//! hot path and takes no locks other than the store's own. The threshold is
//! an atomic so an operator can lower it at runtime; overshooting documents
//! become eligible on the next scan.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::store::{StoreError, UpdateStore};

#[derive(Debug, Clone)]
pub struct CompactionSettings {
    /// Updates since the last snapshot before a doc is squashed.
    pub threshold: Arc<AtomicU64>,
    /// Scan period.
    pub interval: Duration,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            threshold: Arc::new(AtomicU64::new(50)),
            interval: Duration::from_secs(20),
        }
    }
}

impl CompactionSettings {
    pub fn set_threshold(&self, updates: u64) {
        self.threshold.store(updates, Ordering::Relaxed);
    }

    pub fn threshold(&self) -> u64 {
        self.threshold.load(Ordering::Relaxed)
    }
}

pub struct CompactionEngine {
    store: UpdateStore,
    settings: CompactionSettings,
}

impl CompactionEngine {
    pub fn new(store: UpdateStore, settings: CompactionSettings) -> Self {
        Self { store, settings }
    }

    /// Run the periodic scan until the task is cancelled.
    pub async fn run(self) {
        let mut tick = tokio::time::interval(self.settings.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            if let Err(e) = self.scan_once().await {
                log::error!("compaction scan failed: {e}");
            }
        }
    }

    /// One scan: compact every eligible document.
    pub async fn scan_once(&self) -> Result<usize, StoreError> {
        let threshold = self.settings.threshold();
        let store = self.store.clone();
        let eligible = tokio::task::spawn_blocking(move || store.docs_over_threshold(threshold))
            .await
            .map_err(|e| StoreError::Worker(e.to_string()))??;

        let mut compacted = 0;
        for doc_id in eligible {
            let store = self.store.clone();
            let id = doc_id.clone();
            let result = tokio::task::spawn_blocking(move || compact_doc(&store, &id))
                .await
                .map_err(|e| StoreError::Worker(e.to_string()))?;
            match result {
                Ok(through_seq) => {
                    compacted += 1;
                    log::info!("compacted {doc_id} through seq {through_seq}");
                }
                Err(e) => log::error!("compaction of {doc_id} failed: {e}"),
            }
        }
        Ok(compacted)
    }
}

/// Squash one document: snapshot everything read, swap the prefix.
///
/// Appends racing with this see no interference: `replace_prefix` only
/// deletes seqs at or below what was read here.
pub fn compact_doc(store: &UpdateStore, doc_id: &str) -> Result<u64, StoreError> {
    let material = store.read_state(doc_id)?;

    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        if let Some(snapshot) = &material.snapshot {
            let update = Update::decode_v1(snapshot)
                .map_err(|e| StoreError::Corrupt(format!("snapshot: {e}")))?;
            txn.apply_update(update)
                .map_err(|e| StoreError::Corrupt(format!("apply: {e}")))?;
        }
        for bytes in &material.updates {
            let update = Update::decode_v1(bytes)
                .map_err(|e| StoreError::Corrupt(format!("update: {e}")))?;
            txn.apply_update(update)
                .map_err(|e| StoreError::Corrupt(format!("apply: {e}")))?;
        }
    }

    let snapshot = doc
        .transact()
        .encode_state_as_update_v1(&StateVector::default());
    store.replace_prefix(doc_id, material.last_seq, &snapshot)?;
    Ok(material.last_seq)
}
