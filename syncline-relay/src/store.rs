//! SQLite-backed durable store: per-document update log, snapshots, blobs.
//!
//! Everything lives in a single database file so that backup is `cp`. Three
//! tables:
//!
//! - `updates(doc_id, seq, bytes, created_at)` — append-only CRDT updates,
//!   `seq` monotonic per document
//! - `snapshots(doc_id PRIMARY KEY, bytes, through_seq)` — one merged prefix
//!   per document, LZ4 compressed, replaced atomically by compaction
//! - `blobs(hash PRIMARY KEY, bytes)` — content-addressed binary files,
//!   LZ4 compressed
//!
//! CRDT reconstruction (rebuilding a document from snapshot + updates to
//! answer a state-vector diff) is CPU-bound and runs on the blocking pool;
//! the async wrappers below are what sessions call.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS updates (
    doc_id     TEXT NOT NULL,
    seq        INTEGER NOT NULL,
    bytes      BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (doc_id, seq)
);

CREATE TABLE IF NOT EXISTS snapshots (
    doc_id      TEXT PRIMARY KEY,
    bytes       BLOB NOT NULL,
    through_seq INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS blobs (
    hash  TEXT PRIMARY KEY,
    bytes BLOB NOT NULL
);
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The peer's state vector predates the compaction horizon; a diff can
    /// no longer be produced from the squashed history.
    #[error("history lost for this state vector")]
    HistoryLost,

    #[error("corrupt stored data: {0}")]
    Corrupt(String),

    #[error("malformed peer payload: {0}")]
    BadPayload(String),

    #[error("worker pool failure: {0}")]
    Worker(String),
}

/// Material needed to reconstruct a document: the snapshot (if any), the
/// updates appended after it in log order, and the highest seq read.
#[derive(Debug, Default)]
pub struct DocMaterial {
    pub snapshot: Option<Vec<u8>>,
    pub updates: Vec<Vec<u8>>,
    pub last_seq: u64,
}

/// Handle to the single-file store. Cheap to clone; all clones share one
/// serialized connection.
#[derive(Clone)]
pub struct UpdateStore {
    conn: Arc<Mutex<Connection>>,
}

impl UpdateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned lock means a panic mid-transaction; the transaction was
        // rolled back by SQLite, so the connection is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ─── Update log ───────────────────────────────────────────────────

    /// Durably append an update. Returns the per-document sequence number.
    ///
    /// Duplicate bytes are appended as-is: re-broadcast updates are
    /// idempotent at the CRDT layer, so the log does not deduplicate.
    pub fn append_update(&self, doc_id: &str, bytes: &[u8]) -> Result<u64, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let seq: u64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM updates WHERE doc_id = ?1",
            params![doc_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO updates (doc_id, seq, bytes, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![doc_id, seq, bytes, unix_now()],
        )?;
        tx.commit()?;
        Ok(seq)
    }

    /// Snapshot plus post-snapshot updates, in append order. Runs in one
    /// transaction so a concurrent `replace_prefix` is never observed torn.
    pub fn read_state(&self, doc_id: &str) -> Result<DocMaterial, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let snapshot_row: Option<(Vec<u8>, u64)> = tx
            .query_row(
                "SELECT bytes, through_seq FROM snapshots WHERE doc_id = ?1",
                params![doc_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (snapshot, through_seq) = match snapshot_row {
            Some((compressed, through_seq)) => {
                let bytes = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::Corrupt(format!("snapshot: {e}")))?;
                (Some(bytes), through_seq)
            }
            None => (None, 0),
        };

        let mut stmt = tx.prepare(
            "SELECT seq, bytes FROM updates WHERE doc_id = ?1 AND seq > ?2 ORDER BY seq ASC",
        )?;
        let mut updates = Vec::new();
        let mut last_seq = through_seq;
        let rows = stmt.query_map(params![doc_id, through_seq], |row| {
            Ok((row.get::<_, u64>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        for row in rows {
            let (seq, bytes) = row?;
            last_seq = seq;
            updates.push(bytes);
        }
        drop(stmt);
        tx.commit()?;

        Ok(DocMaterial {
            snapshot,
            updates,
            last_seq,
        })
    }

    /// Atomically delete the update prefix up to `up_to_seq` and install the
    /// snapshot that replaces it. Used by compaction only.
    pub fn replace_prefix(
        &self,
        doc_id: &str,
        up_to_seq: u64,
        snapshot: &[u8],
    ) -> Result<(), StoreError> {
        let compressed = lz4_flex::compress_prepend_size(snapshot);
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM updates WHERE doc_id = ?1 AND seq <= ?2",
            params![doc_id, up_to_seq],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO snapshots (doc_id, bytes, through_seq) VALUES (?1, ?2, ?3)",
            params![doc_id, compressed, up_to_seq],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Documents whose post-snapshot update count reached `threshold`.
    pub fn docs_over_threshold(&self, threshold: u64) -> Result<Vec<String>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT doc_id FROM updates GROUP BY doc_id HAVING COUNT(*) >= ?1",
        )?;
        let rows = stmt.query_map(params![threshold], |row| row.get::<_, String>(0))?;
        let mut docs = Vec::new();
        for row in rows {
            docs.push(row?);
        }
        Ok(docs)
    }

    // ─── Diff ─────────────────────────────────────────────────────────

    /// Reconstruct the document and encode the delta the peer is missing.
    ///
    /// An empty peer vector always succeeds: the full state is the diff,
    /// which is also the recovery path after `HistoryLost`. A non-empty
    /// vector must dominate the snapshot's own state vector — compaction
    /// garbage-collects the tombstones an older replica would need.
    pub fn encode_diff(&self, doc_id: &str, peer_sv: &[u8]) -> Result<Vec<u8>, StoreError> {
        let peer_sv = StateVector::decode_v1(peer_sv)
            .map_err(|e| StoreError::BadPayload(format!("state vector: {e}")))?;
        let material = self.read_state(doc_id)?;

        let doc = Doc::new();
        if let Some(snapshot) = &material.snapshot {
            apply_bytes(&doc, snapshot)?;

            if peer_sv.iter().next().is_some() {
                let snapshot_sv = doc.transact().state_vector();
                if !dominates(&peer_sv, &snapshot_sv) {
                    return Err(StoreError::HistoryLost);
                }
            }
        }
        for update in &material.updates {
            apply_bytes(&doc, update)?;
        }

        let diff = doc.transact().encode_diff_v1(&peer_sv);
        Ok(diff)
    }

    // ─── Blobs ────────────────────────────────────────────────────────

    pub fn put_blob(&self, hash: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let compressed = lz4_flex::compress_prepend_size(bytes);
        self.lock().execute(
            "INSERT OR IGNORE INTO blobs (hash, bytes) VALUES (?1, ?2)",
            params![hash, compressed],
        )?;
        Ok(())
    }

    pub fn get_blob(&self, hash: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let compressed: Option<Vec<u8>> = self
            .lock()
            .query_row(
                "SELECT bytes FROM blobs WHERE hash = ?1",
                params![hash],
                |row| row.get(0),
            )
            .optional()?;
        match compressed {
            Some(c) => {
                let bytes = lz4_flex::decompress_size_prepended(&c)
                    .map_err(|e| StoreError::Corrupt(format!("blob: {e}")))?;
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }

    // ─── Async wrappers (blocking pool) ───────────────────────────────

    pub async fn append_update_async(
        &self,
        doc_id: String,
        bytes: Vec<u8>,
    ) -> Result<u64, StoreError> {
        let store = self.clone();
        spawn_store(move || store.append_update(&doc_id, &bytes)).await
    }

    pub async fn encode_diff_async(
        &self,
        doc_id: String,
        peer_sv: Vec<u8>,
    ) -> Result<Vec<u8>, StoreError> {
        let store = self.clone();
        spawn_store(move || store.encode_diff(&doc_id, &peer_sv)).await
    }

    pub async fn put_blob_async(&self, hash: String, bytes: Vec<u8>) -> Result<(), StoreError> {
        let store = self.clone();
        spawn_store(move || store.put_blob(&hash, &bytes)).await
    }

    pub async fn get_blob_async(&self, hash: String) -> Result<Option<Vec<u8>>, StoreError> {
        let store = self.clone();
        spawn_store(move || store.get_blob(&hash)).await
    }
}

async fn spawn_store<T: Send + 'static>(
    f: impl FnOnce() -> Result<T, StoreError> + Send + 'static,
) -> Result<T, StoreError> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Worker(e.to_string()))?
}

fn apply_bytes(doc: &Doc, bytes: &[u8]) -> Result<(), StoreError> {
    let update =
        Update::decode_v1(bytes).map_err(|e| StoreError::Corrupt(format!("update: {e}")))?;
    let mut txn = doc.transact_mut();
    txn.apply_update(update)
        .map_err(|e| StoreError::Corrupt(format!("apply: {e}")))?;
    Ok(())
}

/// `peer` has integrated at least everything `base` has.
fn dominates(peer: &StateVector, base: &StateVector) -> bool {
    base.iter().all(|(client, clock)| peer.get(client) >= *clock)
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
