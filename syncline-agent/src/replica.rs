//! In-memory CRDT documents and their update listeners.
//!
//! Every document the agent knows about lives here as a `yrs::Doc` with an
//! update observer attached. Locally-generated ops flow out through the
//! observer as `UPDATE` frames; remote applies raise a suppress flag first
//! so the observer never re-emits what just arrived (the other half of the
//! feedback-loop fence — the filesystem half lives in [`crate::watcher`]).
//!
//! Documents are created with **byte** offset indexing. The whole diff
//! pipeline counts in bytes; creating a doc any other way desynchronizes
//! replicas on the first multi-byte character.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use syncline_proto::{Frame, MsgType, INDEX_DOC_ID};
use thiserror::Error;
use tokio::sync::mpsc;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Doc, GetString, OffsetKind, Options, ReadTxn, StateVector, Subscription, Transact, Update,
};

use crate::diff::apply_text_diff;

/// Root text container for vault files.
const TEXT_ROOT: &str = "content";

/// A doc configured for byte offsets, the unit every diff in this crate
/// computes.
pub fn new_text_doc() -> Doc {
    let mut options = Options::default();
    options.offset_kind = OffsetKind::Bytes;
    Doc::with_options(options)
}

#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("unknown document {0}")]
    UnknownDoc(String),

    #[error("crdt failure: {0}")]
    Crdt(String),

    #[error("state persistence: {0}")]
    Io(#[from] std::io::Error),
}

/// Keeps the observer alive for the lifetime of the doc entry.
///
/// The closure captures only an `AtomicBool` and an unbounded sender, both
/// `Send + Sync`; the subscription itself is never invoked from here, only
/// dropped.
struct SendSub(#[allow(dead_code)] Subscription);
unsafe impl Send for SendSub {}
unsafe impl Sync for SendSub {}

struct DocHandle {
    doc: Doc,
    suppress: Arc<AtomicBool>,
    _sub: SendSub,
}

/// Registry of live documents plus their outbound update listeners.
pub struct ReplicaEngine {
    docs: RwLock<HashMap<String, DocHandle>>,
    outgoing: mpsc::UnboundedSender<Frame>,
    /// Per-doc full-state persistence; `None` keeps everything in memory.
    state_dir: Option<PathBuf>,
}

impl ReplicaEngine {
    pub fn new(outgoing: mpsc::UnboundedSender<Frame>, state_dir: Option<PathBuf>) -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            outgoing,
            state_dir,
        }
    }

    fn lock_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, DocHandle>> {
        self.docs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, DocHandle>> {
        self.docs.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate the doc on first encounter: load any persisted state, then
    /// attach the update listener that forwards local ops to the session.
    pub fn ensure_doc(&self, doc_id: &str) -> Result<(), ReplicaError> {
        if self.lock_read().contains_key(doc_id) {
            return Ok(());
        }

        let doc = new_text_doc();

        // Seed from the saved full-state update, if any. The observer is not
        // attached yet, so nothing is emitted for replayed history.
        if let Some(path) = self.state_path(doc_id) {
            if path.exists() {
                let bytes = std::fs::read(&path)?;
                apply_update_bytes(&doc, &bytes)?;
            }
        }

        let suppress = Arc::new(AtomicBool::new(false));
        let msg_type = if doc_id == INDEX_DOC_ID {
            MsgType::IndexUpdate
        } else {
            MsgType::Update
        };
        let sub = {
            let suppress = suppress.clone();
            let outgoing = self.outgoing.clone();
            let doc_id = doc_id.to_owned();
            doc.observe_update_v1(move |_txn, event| {
                if suppress.load(Ordering::SeqCst) {
                    return;
                }
                let frame = Frame::new(msg_type, doc_id.clone(), event.update.clone());
                let _ = outgoing.send(frame);
            })
            .map_err(|e| ReplicaError::Crdt(format!("observe: {e}")))?
        };

        let mut docs = self.lock_write();
        docs.entry(doc_id.to_owned()).or_insert(DocHandle {
            doc,
            suppress,
            _sub: SendSub(sub),
        });
        Ok(())
    }

    pub fn contains(&self, doc_id: &str) -> bool {
        self.lock_read().contains_key(doc_id)
    }

    pub fn known_docs(&self) -> Vec<String> {
        self.lock_read().keys().cloned().collect()
    }

    /// Apply a remote update without re-emitting it.
    pub fn apply_remote(&self, doc_id: &str, update: &[u8]) -> Result<(), ReplicaError> {
        self.ensure_doc(doc_id)?;
        {
            let docs = self.lock_read();
            let handle = docs
                .get(doc_id)
                .ok_or_else(|| ReplicaError::UnknownDoc(doc_id.to_owned()))?;
            handle.suppress.store(true, Ordering::SeqCst);
            let result = apply_update_bytes(&handle.doc, update);
            handle.suppress.store(false, Ordering::SeqCst);
            result?;
        }
        self.persist(doc_id)
    }

    /// Replace the text content by diffing against the current replica
    /// state; the listener broadcasts the resulting ops.
    pub fn update(&self, doc_id: &str, new_text: &str) -> Result<(), ReplicaError> {
        self.ensure_doc(doc_id)?;
        {
            let docs = self.lock_read();
            let handle = docs
                .get(doc_id)
                .ok_or_else(|| ReplicaError::UnknownDoc(doc_id.to_owned()))?;
            let text = handle.doc.get_or_insert_text(TEXT_ROOT);
            let old = {
                let txn = handle.doc.transact();
                text.get_string(&txn)
            };
            if old != new_text {
                apply_text_diff(&handle.doc, &text, &old, new_text);
            }
        }
        self.persist(doc_id)
    }

    /// Same as [`update`](Self::update) but silent — used when seeding from
    /// disk on startup.
    pub fn set_text(&self, doc_id: &str, new_text: &str) -> Result<(), ReplicaError> {
        self.ensure_doc(doc_id)?;
        {
            let docs = self.lock_read();
            let handle = docs
                .get(doc_id)
                .ok_or_else(|| ReplicaError::UnknownDoc(doc_id.to_owned()))?;
            let text = handle.doc.get_or_insert_text(TEXT_ROOT);
            let old = {
                let txn = handle.doc.transact();
                text.get_string(&txn)
            };
            if old != new_text {
                handle.suppress.store(true, Ordering::SeqCst);
                apply_text_diff(&handle.doc, &text, &old, new_text);
                handle.suppress.store(false, Ordering::SeqCst);
            }
        }
        self.persist(doc_id)
    }

    pub fn get_text(&self, doc_id: &str) -> Option<String> {
        let docs = self.lock_read();
        let handle = docs.get(doc_id)?;
        let text = handle.doc.get_or_insert_text(TEXT_ROOT);
        let txn = handle.doc.transact();
        Some(text.get_string(&txn))
    }

    pub fn state_vector(&self, doc_id: &str) -> Option<Vec<u8>> {
        let docs = self.lock_read();
        let handle = docs.get(doc_id)?;
        let sv = handle.doc.transact().state_vector().encode_v1();
        Some(sv)
    }

    /// Full state as a single update, for seeding peers or persistence.
    pub fn encode_full_state(&self, doc_id: &str) -> Option<Vec<u8>> {
        let docs = self.lock_read();
        let handle = docs.get(doc_id)?;
        let update = handle
            .doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default());
        Some(update)
    }

    /// Run `f` against the index document (created on demand), then persist
    /// it. Mutations inside `f` flow out through the update listener as
    /// `INDEX_UPDATE` frames.
    pub fn with_index<R>(&self, f: impl FnOnce(&Doc) -> R) -> Result<R, ReplicaError> {
        self.ensure_doc(INDEX_DOC_ID)?;
        let result = {
            let docs = self.lock_read();
            let handle = docs
                .get(INDEX_DOC_ID)
                .ok_or_else(|| ReplicaError::UnknownDoc(INDEX_DOC_ID.to_owned()))?;
            f(&handle.doc)
        };
        self.persist(INDEX_DOC_ID)?;
        Ok(result)
    }

    /// Drop the doc and its saved state (remote deletion, history-lost
    /// recovery).
    pub fn remove_doc(&self, doc_id: &str) -> Result<(), ReplicaError> {
        self.lock_write().remove(doc_id);
        if let Some(path) = self.state_path(doc_id) {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    fn state_path(&self, doc_id: &str) -> Option<PathBuf> {
        self.state_dir
            .as_ref()
            .map(|dir| dir.join(format!("{doc_id}.bin")))
    }

    fn persist(&self, doc_id: &str) -> Result<(), ReplicaError> {
        let Some(path) = self.state_path(doc_id) else {
            return Ok(());
        };
        let Some(bytes) = self.encode_full_state(doc_id) else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, bytes)?;
        Ok(())
    }
}

fn apply_update_bytes(doc: &Doc, bytes: &[u8]) -> Result<(), ReplicaError> {
    let update =
        Update::decode_v1(bytes).map_err(|e| ReplicaError::Crdt(format!("decode: {e}")))?;
    let mut txn = doc.transact_mut();
    txn.apply_update(update)
        .map_err(|e| ReplicaError::Crdt(format!("apply: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> (ReplicaEngine, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ReplicaEngine::new(tx, None), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn local_edit_emits_update_frame() {
        let (engine, mut rx) = engine();
        engine.update("a.md", "hi").unwrap();

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].msg_type, MsgType::Update);
        assert_eq!(frames[0].doc_id, "a.md");

        // The emitted update reproduces the edit on a fresh doc.
        let peer = new_text_doc();
        apply_update_bytes(&peer, &frames[0].payload).unwrap();
        let text = peer.get_or_insert_text(TEXT_ROOT);
        let txn = peer.transact();
        assert_eq!(text.get_string(&txn), "hi");
    }

    #[test]
    fn index_edits_emit_index_update_frames() {
        let (engine, mut rx) = engine();
        engine
            .with_index(|doc| {
                use yrs::Map as _;
                let map = doc.get_or_insert_map("files");
                let mut txn = doc.transact_mut();
                map.insert(&mut txn, "a.md", "{\"kind\":\"text\"}");
            })
            .unwrap();

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].msg_type, MsgType::IndexUpdate);
        assert_eq!(frames[0].doc_id, INDEX_DOC_ID);
    }

    #[test]
    fn set_text_is_silent() {
        let (engine, mut rx) = engine();
        engine.set_text("a.md", "seeded from disk").unwrap();
        assert!(drain(&mut rx).is_empty());
        assert_eq!(engine.get_text("a.md").unwrap(), "seeded from disk");
    }

    #[test]
    fn apply_remote_does_not_reemit() {
        let (alice, mut alice_rx) = engine();
        alice.update("a.md", "Hello").unwrap();
        let update = alice.encode_full_state("a.md").unwrap();
        drain(&mut alice_rx);

        let (bob, mut bob_rx) = engine();
        bob.apply_remote("a.md", &update).unwrap();
        assert!(drain(&mut bob_rx).is_empty());
        assert_eq!(bob.get_text("a.md").unwrap(), "Hello");
    }

    #[test]
    fn replicas_converge_under_reordering_and_duplicates() {
        let (alice, _arx) = engine();
        let (bob, _brx) = engine();
        alice.update("d.md", "alpha").unwrap();
        bob.update("d.md", "beta").unwrap();
        let ua = alice.encode_full_state("d.md").unwrap();
        let ub = bob.encode_full_state("d.md").unwrap();

        let (one, _rx1) = engine();
        one.apply_remote("d.md", &ua).unwrap();
        one.apply_remote("d.md", &ub).unwrap();
        one.apply_remote("d.md", &ua).unwrap(); // duplicate

        let (two, _rx2) = engine();
        two.apply_remote("d.md", &ub).unwrap();
        two.apply_remote("d.md", &ua).unwrap();

        let text_one = one.get_text("d.md").unwrap();
        let text_two = two.get_text("d.md").unwrap();
        assert_eq!(text_one, text_two);
        assert!(text_one.contains("alpha") && text_one.contains("beta"));
    }

    #[test]
    fn multibyte_round_trip() {
        let (engine, _rx) = engine();
        engine.set_text("n.md", "café").unwrap();
        engine.update("n.md", "café🚀").unwrap();
        assert_eq!(engine.get_text("n.md").unwrap(), "café🚀");

        engine.update("n.md", "Xcafé🚀").unwrap();
        assert_eq!(engine.get_text("n.md").unwrap(), "Xcafé🚀");
    }

    #[test]
    fn update_with_same_text_is_a_noop() {
        let (engine, mut rx) = engine();
        engine.update("a.md", "same").unwrap();
        drain(&mut rx);
        engine.update("a.md", "same").unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn state_survives_engine_restart() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("data");

        {
            let (tx, _rx) = mpsc::unbounded_channel();
            let engine = ReplicaEngine::new(tx, Some(state_dir.clone()));
            engine.update("notes/idea.md", "persisted").unwrap();
        }

        let (tx, _rx) = mpsc::unbounded_channel();
        let engine = ReplicaEngine::new(tx, Some(state_dir));
        engine.ensure_doc("notes/idea.md").unwrap();
        assert_eq!(engine.get_text("notes/idea.md").unwrap(), "persisted");
    }

    #[test]
    fn remove_doc_drops_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("data");
        let (tx, _rx) = mpsc::unbounded_channel();
        let engine = ReplicaEngine::new(tx, Some(state_dir.clone()));

        engine.update("a.md", "gone soon").unwrap();
        assert!(state_dir.join("a.md.bin").exists());

        engine.remove_doc("a.md").unwrap();
        assert!(!state_dir.join("a.md.bin").exists());
        assert!(!engine.contains("a.md"));
    }

    #[test]
    fn state_vector_reflects_edits() {
        let (engine, _rx) = engine();
        engine.ensure_doc("a.md").unwrap();
        let empty_sv = engine.state_vector("a.md").unwrap();
        engine.update("a.md", "content").unwrap();
        let edited_sv = engine.state_vector("a.md").unwrap();
        assert_ne!(empty_sv, edited_sv);
    }
}
