//! The folder daemon: bootstrap, session loop, reconciliation.
//!
//! One async core drives three inputs — frames from the relay, frames from
//! the replica's update listeners, debounced watcher events — plus the
//! reconnect loop around them. Remote writes to disk are fenced through the
//! ignore map before the first byte is written and released a grace period
//! after, so the watcher never reports our own writes back as edits.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use syncline_proto::{Frame, MsgType, BLOB_HASH_LEN, INDEX_DOC_ID};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use yrs::updates::encoder::Encode;
use yrs::StateVector;

use crate::blob;
use crate::index::{self, BlobFate, IndexEntry, LocalBlob};
use crate::net::{self, Backoff};
use crate::replica::{ReplicaEngine, ReplicaError};
use crate::status::{StatusLamp, SyncStatus};
use crate::vault::{FileKind, Vault, VaultError};
use crate::watcher::{IgnoreMap, VaultWatcher, WatchEvent};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Replica(#[from] ReplicaError),

    #[error("watcher: {0}")]
    Watcher(#[from] notify::Error),

    #[error("agent io: {0}")]
    Io(#[from] std::io::Error),

    #[error("agent already running")]
    AlreadyRunning,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// The watched vault directory.
    pub dir: PathBuf,
    /// Relay endpoint.
    pub url: String,
    /// Human identity announced in `HELLO` and recorded in blob entries.
    pub name: String,
    /// Coalescing window for file modify events.
    pub debounce: Duration,
    /// How long a finished remote write keeps its path fenced. Must exceed
    /// the debounce window.
    pub write_grace: Duration,
}

impl AgentConfig {
    pub fn new(dir: impl Into<PathBuf>, url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            url: url.into(),
            name: name.into(),
            debounce: Duration::from_millis(300),
            write_grace: Duration::from_millis(400),
        }
    }
}

pub struct FolderAgent {
    config: AgentConfig,
    vault: Vault,
    replica: ReplicaEngine,
    replica_rx: Option<mpsc::UnboundedReceiver<Frame>>,
    ignore: IgnoreMap,
    lamp: StatusLamp,
    status_rx: watch::Receiver<SyncStatus>,
    /// Index entries as last observed, the baseline for reconciliation.
    last_entries: HashMap<String, IndexEntry>,
    /// Blob hash → paths waiting for its `BLOB_DATA`.
    pending_blobs: HashMap<String, Vec<String>>,
    /// Docs offered via `SYNC_STEP_1` on the current connection.
    subscribed: HashSet<String>,
    /// Docs being re-seeded after `ERR_HISTORY_LOST`; their next incoming
    /// state skips the unsynced-disk check (server state is ground truth).
    reseeding: HashSet<String>,
}

impl FolderAgent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let vault = Vault::new(&config.dir)?;
        let (replica_tx, replica_rx) = mpsc::unbounded_channel();
        let replica = ReplicaEngine::new(replica_tx, Some(vault.state_dir().to_path_buf()));
        let (lamp, status_rx) = StatusLamp::new();
        let ignore = IgnoreMap::new(config.write_grace);
        Ok(Self {
            config,
            vault,
            replica,
            replica_rx: Some(replica_rx),
            ignore,
            lamp,
            status_rx,
            last_entries: HashMap::new(),
            pending_blobs: HashMap::new(),
            subscribed: HashSet::new(),
            reseeding: HashSet::new(),
        })
    }

    /// Observe the status lamp.
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status_rx.clone()
    }

    /// Run forever: watch the vault, connect, sync, reconnect with backoff.
    pub async fn run(mut self) -> Result<(), AgentError> {
        let mut replica_rx = self.replica_rx.take().ok_or(AgentError::AlreadyRunning)?;
        let (watcher, mut watch_rx) =
            VaultWatcher::spawn(self.vault.root(), self.config.debounce)?;
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));

        loop {
            match net::connect(&self.config.url).await {
                Ok((tx, rx)) => {
                    backoff.reset();
                    self.lamp.set(SyncStatus::Syncing);
                    self.session(tx, rx, &mut replica_rx, &mut watch_rx).await;
                    self.lamp.set(SyncStatus::Disconnected);
                    log::warn!(
                        "relay connection lost ({} watcher drops so far)",
                        watcher.dropped_events()
                    );
                }
                Err(e) => {
                    self.lamp.set(SyncStatus::Disconnected);
                    log::warn!("connect to {} failed: {e}", self.config.url);
                }
            }
            tokio::time::sleep(backoff.next_delay()).await;
        }
    }

    /// One connected session; returns when the connection dies.
    async fn session(
        &mut self,
        tx: mpsc::UnboundedSender<Frame>,
        mut rx: mpsc::UnboundedReceiver<Frame>,
        replica_rx: &mut mpsc::UnboundedReceiver<Frame>,
        watch_rx: &mut mpsc::UnboundedReceiver<WatchEvent>,
    ) {
        self.subscribed.clear();
        self.reseeding.clear();
        self.pending_blobs.clear();

        if tx
            .send(Frame::global(
                MsgType::Hello,
                self.config.name.clone().into_bytes(),
            ))
            .is_err()
        {
            return;
        }

        if let Err(e) = self.bootstrap(&tx) {
            log::error!("bootstrap failed: {e}");
            self.lamp.set(SyncStatus::Error);
        } else {
            self.lamp.set(SyncStatus::Synced);
        }

        loop {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = self.handle_server_frame(frame, &tx) {
                            log::error!("server frame failed: {e}");
                            self.lamp.set(SyncStatus::Error);
                        }
                    }
                    None => return,
                },
                frame = replica_rx.recv() => match frame {
                    Some(frame) => {
                        if tx.send(frame).is_err() {
                            return;
                        }
                    }
                    None => return,
                },
                event = watch_rx.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_watch_event(event, &tx) {
                            log::error!("watch event failed: {e}");
                        }
                    }
                    None => return,
                },
            }
        }
    }

    // ─── Bootstrap ────────────────────────────────────────────────────

    /// Reconcile disk against the persisted replica state, then offer every
    /// known doc to the relay.
    fn bootstrap(&mut self, tx: &mpsc::UnboundedSender<Frame>) -> Result<(), AgentError> {
        for doc_id in self.vault.persisted_doc_ids() {
            if let Err(e) = self.replica.ensure_doc(&doc_id) {
                log::error!("loading saved state for {doc_id}: {e}");
            }
        }
        self.replica.ensure_doc(INDEX_DOC_ID)?;
        self.last_entries = self.replica.with_index(index::entries)?;

        for item in self.vault.scan() {
            // A single unreadable file must never abort the walk.
            match item.kind {
                FileKind::Text => {
                    let disk = match std::fs::read_to_string(&item.path) {
                        Ok(content) => content,
                        Err(e) => {
                            log::warn!("skipping {}: {e}", item.path.display());
                            continue;
                        }
                    };
                    if let Err(e) = self.bootstrap_text(tx, &item.doc_id, &disk) {
                        log::error!("bootstrap of {} failed: {e}", item.doc_id);
                    }
                }
                FileKind::Blob => {
                    let bytes = match std::fs::read(&item.path) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            log::warn!("skipping {}: {e}", item.path.display());
                            continue;
                        }
                    };
                    let unchanged = matches!(
                        self.last_entries.get(&item.doc_id),
                        Some(IndexEntry::Blob { hash, .. }) if *hash == blob::hash_bytes(&bytes)
                    );
                    if !unchanged {
                        if let Err(e) =
                            self.assert_blob(tx, &item.doc_id, &bytes, &item.path)
                        {
                            log::error!("bootstrap of {} failed: {e}", item.doc_id);
                        }
                    }
                }
            }
        }

        for doc_id in self.replica.known_docs() {
            self.send_step1(tx, &doc_id);
        }
        Ok(())
    }

    fn bootstrap_text(
        &mut self,
        tx: &mpsc::UnboundedSender<Frame>,
        doc_id: &str,
        disk: &str,
    ) -> Result<(), AgentError> {
        if !self.replica.contains(doc_id) {
            // Discovered while offline: seed silently, then ship the whole
            // state so the log learns about the doc.
            self.replica.set_text(doc_id, disk)?;
            if let Some(state) = self.replica.encode_full_state(doc_id) {
                let _ = tx.send(Frame::new(MsgType::Update, doc_id, state));
            }
        } else if self.replica.get_text(doc_id).as_deref() != Some(disk) {
            // Edited while offline: the listener broadcasts the diff.
            log::info!("offline edit detected in {doc_id}");
            self.replica.update(doc_id, disk)?;
        }

        if self.last_entries.get(doc_id) != Some(&IndexEntry::Text) {
            self.replica
                .with_index(|doc| index::upsert(doc, doc_id, &IndexEntry::Text))?;
            self.last_entries
                .insert(doc_id.to_owned(), IndexEntry::Text);
        }
        Ok(())
    }

    // ─── Inbound frames ───────────────────────────────────────────────

    fn handle_server_frame(
        &mut self,
        frame: Frame,
        tx: &mpsc::UnboundedSender<Frame>,
    ) -> Result<(), AgentError> {
        match frame.msg_type {
            MsgType::Hello => {
                log::info!("server banner: {}", String::from_utf8_lossy(&frame.payload));
                Ok(())
            }
            MsgType::SyncStep2 | MsgType::Update | MsgType::IndexUpdate
                if frame.doc_id == INDEX_DOC_ID =>
            {
                self.replica.apply_remote(INDEX_DOC_ID, &frame.payload)?;
                self.reconcile_index(tx)
            }
            MsgType::SyncStep2 | MsgType::Update => {
                self.apply_text_update(&frame.doc_id, &frame.payload)
            }
            MsgType::IndexUpdate => {
                // Index updates for any other doc id are not a thing.
                log::warn!("INDEX_UPDATE for {}, ignoring", frame.doc_id);
                Ok(())
            }
            MsgType::ErrHistoryLost => self.recover_history_lost(&frame.doc_id, tx),
            MsgType::BlobData => self.handle_blob_data(&frame.payload),
            MsgType::BlobPut => {
                log::debug!("blob upload acknowledged");
                Ok(())
            }
            MsgType::SyncStep1 | MsgType::BlobGet => {
                log::warn!("unexpected {:?} from server", frame.msg_type);
                Ok(())
            }
        }
    }

    fn apply_text_update(&mut self, doc_id: &str, update: &[u8]) -> Result<(), AgentError> {
        if Vault::kind_of(Path::new(doc_id)) != FileKind::Text {
            log::debug!("ignoring text update for non-text id {doc_id}");
            return Ok(());
        }
        let phys = self.vault.abs_path(doc_id);
        let reseeding = self.reseeding.remove(doc_id);

        // Catch edits that landed on disk while we weren't looking, before
        // the remote state overwrites them. Skipped during history-lost
        // recovery, where the server state is ground truth.
        if !reseeding && self.replica.contains(doc_id) && phys.exists() {
            if let (Some(replica_text), Ok(disk)) = (
                self.replica.get_text(doc_id),
                std::fs::read_to_string(&phys),
            ) {
                if disk != replica_text {
                    log::info!("unsynced local changes in {doc_id}, diffing before apply");
                    self.replica.update(doc_id, &disk)?;
                }
            }
        }

        self.replica.apply_remote(doc_id, update)?;
        let Some(text) = self.replica.get_text(doc_id) else {
            return Ok(());
        };
        if let Err(e) = self.write_fenced(&phys, text.as_bytes()) {
            log::error!("writing {} failed: {e}", phys.display());
        }
        Ok(())
    }

    fn recover_history_lost(
        &mut self,
        doc_id: &str,
        tx: &mpsc::UnboundedSender<Frame>,
    ) -> Result<(), AgentError> {
        log::warn!("history lost for {doc_id}; discarding local replica state");
        self.replica.remove_doc(doc_id)?;
        self.replica.ensure_doc(doc_id)?;
        if doc_id == INDEX_DOC_ID {
            self.last_entries.clear();
        } else {
            self.reseeding.insert(doc_id.to_owned());
        }
        self.subscribed.remove(doc_id);
        // Fresh doc, empty vector: the reply re-seeds us from the snapshot.
        self.send_step1(tx, doc_id);
        Ok(())
    }

    fn handle_blob_data(&mut self, payload: &[u8]) -> Result<(), AgentError> {
        if payload.len() < BLOB_HASH_LEN {
            log::warn!("short BLOB_DATA");
            return Ok(());
        }
        let (digest, bytes) = payload.split_at(BLOB_HASH_LEN);
        let hash = hex::encode(digest);

        // A bare hash means the blob is unknown server-side — unless it is
        // the hash of empty content, which proves the bytes.
        if bytes.is_empty() && hash != blob::hash_bytes(b"") {
            log::warn!("blob {hash} missing on relay");
            self.pending_blobs.remove(&hash);
            return Ok(());
        }

        let Some(paths) = self.pending_blobs.remove(&hash) else {
            log::debug!("unsolicited blob {hash}");
            return Ok(());
        };
        for path in paths {
            let phys = self.vault.abs_path(&path);
            if let Err(e) = self.write_fenced(&phys, bytes) {
                log::error!("writing blob {} failed: {e}", phys.display());
            } else {
                log::info!("fetched {path} ({} bytes)", bytes.len());
            }
        }
        Ok(())
    }

    // ─── Index reconciliation ─────────────────────────────────────────

    fn reconcile_index(&mut self, tx: &mpsc::UnboundedSender<Frame>) -> Result<(), AgentError> {
        let current = self.replica.with_index(index::entries)?;

        // Removals: the Index is the only carrier of deletions.
        let removed: Vec<(String, IndexEntry)> = self
            .last_entries
            .iter()
            .filter(|(path, _)| !current.contains_key(*path))
            .map(|(path, entry)| (path.clone(), entry.clone()))
            .collect();
        for (path, entry) in removed {
            self.apply_remote_deletion(&path, &entry)?;
        }

        for (path, entry) in &current {
            match entry {
                IndexEntry::Text => {
                    if !self.replica.contains(path) {
                        self.replica.ensure_doc(path)?;
                    }
                    if !self.subscribed.contains(path) {
                        self.send_step1(tx, path);
                    }
                }
                IndexEntry::Blob { .. } => {
                    if let Err(e) = self.reconcile_blob(tx, path, entry) {
                        log::error!("blob reconciliation for {path} failed: {e}");
                    }
                }
            }
        }

        // Re-read: reconciliation may have asserted entries of its own.
        self.last_entries = self.replica.with_index(index::entries)?;
        Ok(())
    }

    fn apply_remote_deletion(
        &mut self,
        path: &str,
        entry: &IndexEntry,
    ) -> Result<(), AgentError> {
        log::info!("remote deletion of {path}");
        let phys = self.vault.abs_path(path);
        if phys.exists() {
            self.ignore.fence(&phys);
            if let Err(e) = std::fs::remove_file(&phys) {
                log::error!("deleting {} failed: {e}", phys.display());
            }
            self.ignore.release_after_grace(&phys);
        }
        if matches!(entry, IndexEntry::Text) {
            self.replica.remove_doc(path)?;
            self.subscribed.remove(path);
        }
        Ok(())
    }

    fn reconcile_blob(
        &mut self,
        tx: &mpsc::UnboundedSender<Frame>,
        path: &str,
        remote: &IndexEntry,
    ) -> Result<(), AgentError> {
        let IndexEntry::Blob {
            hash: remote_hash,
            mtime: remote_mtime,
            host: remote_host,
            ..
        } = remote
        else {
            return Ok(());
        };

        let phys = self.vault.abs_path(path);
        let local = if phys.exists() {
            match std::fs::read(&phys) {
                Ok(bytes) => Some((
                    LocalBlob {
                        hash: blob::hash_bytes(&bytes),
                        mtime: blob::mtime_millis(&phys),
                    },
                    bytes,
                )),
                Err(e) => {
                    log::warn!("reading {} failed: {e}", phys.display());
                    None
                }
            }
        } else {
            None
        };

        let fate = index::judge_blob(
            path,
            local.as_ref().map(|(meta, _)| meta),
            self.last_entries.get(path),
            remote,
            &self.config.name,
        );

        match fate {
            BlobFate::InSync => {}
            BlobFate::Fetch => self.request_blob(tx, remote_hash, path),
            BlobFate::RemoteWins { loser_path } => {
                log::info!("binary conflict on {path}: remote wins, keeping ours as {loser_path}");
                let loser_phys = self.vault.abs_path(&loser_path);
                self.ignore.fence(&phys);
                self.ignore.fence(&loser_phys);
                if let Err(e) = std::fs::rename(&phys, &loser_phys) {
                    log::error!("renaming loser copy failed: {e}");
                }
                self.ignore.release_after_grace(&phys);
                self.ignore.release_after_grace(&loser_phys);

                if let Some((meta, bytes)) = local {
                    let loser_entry = IndexEntry::blob(
                        meta.hash.clone(),
                        meta.mtime,
                        self.config.name.clone(),
                    );
                    self.send_blob_put(tx, &bytes);
                    self.replica
                        .with_index(|doc| index::upsert(doc, &loser_path, &loser_entry))?;
                }
                self.request_blob(tx, remote_hash, path);
            }
            BlobFate::LocalWins { loser_path } => {
                log::info!("binary conflict on {path}: ours wins, keeping theirs as {loser_path}");
                if let Some((meta, bytes)) = local {
                    // Re-assert our version as the successor of theirs so
                    // the other side fast-forwards instead of re-arbitrating.
                    let winner = IndexEntry::blob_after(
                        meta.hash.clone(),
                        meta.mtime,
                        self.config.name.clone(),
                        Some(remote_hash.clone()),
                    );
                    let loser_entry = IndexEntry::blob(
                        remote_hash.clone(),
                        *remote_mtime,
                        remote_host.clone(),
                    );
                    self.send_blob_put(tx, &bytes);
                    self.replica.with_index(|doc| {
                        index::upsert(doc, path, &winner);
                        index::upsert(doc, &loser_path, &loser_entry);
                    })?;
                }
                self.request_blob(tx, remote_hash, &loser_path);
            }
        }
        Ok(())
    }

    // ─── Watcher events ───────────────────────────────────────────────

    fn handle_watch_event(
        &mut self,
        event: WatchEvent,
        tx: &mpsc::UnboundedSender<Frame>,
    ) -> Result<(), AgentError> {
        let path = event.path;
        if Vault::is_excluded(&path) || self.ignore.should_ignore(&path) {
            return Ok(());
        }
        if path.is_dir() {
            return Ok(());
        }
        let doc_id = match self.vault.doc_id_for(&path) {
            Ok(id) => id,
            Err(_) => return Ok(()),
        };

        if !path.exists() {
            return self.handle_local_deletion(&doc_id);
        }

        match Vault::kind_of(&path) {
            FileKind::Text => {
                let disk = match std::fs::read_to_string(&path) {
                    Ok(content) => content,
                    Err(e) => {
                        log::warn!("reading {} failed: {e}", path.display());
                        return Ok(());
                    }
                };
                self.replica.ensure_doc(&doc_id)?;
                // Subscribe before broadcasting so the relay has a channel
                // for this doc and we see other replicas' edits.
                if !self.subscribed.contains(&doc_id) {
                    self.send_step1(tx, &doc_id);
                }
                if self.replica.get_text(&doc_id).as_deref() != Some(disk.as_str()) {
                    log::info!("local edit in {doc_id}");
                    self.replica.update(&doc_id, &disk)?;
                }
                if self.last_entries.get(&doc_id) != Some(&IndexEntry::Text) {
                    self.replica
                        .with_index(|doc| index::upsert(doc, &doc_id, &IndexEntry::Text))?;
                    self.last_entries.insert(doc_id, IndexEntry::Text);
                }
            }
            FileKind::Blob => {
                let bytes = match std::fs::read(&path) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::warn!("reading {} failed: {e}", path.display());
                        return Ok(());
                    }
                };
                let unchanged = matches!(
                    self.last_entries.get(&doc_id),
                    Some(IndexEntry::Blob { hash, .. }) if *hash == blob::hash_bytes(&bytes)
                );
                if !unchanged {
                    log::info!("local binary change in {doc_id}");
                    self.assert_blob(tx, &doc_id, &bytes, &path)?;
                }
            }
        }
        Ok(())
    }

    fn handle_local_deletion(&mut self, doc_id: &str) -> Result<(), AgentError> {
        let known =
            self.replica.contains(doc_id) || self.last_entries.contains_key(doc_id);
        if !known || doc_id == INDEX_DOC_ID {
            return Ok(());
        }
        log::info!("local deletion of {doc_id}");
        if self.replica.contains(doc_id) {
            self.replica.remove_doc(doc_id)?;
        }
        self.subscribed.remove(doc_id);
        self.replica
            .with_index(|doc| index::remove(doc, doc_id))?;
        self.last_entries.remove(doc_id);
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Upload a binary and record it in the index as the successor of the
    /// version we last observed.
    fn assert_blob(
        &mut self,
        tx: &mpsc::UnboundedSender<Frame>,
        doc_id: &str,
        bytes: &[u8],
        phys: &Path,
    ) -> Result<(), AgentError> {
        let hash = blob::hash_bytes(bytes);
        let prev = match self.last_entries.get(doc_id) {
            Some(IndexEntry::Blob { hash: seen, .. }) if *seen != hash => Some(seen.clone()),
            _ => None,
        };
        let entry = IndexEntry::blob_after(
            hash,
            blob::mtime_millis(phys),
            self.config.name.clone(),
            prev,
        );
        self.send_blob_put(tx, bytes);
        self.replica
            .with_index(|doc| index::upsert(doc, doc_id, &entry))?;
        self.last_entries.insert(doc_id.to_owned(), entry);
        Ok(())
    }

    fn send_step1(&mut self, tx: &mpsc::UnboundedSender<Frame>, doc_id: &str) {
        let sv = self
            .replica
            .state_vector(doc_id)
            .unwrap_or_else(|| StateVector::default().encode_v1());
        let _ = tx.send(Frame::new(MsgType::SyncStep1, doc_id, sv));
        self.subscribed.insert(doc_id.to_owned());
    }

    fn send_blob_put(&self, tx: &mpsc::UnboundedSender<Frame>, bytes: &[u8]) {
        let mut payload = blob::digest_bytes(bytes);
        payload.extend_from_slice(bytes);
        let _ = tx.send(Frame::global(MsgType::BlobPut, payload));
    }

    fn request_blob(&mut self, tx: &mpsc::UnboundedSender<Frame>, hash: &str, path: &str) {
        let Ok(digest) = hex::decode(hash) else {
            log::error!("index entry with bad hash {hash}");
            return;
        };
        let targets = self.pending_blobs.entry(hash.to_owned()).or_default();
        if !targets.iter().any(|p| p == path) {
            targets.push(path.to_owned());
        }
        let _ = tx.send(Frame::global(MsgType::BlobGet, digest));
    }

    /// Write a file the watcher must not report back: fence first, release
    /// after the grace period.
    fn write_fenced(&self, phys: &Path, bytes: &[u8]) -> std::io::Result<()> {
        self.ignore.fence(phys);
        let result = (|| {
            if let Some(parent) = phys.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(phys, bytes)
        })();
        self.ignore.release_after_grace(phys);
        result
    }
}
