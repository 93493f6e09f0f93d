//! Per-connection protocol state machine.
//!
//! States: `GREETING → ACTIVE → CLOSED`. The first frame must be `HELLO`;
//! after that the session answers state-vector offers, persists and fans out
//! updates, and serves blob transfer. One forwarder task exists per
//! (connection, doc) subscription; each one selects on the broadcast channel
//! *and* on the outbound channel closing, so a dead client tears its
//! forwarders down even if nobody ever publishes again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use sha2::{Digest, Sha256};
use syncline_proto::{Frame, MsgType, BLOB_HASH_LEN};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::hub::Published;
use crate::server::RelayState;
use crate::store::StoreError;

/// Outbound frames buffered per connection before backpressure.
const OUTBOUND_BUFFER: usize = 64;

/// Decrements the relay-wide forwarder gauge when the task's future is
/// dropped, whether it returned or was aborted.
struct ForwarderGuard(Arc<AtomicUsize>);

impl ForwarderGuard {
    fn register(gauge: &Arc<AtomicUsize>) -> Self {
        gauge.fetch_add(1, Ordering::SeqCst);
        Self(gauge.clone())
    }
}

impl Drop for ForwarderGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Step {
    Continue,
    /// Protocol violation or dead peer: close the connection.
    Close,
}

struct Session {
    state: RelayState,
    connection_id: Uuid,
    client_name: Option<String>,
    out_tx: mpsc::Sender<Message>,
    forwarders: HashMap<String, JoinHandle<()>>,
}

/// Drive one WebSocket connection to completion.
pub async fn run_session(ws: WebSocketStream<TcpStream>, state: RelayState) {
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);

    // Writer: single owner of the sink. Ends when every sender is gone or
    // the socket errors; its exit is what wakes the forwarders' `closed()`.
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut session = Session {
        state,
        connection_id: Uuid::new_v4(),
        client_name: None,
        out_tx,
        forwarders: HashMap::new(),
    };

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Binary(data)) => match Frame::decode(&data) {
                Ok(frame) => {
                    if let Step::Close = session.handle_frame(frame).await {
                        break;
                    }
                }
                Err(e) => {
                    log::warn!(
                        "connection {}: malformed frame ({e}), closing",
                        session.connection_id
                    );
                    break;
                }
            },
            Ok(Message::Ping(data)) => {
                if session.out_tx.send(Message::Pong(data)).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    session.close().await;
    let _ = writer.await;
}

impl Session {
    async fn handle_frame(&mut self, frame: Frame) -> Step {
        // GREETING: nothing but HELLO is legal.
        if self.client_name.is_none() {
            return match frame.msg_type {
                MsgType::Hello => self.handle_hello(frame.payload).await,
                other => {
                    log::warn!(
                        "connection {}: {other:?} before HELLO, closing",
                        self.connection_id
                    );
                    Step::Close
                }
            };
        }

        match frame.msg_type {
            MsgType::SyncStep1 => self.handle_sync_step1(frame.doc_id, frame.payload).await,
            // An inbound step-2 carries the peer's missing-delta reply;
            // persist and relay it exactly like an update.
            MsgType::SyncStep2 | MsgType::Update | MsgType::IndexUpdate => {
                self.handle_update(frame.msg_type, frame.doc_id, frame.payload)
                    .await
            }
            MsgType::BlobPut => self.handle_blob_put(frame.payload).await,
            MsgType::BlobGet => self.handle_blob_get(frame.payload).await,
            MsgType::Hello | MsgType::BlobData | MsgType::ErrHistoryLost => {
                log::warn!(
                    "connection {}: unexpected {:?} in ACTIVE, closing",
                    self.connection_id,
                    frame.msg_type
                );
                Step::Close
            }
        }
    }

    async fn handle_hello(&mut self, payload: Vec<u8>) -> Step {
        let name = String::from_utf8_lossy(&payload).into_owned();
        log::info!("connection {} greeted as {name:?}", self.connection_id);
        self.client_name = Some(name);
        self.send(Frame::global(
            MsgType::Hello,
            self.state.banner.clone().into_bytes(),
        ))
        .await
    }

    async fn handle_sync_step1(&mut self, doc_id: String, state_vector: Vec<u8>) -> Step {
        self.subscribe(&doc_id).await;

        match self
            .state
            .store
            .encode_diff_async(doc_id.clone(), state_vector)
            .await
        {
            Ok(diff) => self.send(Frame::new(MsgType::SyncStep2, doc_id, diff)).await,
            Err(StoreError::HistoryLost) => {
                log::info!(
                    "connection {}: history lost for {doc_id}",
                    self.connection_id
                );
                self.send(Frame::new(MsgType::ErrHistoryLost, doc_id, Vec::new()))
                    .await
            }
            Err(StoreError::BadPayload(e)) => {
                log::warn!(
                    "connection {}: bad state vector for {doc_id} ({e}), closing",
                    self.connection_id
                );
                Step::Close
            }
            Err(e) => {
                // Store trouble fails this frame, not the connection.
                log::error!("sync step 1 for {doc_id} failed: {e}");
                Step::Continue
            }
        }
    }

    async fn handle_update(&mut self, msg_type: MsgType, doc_id: String, payload: Vec<u8>) -> Step {
        let relay_type = match msg_type {
            MsgType::IndexUpdate => MsgType::IndexUpdate,
            _ => MsgType::Update,
        };

        match self
            .state
            .store
            .append_update_async(doc_id.clone(), payload.clone())
            .await
        {
            Ok(seq) => {
                log::debug!("{doc_id}@{seq} from {}", self.connection_id);
                // The channel must exist even with zero subscribers so a
                // contemporary late subscriber still gets live fan-out.
                self.state
                    .hub
                    .publish(&doc_id, relay_type, Arc::new(payload), self.connection_id)
                    .await;
                Step::Continue
            }
            Err(e) => {
                log::error!("append for {doc_id} failed: {e}");
                Step::Continue
            }
        }
    }

    async fn handle_blob_put(&mut self, payload: Vec<u8>) -> Step {
        if payload.len() < BLOB_HASH_LEN {
            log::warn!(
                "connection {}: short BLOB_PUT, closing",
                self.connection_id
            );
            return Step::Close;
        }
        let (claimed, bytes) = payload.split_at(BLOB_HASH_LEN);
        let digest = Sha256::digest(bytes);
        if digest.as_slice() != claimed {
            log::warn!(
                "connection {}: BLOB_PUT hash mismatch, closing",
                self.connection_id
            );
            return Step::Close;
        }

        let hash = hex::encode(claimed);
        match self
            .state
            .store
            .put_blob_async(hash.clone(), bytes.to_vec())
            .await
        {
            Ok(()) => {
                log::debug!("stored blob {hash} ({} bytes)", bytes.len());
                self.send(Frame::global(MsgType::BlobPut, claimed.to_vec()))
                    .await
            }
            Err(e) => {
                log::error!("blob store failed: {e}");
                Step::Continue
            }
        }
    }

    async fn handle_blob_get(&mut self, payload: Vec<u8>) -> Step {
        if payload.len() != BLOB_HASH_LEN {
            log::warn!(
                "connection {}: bad BLOB_GET length, closing",
                self.connection_id
            );
            return Step::Close;
        }
        let hash = hex::encode(&payload);
        let mut reply = payload;
        match self.state.store.get_blob_async(hash.clone()).await {
            Ok(Some(bytes)) => reply.extend_from_slice(&bytes),
            Ok(None) => log::debug!("blob {hash} not found"),
            Err(e) => {
                log::error!("blob read failed: {e}");
                return Step::Continue;
            }
        }
        self.send(Frame::global(MsgType::BlobData, reply)).await
    }

    /// Attach a forwarder for `doc_id` unless one is already running.
    async fn subscribe(&mut self, doc_id: &str) {
        if self.forwarders.contains_key(doc_id) {
            return;
        }
        let rx = self.state.hub.subscribe(doc_id).await;
        let guard = ForwarderGuard::register(&self.state.forwarders);
        let handle = tokio::spawn(forward(
            rx,
            self.out_tx.clone(),
            self.connection_id,
            doc_id.to_owned(),
            guard,
        ));
        self.forwarders.insert(doc_id.to_owned(), handle);
    }

    async fn send(&self, frame: Frame) -> Step {
        let bytes = match frame.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("frame encode failed: {e}");
                return Step::Close;
            }
        };
        if self.out_tx.send(Message::Binary(bytes)).await.is_err() {
            return Step::Close;
        }
        Step::Continue
    }

    /// CLOSED: cancel forwarders and release idle channels. Durable state
    /// needs no cleanup — it is already in the log.
    async fn close(mut self) {
        let docs: Vec<String> = self.forwarders.keys().cloned().collect();
        for (_, handle) in self.forwarders.drain() {
            handle.abort();
            // Completes once the future is dropped and its receiver released.
            let _ = handle.await;
        }
        for doc_id in docs {
            self.state.hub.gc(&doc_id).await;
        }
        if let Some(name) = &self.client_name {
            log::info!("connection {} ({name}) closed", self.connection_id);
        }
    }
}

async fn forward(
    mut rx: broadcast::Receiver<Published>,
    out_tx: mpsc::Sender<Message>,
    connection_id: Uuid,
    doc_id: String,
    _guard: ForwarderGuard,
) {
    loop {
        tokio::select! {
            // Waiting on recv() alone leaks this task when the client goes
            // away and the doc never sees another publish.
            _ = out_tx.closed() => break,
            item = rx.recv() => match item {
                Ok((msg_type, payload, origin)) => {
                    if origin == connection_id {
                        continue; // no self-echo
                    }
                    let frame = Frame::new(msg_type, doc_id.clone(), payload.as_ref().clone());
                    let bytes = match frame.encode() {
                        Ok(bytes) => bytes,
                        Err(_) => break,
                    };
                    if out_tx.send(Message::Binary(bytes)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // Slow subscriber: drop it from the channel. The client
                    // recovers everything from the log on its next sync.
                    log::warn!(
                        "connection {connection_id} lagged {n} updates on {doc_id}, unsubscribing"
                    );
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
