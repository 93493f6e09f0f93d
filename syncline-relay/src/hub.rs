//! Per-document broadcast fabric.
//!
//! Maps `doc_id → tokio broadcast channel`. Published items carry the origin
//! connection id so forwarders can filter self-echo. Channels are created on
//! first demand — from a subscription *or* from an update for a doc nobody
//! has subscribed to yet — and garbage collected once the last receiver is
//! gone. Nothing durable lives here: a re-created channel replays from the
//! update log via state-vector sync.

use std::collections::HashMap;
use std::sync::Arc;

use syncline_proto::MsgType;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// One fan-out item: message type, raw update payload, origin connection.
pub type Published = (MsgType, Arc<Vec<u8>>, Uuid);

pub struct BroadcastHub {
    channels: RwLock<HashMap<String, broadcast::Sender<Published>>>,
    capacity: usize,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Get or create the channel for a document.
    pub async fn ensure(&self, doc_id: &str) -> broadcast::Sender<Published> {
        // Fast path: read lock.
        {
            let channels = self.channels.read().await;
            if let Some(tx) = channels.get(doc_id) {
                return tx.clone();
            }
        }

        let mut channels = self.channels.write().await;
        // Re-check after lock upgrade.
        if let Some(tx) = channels.get(doc_id) {
            return tx.clone();
        }
        let (tx, _rx) = broadcast::channel(self.capacity);
        channels.insert(doc_id.to_owned(), tx.clone());
        tx
    }

    pub async fn subscribe(&self, doc_id: &str) -> broadcast::Receiver<Published> {
        self.ensure(doc_id).await.subscribe()
    }

    /// Best-effort fan-out. Returns the number of live receivers reached.
    pub async fn publish(
        &self,
        doc_id: &str,
        msg_type: MsgType,
        payload: Arc<Vec<u8>>,
        origin: Uuid,
    ) -> usize {
        let tx = self.ensure(doc_id).await;
        tx.send((msg_type, payload, origin)).unwrap_or(0)
    }

    /// Drop the channel if no receiver is attached. Called when a session
    /// detaches from a doc; returns true if the channel was removed.
    pub async fn gc(&self, doc_id: &str) -> bool {
        let mut channels = self.channels.write().await;
        if let Some(tx) = channels.get(doc_id) {
            if tx.receiver_count() == 0 {
                channels.remove(doc_id);
                return true;
            }
        }
        false
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }
}
