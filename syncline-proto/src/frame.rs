//! Binary frame envelope: encode/decode with strict bounds checking.

use thiserror::Error;

/// Message types of the document session protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    /// State vector offer; opens a per-doc subscription.
    SyncStep1 = 0,
    /// Diff reply to a `SyncStep1`.
    SyncStep2 = 1,
    /// Incremental CRDT update.
    Update = 2,
    /// CRDT update for the vault index document.
    IndexUpdate = 3,
    /// Content-addressed blob upload (hash ‖ bytes).
    BlobPut = 4,
    /// Blob fetch request (hash).
    BlobGet = 5,
    /// Blob fetch reply (hash ‖ bytes, bare hash when missing).
    BlobData = 6,
    /// Connection greeting (client name / server banner).
    Hello = 7,
    /// The peer's state vector predates the compaction horizon.
    ErrHistoryLost = 8,
}

impl MsgType {
    fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => MsgType::SyncStep1,
            1 => MsgType::SyncStep2,
            2 => MsgType::Update,
            3 => MsgType::IndexUpdate,
            4 => MsgType::BlobPut,
            5 => MsgType::BlobGet,
            6 => MsgType::BlobData,
            7 => MsgType::Hello,
            8 => MsgType::ErrHistoryLost,
            _ => return None,
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Truncated input, a length field overrunning the buffer, trailing
    /// garbage, or a non-UTF-8 doc id.
    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    #[error("unknown message type {0}")]
    UnknownType(u8),

    /// Doc ids longer than `u16::MAX` bytes cannot be represented.
    #[error("doc id too long ({0} bytes)")]
    DocIdTooLong(usize),
}

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MsgType,
    /// Vault-relative document id; empty for connection-global messages.
    pub doc_id: String,
    pub payload: Vec<u8>,
}

/// Fixed header size: type byte + doc_id_len + payload_len.
const HEADER_LEN: usize = 1 + 2 + 4;

impl Frame {
    pub fn new(msg_type: MsgType, doc_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            doc_id: doc_id.into(),
            payload,
        }
    }

    /// A frame with an empty doc id (`HELLO`, blob transfer).
    pub fn global(msg_type: MsgType, payload: Vec<u8>) -> Self {
        Self::new(msg_type, String::new(), payload)
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let doc_id = self.doc_id.as_bytes();
        if doc_id.len() > u16::MAX as usize {
            return Err(FrameError::DocIdTooLong(doc_id.len()));
        }

        let mut buf = Vec::with_capacity(HEADER_LEN + doc_id.len() + self.payload.len());
        buf.push(self.msg_type as u8);
        buf.extend_from_slice(&(doc_id.len() as u16).to_be_bytes());
        buf.extend_from_slice(doc_id);
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < 3 {
            return Err(FrameError::Malformed("shorter than minimal header"));
        }

        let msg_type =
            MsgType::from_u8(buf[0]).ok_or(FrameError::UnknownType(buf[0]))?;

        let doc_id_len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
        let doc_id_end = 3usize
            .checked_add(doc_id_len)
            .ok_or(FrameError::Malformed("doc id length overflow"))?;
        if buf.len() < doc_id_end + 4 {
            return Err(FrameError::Malformed("doc id or payload length truncated"));
        }

        let doc_id = std::str::from_utf8(&buf[3..doc_id_end])
            .map_err(|_| FrameError::Malformed("doc id is not UTF-8"))?
            .to_owned();

        let payload_len = u32::from_be_bytes([
            buf[doc_id_end],
            buf[doc_id_end + 1],
            buf[doc_id_end + 2],
            buf[doc_id_end + 3],
        ]) as usize;

        let payload_start = doc_id_end + 4;
        let payload_end = payload_start
            .checked_add(payload_len)
            .ok_or(FrameError::Malformed("payload length overflow"))?;
        if buf.len() < payload_end {
            return Err(FrameError::Malformed("payload truncated"));
        }
        if buf.len() > payload_end {
            return Err(FrameError::Malformed("trailing bytes after payload"));
        }

        Ok(Self {
            msg_type,
            doc_id,
            payload: buf[payload_start..payload_end].to_vec(),
        })
    }
}
