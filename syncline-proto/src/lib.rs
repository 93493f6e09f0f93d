//! # syncline-proto — wire protocol for the Syncline document session
//!
//! Every message between a folder agent and the relay is a single binary
//! WebSocket frame with this layout:
//!
//! ```text
//! ┌──────────┬────────────┬─────────┬─────────────┬──────────┐
//! │ msg_type │ doc_id_len │ doc_id  │ payload_len │ payload  │
//! │ 1 byte   │ 2 bytes BE │ UTF-8   │ 4 bytes BE  │ variable │
//! └──────────┴────────────┴─────────┴─────────────┴──────────┘
//! ```
//!
//! The codec owns the envelope only; payloads (CRDT updates, state vectors,
//! blob bytes) are opaque at this layer. `doc_id` is empty for
//! connection-global messages (`HELLO`, blob transfer).

pub mod frame;

pub use frame::{Frame, FrameError, MsgType};

/// Reserved document id carrying the vault file listing.
pub const INDEX_DOC_ID: &str = "__index__";

/// Byte length of a SHA-256 digest as carried in blob payloads.
pub const BLOB_HASH_LEN: usize = 32;
