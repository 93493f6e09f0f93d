//! # syncline-agent — filesystem-backed vault replica
//!
//! The folder agent keeps a directory of notes in sync with a relay:
//!
//! ```text
//! watcher ──► debounce ──► diff ──► CRDT doc ──► UPDATE ──► relay
//!    ▲                                 │
//!    │ (ignore map)                    ▼
//! file write ◄─── remote UPDATE ◄── session
//! ```
//!
//! `.md`/`.txt` files live as text CRDT documents; every other regular file
//! is a content-addressed blob tracked through the vault index document.
//! The watcher and the remote-write path are fenced against each other by a
//! timestamped ignore map so an applied update never loops back as a local
//! edit.
//!
//! ## Modules
//!
//! - [`replica`] — in-memory CRDT documents and their update listeners
//! - [`diff`] — character diff to minimal CRDT text ops (byte offsets)
//! - [`vault`] — directory layout, doc-id mapping, startup scan
//! - [`watcher`] — debounced fs events and the self-echo ignore map
//! - [`index`] — the `__index__` document: the vault's file listing
//! - [`blob`] — content addressing and binary conflict naming
//! - [`net`] — WebSocket connection and reconnect backoff
//! - [`agent`] — the daemon loop tying it all together
//! - [`status`] — the `synced | syncing | error | disconnected` lamp

pub mod agent;
pub mod blob;
pub mod diff;
pub mod index;
pub mod net;
pub mod replica;
pub mod status;
pub mod vault;
pub mod watcher;

pub use agent::{AgentConfig, AgentError, FolderAgent};
pub use replica::ReplicaEngine;
pub use status::SyncStatus;
pub use vault::Vault;
