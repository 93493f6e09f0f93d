//! # syncline-relay — central sync relay for Syncline vaults
//!
//! ```text
//! Agent A ──┐                       ┌──────────────┐
//!            ├── Session ── Hub ────│ UpdateStore  │
//! Agent B ──┘      │        │       │ (SQLite)     │
//!                  │        │       └──────┬───────┘
//!                  │        │              │
//!                  │   broadcast      ┌────┴───────┐
//!                  │   per doc_id     │ Compaction │
//!                  ▼                  │ (periodic) │
//!             forwarder tasks         └────────────┘
//! ```
//!
//! The relay owns the authoritative per-document update log and fans live
//! updates out to subscribed sessions. Everything a session needs after a
//! reconnect is replayable from the log; broadcast channels are purely a
//! live-delivery optimization.
//!
//! ## Modules
//!
//! - [`store`] — append-only update log, snapshots and blobs in one SQLite file
//! - [`hub`] — per-document broadcast channel registry
//! - [`compaction`] — background squashing of update runs into snapshots
//! - [`session`] — per-connection protocol state machine
//! - [`server`] — WebSocket accept loop and configuration

pub mod compaction;
pub mod hub;
pub mod server;
pub mod session;
pub mod store;

pub use compaction::{CompactionEngine, CompactionSettings};
pub use hub::BroadcastHub;
pub use server::{RelayConfig, RelayError, RelayServer, RelayState};
pub use store::{DocMaterial, StoreError, UpdateStore};
