//! # inkpad-collab — Shared text + drawing pad synchronization
//!
//! One authority owns the canonical text history and drawing. Participants
//! mirror it locally, push their edits as mutations and pull fresh state
//! whenever the authority tells them something changed.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   Call / Reply    ┌───────────────┐
//! │ SyncClient   │ ◄───────────────► │ SyncServer    │
//! │ + SyncEngine │   Notify(kind)    │ (WebSocket)   │
//! │ + LocalMirror│ ◄──────────────── └──────┬────────┘
//! └──────────────┘                          │
//!                                    ┌──────┴────────┐
//!                                    │ Authority     │
//!                                    ├───────────────┤
//!                                    │ SessionRegistry│
//!                                    │ StateStore    │
//!                                    │ Fanout        │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded SyncMessage)
//! - [`registry`] — Live participants and their notification sinks
//! - [`store`] — Append-only text history and current drawing
//! - [`fanout`] — Concurrent change notifications with dead-peer eviction
//! - [`authority`] — Registry + store + fanout behind one service
//! - [`server`] — WebSocket front end of the authority
//! - [`client`] — WebSocket RPC client
//! - [`mirror`] — A participant's local copy
//! - [`engine`] — Text, drawing and revision reconciliation loops
//! - [`revision`] — Non-destructive rollback
//! - [`directory`] — Server name → endpoint lookup
//!
//! ## Consistency
//!
//! Last writer wins. There is no merging: a mutation replaces the whole
//! text or drawing, and every participant converges on whatever the
//! authority committed last.

pub mod protocol;
pub mod registry;
pub mod store;
pub mod fanout;
pub mod service;
pub mod authority;
pub mod server;
pub mod client;
pub mod mirror;
pub mod engine;
pub mod revision;
pub mod directory;

// Re-exports for convenience
pub use protocol::{
    Call, ChangeKind, Drawing, MutationReceipt, Participant, Point, ProtocolError,
    RemoteError, Reply, Segment, StatePayload, SyncMessage,
};
pub use registry::SessionRegistry;
pub use store::{StateStore, StoreError};
pub use fanout::{DeliveryError, Fanout, FanoutReport, FanoutRound, FanoutStats, NotifySink};
pub use service::{CallError, SyncService};
pub use authority::Authority;
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use client::{ClientConfig, ConnectionState, SyncClient, SyncEvent};
pub use mirror::LocalMirror;
pub use engine::{DrawingTick, EngineConfig, EngineHandle, SyncEngine, TextTick};
pub use revision::{RevisionController, RollbackOutcome};
pub use directory::{Directory, DirectoryError, FileDirectory, InMemoryDirectory};
