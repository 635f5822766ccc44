//! # canvas-collab: real-time sync engine for collaborative drawings
//!
//! Peers editing the same drawing join a shared room over WebSocket.
//! The room keeps an authoritative scene, reconciles element edits by
//! version, relays images and cursors, and flushes to storage under
//! optimistic versioning.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄────────────────► │ SyncServer  │
//! │ (per user)  │     JSON frames    │ RoomBroker  │
//! └──────┬──────┘                    └──────┬──────┘
//!        │                                  │ one task per drawing
//!        ▼                                  ▼
//! ┌─────────────┐                    ┌─────────────┐
//! │ local scene │                    │ Room        │
//! │ (reconciled)│                    │ document    │──► BroadcastGroup
//! └─────────────┘                    │ presence    │
//!                                    └──────┬──────┘
//!                                           │
//!                                   PersistenceBridge
//!                                           │
//!                                  DrawingStore (RocksDB)
//! ```
//!
//! ## Modules
//!
//! - [`element`]: Scene elements and their versioned header
//! - [`reconcile`]: Last-writer-wins merge on `(version, versionNonce)`
//! - [`files`]: Immutable image files and the content gate
//! - [`presence`]: Roster, cursors, liveness
//! - [`protocol`]: JSON wire messages
//! - [`broadcast`]: Room fan-out with pre-encoded frames
//! - [`room`] / [`broker`]: Room actors and the registry that owns them
//! - [`bridge`]: Load and flush against storage
//! - [`storage`]: RocksDB and in-memory drawing stores
//! - [`server`] / [`client`]: WebSocket endpoints

pub mod bridge;
pub mod broadcast;
pub mod broker;
pub mod client;
pub mod document;
pub mod element;
pub mod files;
pub mod presence;
pub mod protocol;
pub mod reconcile;
pub mod room;
pub mod server;
pub mod stats;
pub mod storage;

pub use bridge::{Backoff, BridgeConfig, BridgeError, FlushOutcome, PersistenceBridge};
pub use broadcast::{BroadcastGroup, BroadcastStats, Envelope};
pub use broker::{BrokerError, PeerSession, RoomBroker, RoomRegistry};
pub use client::{ClientConfig, ClientError, ConnectionState, OfflineQueue, SyncClient, SyncEvent};
pub use document::RoomDocument;
pub use element::{Element, ElementHeader, ElementMap, Shape};
pub use files::{ContentGate, FileAnnouncement, FileBlob, FileMap, FileRejection, FileRelay, GateConfig};
pub use presence::{CursorColor, PeerId, PeerIdentity, PeerInfo, PresenceRegistry, Vec2};
pub use protocol::{ClientMessage, ErrorKind, ProtocolError, ServerMessage, Snapshot};
pub use reconcile::{reconcile, AppliedDelta};
pub use room::{LeaveReason, RoomConfig, RoomHandle};
pub use server::{ConnectionError, ServerConfig, SyncServer};
pub use stats::{ServerStats, SyncStats};
pub use storage::{
    DrawingMetadata, DrawingRecord, DrawingStorage, DrawingStore, DrawingWrite, FileWriteMode, MemoryStore,
    NewDrawing, StoreConfig, StoreError,
};
