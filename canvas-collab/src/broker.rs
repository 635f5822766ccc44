//! Room broker: maps drawing ids to live room tasks and admits peers.
//!
//! At most one room exists per drawing. The registry lock is only held to
//! look up or insert a handle; loading happens inside the new room task, so
//! peers joining a drawing that is still loading simply queue behind it.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::bridge::PersistenceBridge;
use crate::broadcast::Envelope;
use crate::files::FileBlob;
use crate::presence::{PeerId, PeerIdentity, Vec2};
use crate::protocol::{ClientMessage, ErrorKind, Snapshot};
use crate::room::{spawn_room, LeaveReason, RoomConfig, RoomHandle};
use crate::stats::{ServerStats, SyncStats};
use crate::storage::DrawingStorage;

/// Attempts to re-join when the room was tearing down underneath us.
const JOIN_ATTEMPTS: usize = 3;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    #[error("Drawing {drawing_id} unavailable: {reason}")]
    RoomUnavailable { drawing_id: Uuid, reason: String },

    #[error("Room {0} is closing")]
    RoomClosing(Uuid),

    #[error("Loading drawing {0} timed out")]
    LoadTimeout(Uuid),

    #[error("Peer {0} is not in this room")]
    PeerUnknown(PeerId),

    #[error("Peer {0} already joined")]
    AlreadyJoined(PeerId),

    #[error("Persistence failed: {0}")]
    Persistence(String),
}

impl BrokerError {
    /// Wire error category reported to the peer.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::RoomUnavailable { .. } => ErrorKind::RoomUnavailable,
            BrokerError::RoomClosing(_) => ErrorKind::RoomClosing,
            BrokerError::LoadTimeout(_) => ErrorKind::JoinTimeout,
            BrokerError::PeerUnknown(_) | BrokerError::AlreadyJoined(_) => ErrorKind::Protocol,
            BrokerError::Persistence(_) => ErrorKind::Internal,
        }
    }
}

/// drawing id → live room.
#[derive(Clone, Default)]
pub struct RoomRegistry {
    rooms: Arc<Mutex<HashMap<Uuid, RoomHandle>>>,
    next_instance: Arc<AtomicU64>,
}

impl RoomRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, RoomHandle>> {
        // A poisoned map is still consistent: every mutation is a single insert or remove.
        self.rooms.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Existing live room, or a freshly spawned one.
    pub(crate) fn get_or_spawn<F>(&self, drawing_id: Uuid, spawn: F) -> RoomHandle
    where
        F: FnOnce(u64) -> RoomHandle,
    {
        let mut rooms = self.lock();
        if let Some(handle) = rooms.get(&drawing_id) {
            if !handle.is_closed() {
                return handle.clone();
            }
        }
        let instance = self.next_instance.fetch_add(1, Ordering::Relaxed);
        let handle = spawn(instance);
        rooms.insert(drawing_id, handle.clone());
        handle
    }

    /// Remove the entry only if it still belongs to `instance`.
    pub(crate) fn remove_if_same(&self, drawing_id: Uuid, instance: u64) -> bool {
        let mut rooms = self.lock();
        match rooms.get(&drawing_id) {
            Some(handle) if handle.instance() == instance => {
                rooms.remove(&drawing_id);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, drawing_id: Uuid) -> Option<RoomHandle> {
        self.lock().get(&drawing_id).cloned()
    }

    pub fn handles(&self) -> Vec<RoomHandle> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Entry point for peers: resolves drawings to rooms.
#[derive(Clone)]
pub struct RoomBroker {
    registry: RoomRegistry,
    bridge: PersistenceBridge,
    config: RoomConfig,
    stats: Arc<SyncStats>,
}

impl RoomBroker {
    pub fn new(storage: Arc<dyn DrawingStorage>, config: RoomConfig) -> Self {
        Self {
            registry: RoomRegistry::default(),
            bridge: PersistenceBridge::new(storage, config.bridge_config()),
            config,
            stats: Arc::new(SyncStats::default()),
        }
    }

    pub fn storage(&self) -> &Arc<dyn DrawingStorage> {
        self.bridge.storage()
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    pub(crate) fn sync_stats(&self) -> &Arc<SyncStats> {
        &self.stats
    }

    pub fn stats(&self) -> ServerStats {
        self.stats.snapshot()
    }

    /// Live room for a drawing, if one exists.
    pub fn room(&self, drawing_id: Uuid) -> Option<RoomHandle> {
        self.registry.get(drawing_id)
    }

    pub fn room_count(&self) -> usize {
        self.registry.len()
    }

    fn open_room(&self, drawing_id: Uuid) -> RoomHandle {
        self.registry.get_or_spawn(drawing_id, |instance| {
            log::debug!("Spawning room {drawing_id} (instance {instance})");
            spawn_room(
                drawing_id,
                instance,
                self.config.clone(),
                self.bridge.clone(),
                self.registry.clone(),
                self.stats.clone(),
            )
        })
    }

    /// Admit a new peer to `drawing_id`, loading the drawing if needed.
    pub async fn join(&self, drawing_id: Uuid, identity: PeerIdentity) -> Result<PeerSession, BrokerError> {
        let peer_id = Uuid::new_v4();

        for attempt in 0..JOIN_ATTEMPTS {
            let room = self.open_room(drawing_id);
            match room.join(peer_id, identity.clone()).await {
                Ok(accepted) => {
                    return Ok(PeerSession {
                        peer_id,
                        drawing_id,
                        identity: accepted.identity,
                        snapshot: Some(accepted.snapshot),
                        receiver: Some(accepted.receiver),
                        room,
                    });
                }
                Err(BrokerError::RoomClosing(_)) => {
                    // Lost a race with teardown; the next attempt opens a fresh room.
                    log::debug!("Room {drawing_id} closing during join (attempt {})", attempt + 1);
                    self.registry.remove_if_same(drawing_id, room.instance());
                }
                Err(e) => return Err(e),
            }
        }
        Err(BrokerError::RoomClosing(drawing_id))
    }

    /// Flush every dirty room. Returns how many flushes failed.
    pub async fn flush_all(&self) -> usize {
        let mut failed = 0;
        for handle in self.registry.handles() {
            if let Err(e) = handle.flush().await {
                log::warn!("Flush of room {} failed: {e}", handle.drawing_id());
                failed += 1;
            }
        }
        failed
    }

    /// Final flush and stop for every room.
    pub async fn shutdown(&self) {
        let handles = self.registry.handles();
        log::info!("Shutting down {} rooms", handles.len());
        for handle in handles {
            handle.shutdown().await;
        }
    }
}

/// A joined peer's view of its room.
pub struct PeerSession {
    peer_id: PeerId,
    drawing_id: Uuid,
    identity: PeerIdentity,
    snapshot: Option<Snapshot>,
    receiver: Option<broadcast::Receiver<Envelope>>,
    room: RoomHandle,
}

impl PeerSession {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn drawing_id(&self) -> Uuid {
        self.drawing_id
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    /// Snapshot taken at admission. Can only be taken once.
    pub fn take_snapshot(&mut self) -> Option<Snapshot> {
        self.snapshot.take()
    }

    /// Outbound fan-out for this peer. Can only be taken once.
    pub fn take_receiver(&mut self) -> Option<broadcast::Receiver<Envelope>> {
        self.receiver.take()
    }

    pub fn room(&self) -> &RoomHandle {
        &self.room
    }

    /// Forward a decoded client frame to the room.
    pub async fn relay(&self, message: ClientMessage) -> Result<(), BrokerError> {
        match message {
            ClientMessage::Update(update) => self.update(update.elements).await,
            ClientMessage::File(blob) => self.file(blob).await,
            ClientMessage::Presence(cursor) => self.cursor(
                Vec2::new(cursor.cursor_x, cursor.cursor_y),
                cursor.identity,
            ),
            ClientMessage::Heartbeat => self.heartbeat().await,
            ClientMessage::Join(_) => Err(BrokerError::AlreadyJoined(self.peer_id)),
        }
    }

    pub async fn update(&self, elements: Vec<Value>) -> Result<(), BrokerError> {
        self.room.update(self.peer_id, elements).await
    }

    pub async fn file(&self, blob: FileBlob) -> Result<(), BrokerError> {
        self.room.file(self.peer_id, blob).await
    }

    pub fn cursor(&self, position: Vec2, identity: Option<PeerIdentity>) -> Result<(), BrokerError> {
        self.room.cursor(self.peer_id, position, identity)
    }

    pub async fn heartbeat(&self) -> Result<(), BrokerError> {
        self.room.heartbeat(self.peer_id).await
    }

    /// Fresh snapshot after the outbound stream fell behind.
    pub async fn resync(&self, skipped: u64) -> Result<Snapshot, BrokerError> {
        self.room.resync(self.peer_id, skipped).await
    }

    pub async fn leave(self, reason: LeaveReason) {
        // A room that already closed has nothing left to clean up.
        let _ = self.room.leave(self.peer_id, reason).await;
    }
}
