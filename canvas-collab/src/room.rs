//! Room actor: one task per live drawing.
//!
//! ```text
//!            RoomHandle (cloneable)
//!                  │ mpsc<RoomCommand>
//!                  ▼
//! ┌─────────────── room task ────────────────┐
//! │ load snapshot ─► RoomDocument            │
//! │ loop select! {                           │
//! │   command     → reconcile / files /      │
//! │                 presence / roster        │
//! │   flush timer → PersistenceBridge::flush │
//! │   sweep       → evict silent peers       │
//! │   cursor tick → coalesced cursors        │
//! │   grace timer → final flush, teardown    │
//! │ }                                        │
//! └──────────────────┬───────────────────────┘
//!                    │ BroadcastGroup
//!                    ▼
//!             peer connections
//! ```
//!
//! All room state is owned by the task, so reconciliation, file acceptance
//! and flushes of one room run strictly one at a time while rooms proceed
//! independently.

use serde_json::Value;
use std::future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::bridge::{Backoff, BridgeConfig, BridgeError, PersistenceBridge};
use crate::broadcast::{BroadcastGroup, BroadcastStats, Envelope};
use crate::broker::{BrokerError, RoomRegistry};
use crate::document::RoomDocument;
use crate::element::Element;
use crate::files::{ContentGate, FileAnnouncement, FileBlob, GateConfig};
use crate::presence::{PeerId, PeerIdentity, PeerInfo, PresenceRegistry, Vec2};
use crate::protocol::{ElementsUpdate, PeerCursor, ServerMessage, Snapshot};
use crate::stats::SyncStats;
use crate::storage::StoreError;

/// Room timing and capacity knobs.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Quiet period after the last accepted change before a flush.
    pub flush_debounce: Duration,
    /// Upper bound between the first unflushed change and its flush.
    pub max_flush_delay: Duration,
    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
    /// Empty-room wait before the final flush and teardown.
    pub grace_period: Duration,
    pub load_timeout: Duration,
    pub cursor_interval: Duration,
    pub command_queue: usize,
    pub broadcast_capacity: usize,
    pub max_conflict_retries: usize,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Consecutive flush failures before peers are warned.
    pub warn_after_failures: u32,
    pub gate: GateConfig,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            flush_debounce: Duration::from_secs(2),
            max_flush_delay: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            grace_period: Duration::from_secs(5),
            load_timeout: Duration::from_secs(10),
            cursor_interval: Duration::from_millis(33),
            command_queue: 1024,
            broadcast_capacity: 256,
            max_conflict_retries: 5,
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            warn_after_failures: 3,
            gate: GateConfig::default(),
        }
    }
}

impl RoomConfig {
    /// Short timers for tests.
    pub fn for_testing() -> Self {
        Self {
            flush_debounce: Duration::from_millis(50),
            max_flush_delay: Duration::from_millis(500),
            heartbeat_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_millis(100),
            grace_period: Duration::from_millis(100),
            load_timeout: Duration::from_secs(2),
            backoff_initial: Duration::from_millis(20),
            backoff_max: Duration::from_millis(200),
            ..Self::default()
        }
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            load_timeout: self.load_timeout,
            max_conflict_retries: self.max_conflict_retries,
        }
    }
}

/// Why a peer left its room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    Disconnected,
    TimedOut,
}

/// A peer's admission into a room.
#[derive(Debug)]
pub struct JoinAccepted {
    pub identity: PeerIdentity,
    pub snapshot: Snapshot,
    /// Subscribed before the snapshot was taken: nothing falls in between.
    pub receiver: broadcast::Receiver<Envelope>,
}

pub(crate) enum RoomCommand {
    Join {
        peer_id: PeerId,
        identity: PeerIdentity,
        respond_to: oneshot::Sender<Result<JoinAccepted, BrokerError>>,
    },
    Leave {
        peer_id: PeerId,
        reason: LeaveReason,
    },
    Update {
        peer_id: PeerId,
        elements: Vec<Value>,
    },
    File {
        peer_id: PeerId,
        blob: FileBlob,
    },
    Cursor {
        peer_id: PeerId,
        position: Vec2,
        identity: Option<PeerIdentity>,
    },
    Heartbeat {
        peer_id: PeerId,
    },
    Resync {
        peer_id: PeerId,
        /// Frames the peer missed.
        skipped: u64,
        respond_to: oneshot::Sender<Result<Snapshot, BrokerError>>,
    },
    Flush {
        respond_to: oneshot::Sender<Result<u64, BrokerError>>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

impl RoomCommand {
    /// Answer a command that reached a room which cannot serve it.
    fn reject(self, error: BrokerError) {
        match self {
            RoomCommand::Join { respond_to, .. } => {
                let _ = respond_to.send(Err(error));
            }
            RoomCommand::Resync { respond_to, .. } => {
                let _ = respond_to.send(Err(error));
            }
            RoomCommand::Flush { respond_to } => {
                let _ = respond_to.send(Err(error));
            }
            RoomCommand::Shutdown { respond_to } => {
                let _ = respond_to.send(());
            }
            _ => {}
        }
    }
}

/// Cloneable handle to a room task.
#[derive(Clone)]
pub struct RoomHandle {
    drawing_id: Uuid,
    instance: u64,
    sender: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    pub fn drawing_id(&self) -> Uuid {
        self.drawing_id
    }

    pub(crate) fn instance(&self) -> u64 {
        self.instance
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    async fn send(&self, command: RoomCommand) -> Result<(), BrokerError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| BrokerError::RoomClosing(self.drawing_id))
    }

    pub async fn join(&self, peer_id: PeerId, identity: PeerIdentity) -> Result<JoinAccepted, BrokerError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomCommand::Join {
            peer_id,
            identity,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| BrokerError::RoomClosing(self.drawing_id))?
    }

    pub async fn leave(&self, peer_id: PeerId, reason: LeaveReason) -> Result<(), BrokerError> {
        self.send(RoomCommand::Leave { peer_id, reason }).await
    }

    pub async fn update(&self, peer_id: PeerId, elements: Vec<Value>) -> Result<(), BrokerError> {
        self.send(RoomCommand::Update { peer_id, elements }).await
    }

    pub async fn file(&self, peer_id: PeerId, blob: FileBlob) -> Result<(), BrokerError> {
        self.send(RoomCommand::File { peer_id, blob }).await
    }

    /// Best-effort: dropped when the room's queue is full.
    pub fn cursor(
        &self,
        peer_id: PeerId,
        position: Vec2,
        identity: Option<PeerIdentity>,
    ) -> Result<(), BrokerError> {
        match self.sender.try_send(RoomCommand::Cursor {
            peer_id,
            position,
            identity,
        }) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(BrokerError::RoomClosing(self.drawing_id)),
        }
    }

    pub async fn heartbeat(&self, peer_id: PeerId) -> Result<(), BrokerError> {
        self.send(RoomCommand::Heartbeat { peer_id }).await
    }

    pub async fn resync(&self, peer_id: PeerId, skipped: u64) -> Result<Snapshot, BrokerError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomCommand::Resync {
            peer_id,
            skipped,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| BrokerError::RoomClosing(self.drawing_id))?
    }

    /// Flush now if dirty. Returns the stored version.
    pub async fn flush(&self) -> Result<u64, BrokerError> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomCommand::Flush { respond_to: tx }).await?;
        rx.await.map_err(|_| BrokerError::RoomClosing(self.drawing_id))?
    }

    /// Final flush, then stop. Waits until the task has finished.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send(RoomCommand::Shutdown { respond_to: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// Spawn a room task for `drawing_id`. The task loads the drawing itself.
pub(crate) fn spawn_room(
    drawing_id: Uuid,
    instance: u64,
    config: RoomConfig,
    bridge: PersistenceBridge,
    registry: RoomRegistry,
    stats: Arc<SyncStats>,
) -> RoomHandle {
    let (sender, receiver) = mpsc::channel(config.command_queue.max(1));
    tokio::spawn(run_room(drawing_id, instance, config, bridge, registry, stats, receiver));
    RoomHandle {
        drawing_id,
        instance,
        sender,
    }
}

async fn run_room(
    drawing_id: Uuid,
    instance: u64,
    config: RoomConfig,
    bridge: PersistenceBridge,
    registry: RoomRegistry,
    stats: Arc<SyncStats>,
    mut commands: mpsc::Receiver<RoomCommand>,
) {
    let record = match bridge.load_snapshot(drawing_id).await {
        Ok(record) => record,
        Err(e) => {
            log::warn!("Room {drawing_id} unavailable: {e}");
            registry.remove_if_same(drawing_id, instance);
            commands.close();
            let error = match e {
                BridgeError::Timeout(_) => BrokerError::LoadTimeout(drawing_id),
                other => BrokerError::RoomUnavailable {
                    drawing_id,
                    reason: other.to_string(),
                },
            };
            while let Some(command) = commands.recv().await {
                command.reject(error.clone());
            }
            return;
        }
    };

    log::info!(
        "Opened room {drawing_id} at version {} with {} elements",
        record.version,
        record.elements.len()
    );
    SyncStats::incr(&stats.rooms_created);
    SyncStats::incr(&stats.active_rooms);

    let room = Room {
        drawing_id,
        instance,
        doc: RoomDocument::from_record(record, ContentGate::new(config.gate.clone())),
        presence: PresenceRegistry::new(config.cursor_interval),
        group: BroadcastGroup::new(config.broadcast_capacity),
        backoff: Backoff::new(config.backoff_initial, config.backoff_max),
        config,
        bridge,
        registry,
        stats: stats.clone(),
        first_change: None,
        last_change: None,
        retry_at: None,
        warned: false,
        empty_since: Some(Instant::now()),
        shutdown_waiters: Vec::new(),
    };
    let fanout = room.run(commands).await;

    SyncStats::decr(&stats.active_rooms);
    log::info!(
        "Closed room {drawing_id} ({} frames sent, {} lagged)",
        fanout.messages_sent,
        fanout.messages_lagged
    );
}

/// Sleep until `deadline`, or forever if there is none.
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => future::pending().await,
    }
}

enum Flow {
    Continue,
    Stop,
}

struct Room {
    drawing_id: Uuid,
    instance: u64,
    config: RoomConfig,
    doc: RoomDocument,
    presence: PresenceRegistry,
    group: BroadcastGroup,
    bridge: PersistenceBridge,
    registry: RoomRegistry,
    stats: Arc<SyncStats>,
    first_change: Option<Instant>,
    last_change: Option<Instant>,
    /// Next flush attempt after a failure.
    retry_at: Option<Instant>,
    backoff: Backoff,
    warned: bool,
    /// Set while the room has no peers.
    empty_since: Option<Instant>,
    /// Answered once the room has fully closed.
    shutdown_waiters: Vec<oneshot::Sender<()>>,
}

impl Room {
    async fn run(mut self, mut commands: mpsc::Receiver<RoomCommand>) -> BroadcastStats {
        let mut sweep = interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cursor_tick = interval(self.config.cursor_interval);
        cursor_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let flush_at = self.flush_deadline();
            let teardown_at = self.teardown_deadline();

            let flow = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => {
                        // Every handle is gone, including the registry's.
                        let _ = self.flush_if_dirty().await;
                        Flow::Stop
                    }
                },
                _ = sleep_until_opt(flush_at) => match self.flush_if_dirty().await {
                    Err(BridgeError::Store(StoreError::NotFound(_))) if self.presence.is_empty() => Flow::Stop,
                    _ => Flow::Continue,
                },
                _ = sweep.tick() => {
                    self.sweep();
                    Flow::Continue
                }
                _ = cursor_tick.tick(), if self.presence.has_pending() => {
                    self.emit_pending_cursors();
                    Flow::Continue
                }
                _ = sleep_until_opt(teardown_at) => self.try_teardown().await,
            };

            if let Flow::Stop = flow {
                self.close(&mut commands).await;
                for waiter in self.shutdown_waiters.drain(..) {
                    let _ = waiter.send(());
                }
                return self.group.stats();
            }
        }
    }

    fn flush_deadline(&self) -> Option<Instant> {
        if let Some(retry_at) = self.retry_at {
            return Some(retry_at);
        }
        if !self.doc.is_dirty() {
            return None;
        }
        let debounced = self.last_change.map(|t| t + self.config.flush_debounce);
        let capped = self.first_change.map(|t| t + self.config.max_flush_delay);
        match (debounced, capped) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b).or_else(|| Some(Instant::now())),
        }
    }

    fn teardown_deadline(&self) -> Option<Instant> {
        // No teardown attempts while a failed flush is backing off.
        if self.retry_at.is_some() || !self.presence.is_empty() {
            return None;
        }
        self.empty_since.map(|t| t + self.config.grace_period)
    }

    fn note_change(&mut self) {
        let now = Instant::now();
        self.last_change = Some(now);
        self.first_change.get_or_insert(now);
    }

    fn broadcast(&self, origin: Option<PeerId>, msg: &ServerMessage) {
        if let Err(e) = self.group.broadcast(origin, msg) {
            log::error!("Room {}: failed to encode {}: {e}", self.drawing_id, msg.kind());
        }
    }

    fn roster(&self) -> Vec<PeerInfo> {
        self.presence.roster()
    }

    async fn handle(&mut self, command: RoomCommand) -> Flow {
        match command {
            RoomCommand::Join {
                peer_id,
                identity,
                respond_to,
            } => self.on_join(peer_id, identity, respond_to),
            RoomCommand::Leave { peer_id, reason } => self.on_leave(peer_id, reason),
            RoomCommand::Update { peer_id, elements } => self.on_update(peer_id, elements),
            RoomCommand::File { peer_id, blob } => self.on_file(peer_id, blob),
            RoomCommand::Cursor {
                peer_id,
                position,
                identity,
            } => {
                let now = std::time::Instant::now();
                if let Some(update) = self.presence.update_cursor(&peer_id, position, identity, now) {
                    self.broadcast(Some(peer_id), &ServerMessage::Presence(PeerCursor::from(update)));
                }
            }
            RoomCommand::Heartbeat { peer_id } => {
                if self.presence.touch(&peer_id, std::time::Instant::now()) {
                    if let Err(e) = self.group.send_to(peer_id, &ServerMessage::HeartbeatAck) {
                        log::error!("Room {}: heartbeat ack failed: {e}", self.drawing_id);
                    }
                }
            }
            RoomCommand::Resync {
                peer_id,
                skipped,
                respond_to,
            } => {
                log::debug!("Room {}: resync for {peer_id} after {skipped} missed frames", self.drawing_id);
                self.group.record_lag(skipped);
                let reply = if self.presence.touch(&peer_id, std::time::Instant::now()) {
                    Ok(self.doc.snapshot(self.roster()))
                } else {
                    Err(BrokerError::PeerUnknown(peer_id))
                };
                let _ = respond_to.send(reply);
            }
            RoomCommand::Flush { respond_to } => {
                let result = self
                    .flush_if_dirty()
                    .await
                    .map_err(|e| BrokerError::Persistence(e.to_string()));
                let _ = respond_to.send(result);
            }
            RoomCommand::Shutdown { respond_to } => {
                if let Err(e) = self.flush_if_dirty().await {
                    log::error!(
                        "Room {}: final flush failed on shutdown, unflushed changes lost: {e}",
                        self.drawing_id
                    );
                }
                self.shutdown_waiters.push(respond_to);
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn on_join(
        &mut self,
        peer_id: PeerId,
        identity: PeerIdentity,
        respond_to: oneshot::Sender<Result<JoinAccepted, BrokerError>>,
    ) {
        let receiver = self.group.subscribe();
        let now = std::time::Instant::now();
        let identity = match self.presence.join(peer_id, identity, now) {
            Some(identity) => identity,
            None => {
                let _ = respond_to.send(Err(BrokerError::AlreadyJoined(peer_id)));
                return;
            }
        };
        let snapshot = self.doc.snapshot(self.roster());
        self.empty_since = None;

        let accepted = JoinAccepted {
            identity: identity.clone(),
            snapshot,
            receiver,
        };
        if respond_to.send(Ok(accepted)).is_err() {
            // Joiner went away before admission completed.
            self.presence.leave(&peer_id);
            self.mark_empty_if_needed();
            return;
        }

        log::info!(
            "Peer {peer_id} ({}) joined room {} ({} peers)",
            identity.name,
            self.drawing_id,
            self.presence.len()
        );
        self.broadcast(Some(peer_id), &ServerMessage::Joined(PeerInfo { peer_id, identity }));
    }

    fn on_leave(&mut self, peer_id: PeerId, reason: LeaveReason) {
        let Some(identity) = self.presence.leave(&peer_id) else {
            return;
        };
        log::info!(
            "Peer {peer_id} left room {} ({reason:?}, {} peers remain)",
            self.drawing_id,
            self.presence.len()
        );
        self.broadcast(None, &ServerMessage::Left(PeerInfo { peer_id, identity }));
        self.mark_empty_if_needed();
    }

    fn mark_empty_if_needed(&mut self) {
        if self.presence.is_empty() && self.empty_since.is_none() {
            self.empty_since = Some(Instant::now());
        }
    }

    fn on_update(&mut self, peer_id: PeerId, raw: Vec<Value>) {
        if !self.presence.touch(&peer_id, std::time::Instant::now()) {
            log::debug!("Room {}: update from unknown peer {peer_id}", self.drawing_id);
            return;
        }

        let (elements, malformed) = Element::decode_batch(raw);
        SyncStats::add(&self.stats.elements_malformed, malformed as u64);

        let delta = self.doc.apply_elements(elements);
        SyncStats::add(&self.stats.elements_stale, delta.stale as u64);
        log::debug!(
            "Room {}: {} accepted, {} stale from {peer_id}",
            self.drawing_id,
            delta.len(),
            delta.stale
        );
        if delta.is_empty() {
            return;
        }

        SyncStats::add(&self.stats.elements_accepted, delta.len() as u64);
        self.note_change();
        self.broadcast(
            Some(peer_id),
            &ServerMessage::Update(ElementsUpdate {
                elements: delta.accepted,
            }),
        );
    }

    fn on_file(&mut self, peer_id: PeerId, blob: FileBlob) {
        if !self.presence.touch(&peer_id, std::time::Instant::now()) {
            log::debug!("Room {}: file from unknown peer {peer_id}", self.drawing_id);
            return;
        }

        match self.doc.announce_file(blob.clone()) {
            Ok(FileAnnouncement::Accepted) => {
                log::debug!("Room {}: accepted file {}", self.drawing_id, blob.id);
                SyncStats::incr(&self.stats.files_accepted);
                self.note_change();
                self.broadcast(Some(peer_id), &ServerMessage::File(blob));
            }
            Ok(FileAnnouncement::Duplicate) => {}
            Err(_) => SyncStats::incr(&self.stats.files_rejected),
        }
    }

    fn emit_pending_cursors(&mut self) {
        for update in self.presence.flush_pending(std::time::Instant::now()) {
            let origin = update.peer_id;
            self.broadcast(Some(origin), &ServerMessage::Presence(PeerCursor::from(update)));
        }
    }

    fn sweep(&mut self) {
        let expired = self
            .presence
            .expired(self.config.heartbeat_timeout, std::time::Instant::now());
        for peer_id in expired {
            log::info!("Room {}: evicting silent peer {peer_id}", self.drawing_id);
            SyncStats::incr(&self.stats.evictions);
            let evicted = ServerMessage::Evicted {
                reason: "heartbeat timeout".into(),
            };
            if let Err(e) = self.group.close_peer(peer_id, &evicted) {
                log::error!("Room {}: eviction notice failed: {e}", self.drawing_id);
            }
            self.on_leave(peer_id, LeaveReason::TimedOut);
        }
    }

    /// Flush if there is anything to write. Returns the stored version.
    async fn flush_if_dirty(&mut self) -> Result<u64, BridgeError> {
        if !self.doc.is_dirty() {
            self.retry_at = None;
            return Ok(self.doc.version());
        }

        match self.bridge.flush(&mut self.doc).await {
            Ok(outcome) => {
                SyncStats::incr(&self.stats.flushes);
                SyncStats::add(&self.stats.flush_conflicts, outcome.conflicts as u64);
                self.first_change = None;
                self.last_change = None;
                self.retry_at = None;
                self.backoff.reset();

                if !outcome.merged.is_empty() {
                    self.broadcast(
                        None,
                        &ServerMessage::Update(ElementsUpdate {
                            elements: outcome.merged,
                        }),
                    );
                }
                if self.warned {
                    log::info!("Room {}: storage recovered", self.drawing_id);
                    self.warned = false;
                    self.broadcast(None, &ServerMessage::StorageRecovered);
                }
                Ok(outcome.version)
            }
            Err(BridgeError::Store(StoreError::NotFound(id))) => {
                // Terminal: the drawing no longer exists.
                SyncStats::incr(&self.stats.flush_failures);
                log::warn!("Room {}: drawing deleted, discarding unflushed changes", self.drawing_id);
                self.doc.discard_changes();
                self.first_change = None;
                self.last_change = None;
                self.retry_at = None;
                self.backoff.reset();
                self.broadcast(
                    None,
                    &ServerMessage::StorageWarning {
                        message: "drawing was deleted; changes are not being saved".into(),
                    },
                );
                Err(BridgeError::Store(StoreError::NotFound(id)))
            }
            Err(e) => {
                SyncStats::incr(&self.stats.flush_failures);
                let delay = self.backoff.next_delay();
                self.retry_at = Some(Instant::now() + delay);
                log::warn!(
                    "Room {}: flush failed ({e}); retry {} in {delay:?}",
                    self.drawing_id,
                    self.backoff.failures()
                );

                if self.backoff.failures() >= self.config.warn_after_failures && !self.warned {
                    self.warned = true;
                    self.broadcast(
                        None,
                        &ServerMessage::StorageWarning {
                            message: format!("changes are not being saved: {e}"),
                        },
                    );
                }
                Err(e)
            }
        }
    }

    async fn try_teardown(&mut self) -> Flow {
        if !self.presence.is_empty() {
            self.empty_since = None;
            return Flow::Continue;
        }
        match self.flush_if_dirty().await {
            Ok(_) | Err(BridgeError::Store(StoreError::NotFound(_))) => Flow::Stop,
            // Stay alive; the backoff timer retries and teardown follows.
            Err(_) => Flow::Continue,
        }
    }

    /// Leave the registry, then turn away anything still queued.
    async fn close(&mut self, commands: &mut mpsc::Receiver<RoomCommand>) {
        self.registry.remove_if_same(self.drawing_id, self.instance);
        commands.close();
        while let Some(command) = commands.recv().await {
            match command {
                RoomCommand::Flush { respond_to } => {
                    let _ = respond_to.send(Ok(self.doc.version()));
                }
                other => other.reject(BrokerError::RoomClosing(self.drawing_id)),
            }
        }
    }
}
