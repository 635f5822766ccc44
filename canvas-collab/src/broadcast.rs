//! Per-room fan-out with pre-encoded frames.
//!
//! One tokio broadcast channel per room. Frames are serialized once and
//! shared as `Arc<str>` across all receivers; each connection filters out
//! its own echoes and frames addressed to someone else.
//!
//! A receiver that falls more than `capacity` frames behind observes
//! `RecvError::Lagged` and must resync from a fresh snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::presence::PeerId;
use crate::protocol::{ProtocolError, ServerMessage};

/// One encoded frame plus its routing.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Sender, which never receives its own frame back.
    pub origin: Option<PeerId>,
    /// Single recipient, or `None` for everyone.
    pub target: Option<PeerId>,
    pub frame: Arc<str>,
    /// Recipient should close its connection after delivery.
    pub close: bool,
}

impl Envelope {
    /// Whether `peer` should deliver this frame.
    pub fn is_for(&self, peer: &PeerId) -> bool {
        if self.origin.as_ref() == Some(peer) {
            return false;
        }
        match &self.target {
            Some(target) => target == peer,
            None => true,
        }
    }
}

/// Snapshot of broadcast counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_lagged: u64,
    pub receivers: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_lagged: AtomicU64,
}

/// Fan-out channel of a single room.
#[derive(Clone)]
pub struct BroadcastGroup {
    sender: broadcast::Sender<Envelope>,
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` bounds how far a receiver may fall behind before lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    /// Encode once and send to every peer except `origin`.
    ///
    /// Returns the number of receivers the frame was queued for.
    pub fn broadcast(&self, origin: Option<PeerId>, msg: &ServerMessage) -> Result<usize, ProtocolError> {
        let frame: Arc<str> = Arc::from(msg.encode()?);
        Ok(self.send(Envelope {
            origin,
            target: None,
            frame,
            close: false,
        }))
    }

    /// Send to a single peer.
    pub fn send_to(&self, target: PeerId, msg: &ServerMessage) -> Result<usize, ProtocolError> {
        let frame: Arc<str> = Arc::from(msg.encode()?);
        Ok(self.send(Envelope {
            origin: None,
            target: Some(target),
            frame,
            close: false,
        }))
    }

    /// Send a final frame to `target` and ask its connection to close.
    pub fn close_peer(&self, target: PeerId, msg: &ServerMessage) -> Result<usize, ProtocolError> {
        let frame: Arc<str> = Arc::from(msg.encode()?);
        Ok(self.send(Envelope {
            origin: None,
            target: Some(target),
            frame,
            close: true,
        }))
    }

    /// Send a pre-built envelope.
    pub fn send(&self, envelope: Envelope) -> usize {
        let count = self.sender.send(envelope).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Count frames a receiver skipped.
    pub fn record_lag(&self, skipped: u64) {
        self.stats.messages_lagged.fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_lagged: self.stats.messages_lagged.load(Ordering::Relaxed),
            receivers: self.sender.receiver_count(),
        }
    }
}
