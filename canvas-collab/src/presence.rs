//! Per-room peer roster and ephemeral cursor state.
//!
//! ```text
//! cursor from peer
//!       │
//!       ▼
//! PresenceRegistry::update_cursor()
//!       │  window open (≥33ms since last emit)?
//!       ├── yes → CursorUpdate, broadcast now
//!       └── no  → kept as pending, older pending discarded
//!                     │
//!                     ▼
//!              presence tick → flush_pending()
//! ```
//!
//! Presence is best-effort: never persisted, never retried.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Connection-scoped peer id, assigned by the broker on join.
pub type PeerId = Uuid;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// 2D position in scene coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl Default for Vec2 {
    fn default() -> Self {
        Self::ZERO
    }
}

/// RGB cursor colour.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl CursorColor {
    /// Stable, vivid colour derived from a peer id.
    pub fn from_uuid(id: Uuid) -> Self {
        let hue = ((id.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b }
    }

    /// `#rrggbb`.
    pub fn to_hex(&self) -> String {
        let channel = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02x}{:02x}{:02x}", channel(self.r), channel(self.g), channel(self.b))
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Display identity a peer presents to others.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerIdentity {
    #[serde(default)]
    pub name: String,
    /// `#rrggbb`; assigned from the peer id when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl PeerIdentity {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: None,
        }
    }
}

/// Roster entry as sent in join snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub identity: PeerIdentity,
}

/// A cursor position ready to broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorUpdate {
    pub peer_id: PeerId,
    pub position: Vec2,
    pub identity: PeerIdentity,
}

// ───────────────────────────────────────────────────────────────────
// Registry
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct PeerPresence {
    identity: PeerIdentity,
    cursor: Option<Vec2>,
    pending: Option<Vec2>,
    last_emit: Option<Instant>,
    last_seen: Instant,
}

impl PeerPresence {
    fn window_open(&self, now: Instant, interval: Duration) -> bool {
        match self.last_emit {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= interval,
        }
    }
}

/// Connected peers of one room. Owned by the room task.
#[derive(Debug, Clone)]
pub struct PresenceRegistry {
    peers: IndexMap<PeerId, PeerPresence>,
    cursor_interval: Duration,
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new(Duration::from_millis(33))
    }
}

impl PresenceRegistry {
    pub fn new(cursor_interval: Duration) -> Self {
        Self {
            peers: IndexMap::new(),
            cursor_interval,
        }
    }

    /// Register a peer. Returns the identity with its colour filled in,
    /// or `None` if the peer was already present.
    pub fn join(&mut self, peer_id: PeerId, mut identity: PeerIdentity, now: Instant) -> Option<PeerIdentity> {
        if self.peers.contains_key(&peer_id) {
            return None;
        }
        if identity.color.is_none() {
            identity.color = Some(CursorColor::from_uuid(peer_id).to_hex());
        }
        self.peers.insert(
            peer_id,
            PeerPresence {
                identity: identity.clone(),
                cursor: None,
                pending: None,
                last_emit: None,
                last_seen: now,
            },
        );
        Some(identity)
    }

    /// Deregister a peer, returning its identity if it was present.
    pub fn leave(&mut self, peer_id: &PeerId) -> Option<PeerIdentity> {
        self.peers.shift_remove(peer_id).map(|p| p.identity)
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn identity(&self, peer_id: &PeerId) -> Option<&PeerIdentity> {
        self.peers.get(peer_id).map(|p| &p.identity)
    }

    /// Last known cursor of a peer.
    pub fn cursor(&self, peer_id: &PeerId) -> Option<Vec2> {
        self.peers.get(peer_id).and_then(|p| p.pending.or(p.cursor))
    }

    /// Current roster in join order.
    pub fn roster(&self) -> Vec<PeerInfo> {
        self.peers
            .iter()
            .map(|(id, p)| PeerInfo {
                peer_id: *id,
                identity: p.identity.clone(),
            })
            .collect()
    }

    /// Record a cursor move. Returns the update to broadcast now, or `None`
    /// if it was coalesced into the pending slot.
    pub fn update_cursor(
        &mut self,
        peer_id: &PeerId,
        position: Vec2,
        identity: Option<PeerIdentity>,
        now: Instant,
    ) -> Option<CursorUpdate> {
        let interval = self.cursor_interval;
        let peer = self.peers.get_mut(peer_id)?;
        peer.last_seen = now;

        if let Some(mut identity) = identity {
            if identity.color.is_none() {
                identity.color = peer.identity.color.clone();
            }
            peer.identity = identity;
        }

        if !peer.window_open(now, interval) {
            log::trace!("Coalescing cursor of {peer_id}");
            peer.pending = Some(position);
            return None;
        }

        peer.pending = None;
        peer.cursor = Some(position);
        peer.last_emit = Some(now);
        Some(CursorUpdate {
            peer_id: *peer_id,
            position,
            identity: peer.identity.clone(),
        })
    }

    /// Emit pending cursors whose window has opened.
    pub fn flush_pending(&mut self, now: Instant) -> Vec<CursorUpdate> {
        let interval = self.cursor_interval;
        let mut out = Vec::new();
        for (peer_id, peer) in self.peers.iter_mut() {
            if peer.pending.is_none() || !peer.window_open(now, interval) {
                continue;
            }
            if let Some(position) = peer.pending.take() {
                peer.cursor = Some(position);
                peer.last_emit = Some(now);
                out.push(CursorUpdate {
                    peer_id: *peer_id,
                    position,
                    identity: peer.identity.clone(),
                });
            }
        }
        out
    }

    pub fn has_pending(&self) -> bool {
        self.peers.values().any(|p| p.pending.is_some())
    }

    /// Refresh liveness. Returns `false` for unknown peers.
    pub fn touch(&mut self, peer_id: &PeerId, now: Instant) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(peer) => {
                peer.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Peers not heard from within `timeout`.
    pub fn expired(&self, timeout: Duration, now: Instant) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_seen) > timeout)
            .map(|(id, _)| *id)
            .collect()
    }
}
