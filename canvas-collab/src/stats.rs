//! Server-wide counters, updated lock-free from rooms and connections.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of [`SyncStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rooms_created: u64,
    pub active_rooms: u64,
    pub elements_accepted: u64,
    pub elements_stale: u64,
    pub elements_malformed: u64,
    pub files_accepted: u64,
    pub files_rejected: u64,
    pub flushes: u64,
    pub flush_conflicts: u64,
    pub flush_failures: u64,
    pub evictions: u64,
}

#[derive(Debug, Default)]
pub struct SyncStats {
    pub total_connections: AtomicU64,
    pub active_connections: AtomicU64,
    pub rooms_created: AtomicU64,
    pub active_rooms: AtomicU64,
    pub elements_accepted: AtomicU64,
    pub elements_stale: AtomicU64,
    pub elements_malformed: AtomicU64,
    pub files_accepted: AtomicU64,
    pub files_rejected: AtomicU64,
    pub flushes: AtomicU64,
    pub flush_conflicts: AtomicU64,
    pub flush_failures: AtomicU64,
    pub evictions: AtomicU64,
}

impl SyncStats {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decr(counter: &AtomicU64) {
        // Saturate at zero.
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn snapshot(&self) -> ServerStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ServerStats {
            total_connections: load(&self.total_connections),
            active_connections: load(&self.active_connections),
            rooms_created: load(&self.rooms_created),
            active_rooms: load(&self.active_rooms),
            elements_accepted: load(&self.elements_accepted),
            elements_stale: load(&self.elements_stale),
            elements_malformed: load(&self.elements_malformed),
            files_accepted: load(&self.files_accepted),
            files_rejected: load(&self.files_rejected),
            flushes: load(&self.flushes),
            flush_conflicts: load(&self.flush_conflicts),
            flush_failures: load(&self.flush_failures),
            evictions: load(&self.evictions),
        }
    }
}
