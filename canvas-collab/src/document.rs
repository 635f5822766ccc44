//! Working copy of a drawing held by a live room.

use serde_json::Value;
use std::collections::HashSet;
use uuid::Uuid;

use crate::element::{Element, ElementMap};
use crate::files::{ContentGate, FileAnnouncement, FileBlob, FileRejection, FileRelay};
use crate::presence::PeerInfo;
use crate::protocol::Snapshot;
use crate::reconcile::{reconcile, AppliedDelta};
use crate::storage::{DrawingRecord, DrawingWrite, FileWriteMode};

/// Authoritative in-memory state of one room.
#[derive(Debug, Clone)]
pub struct RoomDocument {
    drawing_id: Uuid,
    elements: ElementMap,
    app_state: Value,
    files: FileRelay,
    /// File ids known to be in storage.
    persisted_files: HashSet<String>,
    /// Storage version this copy was last loaded from or flushed as.
    version: u64,
    dirty: bool,
}

impl RoomDocument {
    pub fn from_record(record: DrawingRecord, gate: ContentGate) -> Self {
        let persisted_files = record.files.keys().cloned().collect();
        let elements = record
            .elements
            .into_iter()
            .map(|e| (e.header.id.clone(), e))
            .collect();
        Self {
            drawing_id: record.id,
            elements,
            app_state: record.app_state,
            files: FileRelay::with_files(gate, record.files),
            persisted_files,
            version: record.version,
            dirty: false,
        }
    }

    pub fn drawing_id(&self) -> Uuid {
        self.drawing_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn elements(&self) -> &ElementMap {
        &self.elements
    }

    pub fn app_state(&self) -> &Value {
        &self.app_state
    }

    pub fn files(&self) -> &FileRelay {
        &self.files
    }

    /// Reconcile a peer's batch. Accepted changes mark the document dirty.
    pub fn apply_elements(&mut self, incoming: Vec<Element>) -> AppliedDelta {
        let delta = reconcile(&mut self.elements, incoming);
        if !delta.is_empty() {
            self.dirty = true;
        }
        delta
    }

    /// Offer a file. A newly accepted file marks the document dirty.
    pub fn announce_file(&mut self, blob: FileBlob) -> Result<FileAnnouncement, FileRejection> {
        let outcome = self.files.announce(blob)?;
        if outcome == FileAnnouncement::Accepted {
            self.dirty = true;
        }
        Ok(outcome)
    }

    /// Full state for a joining or resyncing peer.
    pub fn snapshot(&self, peers: Vec<PeerInfo>) -> Snapshot {
        Snapshot {
            drawing_id: self.drawing_id,
            elements: self.elements.values().cloned().collect(),
            app_state: self.app_state.clone(),
            files: self.files.files().clone(),
            version: self.version,
            peers,
        }
    }

    /// Write payload for the next flush. Only files not yet in storage are
    /// included.
    pub fn flush_payload(&self) -> DrawingWrite {
        let files = self
            .files
            .files()
            .iter()
            .filter(|(id, _)| !self.persisted_files.contains(*id))
            .map(|(id, blob)| (id.clone(), blob.clone()))
            .collect();
        DrawingWrite {
            elements: self.elements.values().cloned().collect(),
            app_state: self.app_state.clone(),
            files,
            file_mode: FileWriteMode::Append,
        }
    }

    /// Record a successful flush of `payload` as storage version `version`.
    pub fn mark_flushed(&mut self, version: u64, persisted: impl IntoIterator<Item = String>) {
        self.persisted_files.extend(persisted);
        self.version = version;
        self.dirty = false;
    }

    /// Drop the dirty mark without writing, for a drawing that no longer
    /// exists in storage.
    pub fn discard_changes(&mut self) {
        self.dirty = false;
    }

    /// Fold a newer stored state into this copy after a version conflict.
    ///
    /// Stored elements go through the reconciler like any incoming batch.
    /// The stored appState replaces ours and stored files are adopted. The
    /// document stays dirty so the merged result is written back.
    pub fn merge_stored(&mut self, record: DrawingRecord) -> AppliedDelta {
        let delta = reconcile(&mut self.elements, record.elements);
        self.app_state = record.app_state;
        // A full replacement may have dropped files we still hold; those
        // must be written again.
        self.persisted_files = record.files.keys().cloned().collect();
        for blob in record.files.into_values() {
            self.files.adopt(blob);
        }
        self.version = record.version;
        self.dirty = true;
        delta
    }
}
