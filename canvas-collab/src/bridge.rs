//! Loads and flushes room state against durable storage.
//!
//! ```text
//! flush(doc)
//!   │ write(expected = doc.version)
//!   ├── Ok(v)                  → doc.version = v, clean
//!   ├── VersionConflict        → load latest, reconcile into doc, retry
//!   │                            (bounded by max_conflict_retries)
//!   └── other error            → caller backs off and retries later
//! ```
//!
//! Storage calls run on tokio's blocking pool. A flush is never cancelled
//! by a peer going away; it belongs to the room task.

use indexmap::IndexMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::document::RoomDocument;
use crate::element::Element;
use crate::storage::{DrawingRecord, DrawingStorage, StoreError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Storage call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Storage task failed: {0}")]
    Task(String),

    #[error("Gave up after {0} conflicting writes")]
    ConflictsExhausted(usize),
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Upper bound on a snapshot load.
    pub load_timeout: Duration,
    /// Re-merge rounds per flush before giving up.
    pub max_conflict_retries: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            load_timeout: Duration::from_secs(10),
            max_conflict_retries: 5,
        }
    }
}

/// Result of a successful flush.
#[derive(Debug, Clone, Default)]
pub struct FlushOutcome {
    /// Version now in storage.
    pub version: u64,
    /// Elements taken from storage during conflict recovery, for broadcast.
    pub merged: Vec<Element>,
    /// Version conflicts hit on the way.
    pub conflicts: usize,
}

#[derive(Clone)]
pub struct PersistenceBridge {
    storage: Arc<dyn DrawingStorage>,
    config: BridgeConfig,
}

impl PersistenceBridge {
    pub fn new(storage: Arc<dyn DrawingStorage>, config: BridgeConfig) -> Self {
        Self { storage, config }
    }

    pub fn storage(&self) -> &Arc<dyn DrawingStorage> {
        &self.storage
    }

    async fn blocking<T, F>(&self, call: F) -> Result<T, BridgeError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn DrawingStorage) -> Result<T, StoreError> + Send + 'static,
    {
        let storage = self.storage.clone();
        let result = tokio::task::spawn_blocking(move || call(storage.as_ref()))
            .await
            .map_err(|e| BridgeError::Task(e.to_string()))?;
        Ok(result?)
    }

    /// Initial state of a drawing, bounded by the load timeout.
    pub async fn load_snapshot(&self, drawing_id: Uuid) -> Result<DrawingRecord, BridgeError> {
        let timeout = self.config.load_timeout;
        tokio::time::timeout(timeout, self.blocking(move |s| s.load_drawing(drawing_id)))
            .await
            .map_err(|_| BridgeError::Timeout(timeout))?
    }

    /// Write the document under optimistic versioning, merging storage's
    /// state back in on conflict.
    pub async fn flush(&self, doc: &mut RoomDocument) -> Result<FlushOutcome, BridgeError> {
        let drawing_id = doc.drawing_id();
        let mut merged: IndexMap<String, Element> = IndexMap::new();

        for conflicts in 0..=self.config.max_conflict_retries {
            let expected = doc.version();
            let payload = doc.flush_payload();
            let written_files: Vec<String> = payload.files.keys().cloned().collect();

            let result = self
                .blocking(move |s| s.write_drawing(drawing_id, expected, payload))
                .await;

            match result {
                Ok(version) => {
                    doc.mark_flushed(version, written_files);
                    log::info!("Flushed drawing {drawing_id} as version {version}");
                    return Ok(FlushOutcome {
                        version,
                        merged: merged.into_values().collect(),
                        conflicts,
                    });
                }
                Err(BridgeError::Store(StoreError::VersionConflict { expected, actual })) => {
                    log::warn!(
                        "Drawing {drawing_id} changed in storage (expected v{expected}, found v{actual}); merging"
                    );
                    let latest = self.blocking(move |s| s.load_drawing(drawing_id)).await?;
                    let delta = doc.merge_stored(latest);
                    for element in delta.accepted {
                        merged.insert(element.header.id.clone(), element);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(BridgeError::ConflictsExhausted(self.config.max_conflict_retries + 1))
    }
}

/// Exponential retry delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            failures: 0,
        }
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        let shift = self.failures.min(16);
        self.failures += 1;
        self.initial.saturating_mul(1 << shift).min(self.max)
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::{ContentGate, FileBlob};
    use crate::storage::{DrawingWrite, FileWriteMode, MemoryStore, NewDrawing};
    use serde_json::json;

    fn setup(elements: Vec<Element>) -> (Arc<MemoryStore>, PersistenceBridge, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let mut new = NewDrawing::named("bridge");
        new.elements = elements;
        let id = new.id;
        store.create_drawing(new).unwrap();
        let bridge = PersistenceBridge::new(store.clone(), BridgeConfig::default());
        (store, bridge, id)
    }

    #[tokio::test]
    async fn test_load_missing_is_not_found() {
        let (_store, bridge, _) = setup(vec![]);
        let missing = Uuid::new_v4();
        assert_eq!(
            bridge.load_snapshot(missing).await.unwrap_err(),
            BridgeError::Store(StoreError::NotFound(missing))
        );
    }

    #[tokio::test]
    async fn test_flush_bumps_version() {
        let (store, bridge, id) = setup(vec![]);
        let mut doc = RoomDocument::from_record(bridge.load_snapshot(id).await.unwrap(), ContentGate::default());
        doc.apply_elements(vec![Element::rectangle("a").versioned(1, 1)]);

        let outcome = bridge.flush(&mut doc).await.unwrap();
        assert_eq!(outcome.version, 2);
        assert_eq!(outcome.conflicts, 0);
        assert!(!doc.is_dirty());
        assert_eq!(store.load_drawing(id).unwrap().elements.len(), 1);
    }

    #[tokio::test]
    async fn test_conflict_merges_external_write() {
        let (store, bridge, id) = setup(vec![Element::rectangle("shared").versioned(1, 0)]);
        let mut doc = RoomDocument::from_record(bridge.load_snapshot(id).await.unwrap(), ContentGate::default());

        // Room edits "shared" and adds "room-only".
        doc.apply_elements(vec![
            Element::rectangle("shared").versioned(3, 0).with_prop("by", json!("room")),
            Element::rectangle("room-only").versioned(1, 0),
        ]);

        // Meanwhile an external writer saves version 2.
        let external = DrawingWrite {
            elements: vec![
                Element::rectangle("shared").versioned(2, 0).with_prop("by", json!("rest")),
                Element::rectangle("rest-only").versioned(1, 0),
            ],
            app_state: json!({ "name": "renamed" }),
            ..Default::default()
        };
        assert_eq!(store.write_drawing(id, 1, external), Ok(2));

        let outcome = bridge.flush(&mut doc).await.unwrap();
        assert_eq!(outcome.version, 3);
        assert_eq!(outcome.conflicts, 1);
        assert_eq!(outcome.merged.len(), 1);
        assert_eq!(outcome.merged[0].id(), "rest-only");

        let stored = store.load_drawing(id).unwrap();
        let ids: Vec<&str> = stored.elements.iter().map(|e| e.id()).collect();
        assert_eq!(ids, vec!["shared", "room-only", "rest-only"]);
        assert_eq!(stored.elements[0].shape.props()["by"], json!("room"));
        assert_eq!(stored.app_state["name"], "renamed");
    }

    #[tokio::test]
    async fn test_conflict_restores_file_dropped_by_replacement() {
        let (store, bridge, id) = setup(vec![]);
        let mut doc = RoomDocument::from_record(bridge.load_snapshot(id).await.unwrap(), ContentGate::default());
        let img = FileBlob::new("img", "image/png", "data:image/png;base64,iVBORw0KGgo=", 1);
        doc.announce_file(img).unwrap();
        doc.apply_elements(vec![Element::rectangle("e").versioned(5, 0)]);
        bridge.flush(&mut doc).await.unwrap();
        assert!(store.load_drawing(id).unwrap().files.contains_key("img"));

        // A full replacement drops the file while keeping an older "e".
        let external = DrawingWrite {
            elements: vec![Element::rectangle("e").versioned(1, 0)],
            app_state: json!({}),
            files: Default::default(),
            file_mode: FileWriteMode::Replace,
        };
        store.write_drawing(id, 2, external).unwrap();

        doc.apply_elements(vec![Element::rectangle("e").versioned(6, 0)]);
        let outcome = bridge.flush(&mut doc).await.unwrap();
        assert_eq!(outcome.conflicts, 1);

        let stored = store.load_drawing(id).unwrap();
        assert_eq!(stored.elements[0].version(), 6);
        assert!(stored.files.contains_key("img"));
    }

    struct AlwaysConflicting(MemoryStore);

    impl DrawingStorage for AlwaysConflicting {
        fn create_drawing(&self, d: NewDrawing) -> Result<crate::storage::DrawingMetadata, StoreError> {
            self.0.create_drawing(d)
        }
        fn load_drawing(&self, id: Uuid) -> Result<DrawingRecord, StoreError> {
            self.0.load_drawing(id)
        }
        fn write_drawing(&self, _id: Uuid, expected: u64, _w: DrawingWrite) -> Result<u64, StoreError> {
            Err(StoreError::VersionConflict { expected, actual: expected + 1 })
        }
        fn load_metadata(&self, id: Uuid) -> Result<crate::storage::DrawingMetadata, StoreError> {
            self.0.load_metadata(id)
        }
        fn list_drawings(&self) -> Result<Vec<crate::storage::DrawingMetadata>, StoreError> {
            self.0.list_drawings()
        }
        fn delete_drawing(&self, id: Uuid) -> Result<(), StoreError> {
            self.0.delete_drawing(id)
        }
    }

    #[tokio::test]
    async fn test_conflict_rounds_bounded() {
        let inner = MemoryStore::new();
        let new = NewDrawing::named("hot");
        let id = new.id;
        inner.create_drawing(new).unwrap();

        let bridge = PersistenceBridge::new(
            Arc::new(AlwaysConflicting(inner)),
            BridgeConfig {
                max_conflict_retries: 2,
                ..Default::default()
            },
        );
        let mut doc = RoomDocument::from_record(bridge.load_snapshot(id).await.unwrap(), ContentGate::default());
        doc.apply_elements(vec![Element::rectangle("x")]);

        assert_eq!(bridge.flush(&mut doc).await.unwrap_err(), BridgeError::ConflictsExhausted(3));
        assert!(doc.is_dirty());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));
        let delays: Vec<u128> = (0..9).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 4000, 8000, 16000, 30000, 30000, 30000]);
        assert_eq!(backoff.failures(), 9);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }
}
