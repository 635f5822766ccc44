//! Durable drawing storage.
//!
//! Architecture:
//! ```text
//! ┌───────────────────┐   load / write(expected_version)   ┌──────────────────┐
//! │ PersistenceBridge │ ─────────────────────────────────► │ DrawingStorage   │
//! │ (per-room flush)  │                                    │  ├ DrawingStore  │
//! └───────────────────┘                                    │  │  (RocksDB)    │
//! ┌───────────────────┐   same optimistic check            │  └ MemoryStore   │
//! │ external REST PUT │ ─────────────────────────────────► │                  │
//! └───────────────────┘                                    └──────────────────┘
//! ```
//!
//! Every successful write bumps the drawing's version by exactly one. A
//! writer that submits a stale `expected_version` gets
//! [`StoreError::VersionConflict`] and must re-read before retrying; this
//! check is the only concurrency guard between rooms and external writers.

pub mod memory;
pub mod rocks;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::element::Element;
use crate::files::FileMap;

pub use memory::MemoryStore;
pub use rocks::{DrawingStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Drawing not found: {0}")]
    NotFound(Uuid),
    #[error("Drawing already exists: {0}")]
    AlreadyExists(Uuid),
    #[error("Version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: u64, actual: u64 },
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
}

/// A full drawing as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawingRecord {
    pub id: Uuid,
    pub name: String,
    pub collection_id: Option<Uuid>,
    pub version: u64,
    pub created_at: u64,
    pub updated_at: u64,
    pub elements: Vec<Element>,
    pub app_state: Value,
    pub files: FileMap,
}

/// Input to [`DrawingStorage::create_drawing`].
#[derive(Debug, Clone, Default)]
pub struct NewDrawing {
    pub id: Uuid,
    pub name: String,
    pub collection_id: Option<Uuid>,
    pub elements: Vec<Element>,
    pub app_state: Value,
    pub files: FileMap,
}

impl NewDrawing {
    /// Empty drawing with a fresh id.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            app_state: Value::Object(Default::default()),
            ..Default::default()
        }
    }
}

/// How a write treats files already in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileWriteMode {
    /// Add files whose ids are not stored yet; leave the rest untouched.
    #[default]
    Append,
    /// Make the stored file set exactly the given one.
    Replace,
}

/// Scene payload of a write. The version is supplied separately.
#[derive(Debug, Clone, Default)]
pub struct DrawingWrite {
    pub elements: Vec<Element>,
    pub app_state: Value,
    pub files: FileMap,
    pub file_mode: FileWriteMode,
}

/// Metadata stored separately from the scene payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawingMetadata {
    pub id: Uuid,
    pub name: String,
    pub collection_id: Option<Uuid>,
    /// Bumped by one on every write.
    pub version: u64,
    pub element_count: u64,
    pub file_count: u64,
    /// Uncompressed scene size in bytes.
    pub scene_size: u64,
    pub compressed_size: u64,
    /// Milliseconds since the epoch.
    pub created_at: u64,
    pub updated_at: u64,
}

impl DrawingMetadata {
    pub(crate) fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(meta)
    }
}

/// Durable read/write surface shared by rooms and external writers.
///
/// Calls are blocking; async callers run them on the blocking pool.
pub trait DrawingStorage: Send + Sync {
    /// Store a new drawing at version 1.
    fn create_drawing(&self, drawing: NewDrawing) -> Result<DrawingMetadata, StoreError>;

    /// Full drawing, or `NotFound`.
    fn load_drawing(&self, id: Uuid) -> Result<DrawingRecord, StoreError>;

    /// Replace the scene if the stored version still equals
    /// `expected_version`. Returns the new version (`expected_version + 1`).
    fn write_drawing(
        &self,
        id: Uuid,
        expected_version: u64,
        write: DrawingWrite,
    ) -> Result<u64, StoreError>;

    fn load_metadata(&self, id: Uuid) -> Result<DrawingMetadata, StoreError>;

    fn list_drawings(&self) -> Result<Vec<DrawingMetadata>, StoreError>;

    fn delete_drawing(&self, id: Uuid) -> Result<(), StoreError>;
}

/// Stored scene body: everything except files and metadata.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StoredScene {
    pub elements: Vec<Element>,
    #[serde(default)]
    pub app_state: Value,
}

#[cfg(test)]
pub(crate) mod conformance {
    //! Behaviour every [`DrawingStorage`] must share.

    use super::*;
    use crate::files::FileBlob;
    use serde_json::json;

    fn blob(id: &str) -> FileBlob {
        FileBlob::new(id, "image/png", format!("data:image/png;base64,{id}AAAA"), 1)
    }

    fn files(ids: &[&str]) -> FileMap {
        ids.iter().map(|id| (id.to_string(), blob(id))).collect()
    }

    pub fn create_load_roundtrip(store: &dyn DrawingStorage) {
        let mut new = NewDrawing::named("Sketch");
        new.elements = vec![Element::rectangle("a").versioned(2, 5).with_prop("x", json!(1))];
        new.files = files(&["f1"]);
        new.app_state = json!({ "gridSize": 20 });
        let id = new.id;

        let meta = store.create_drawing(new).unwrap();
        assert_eq!(meta.version, 1);
        assert_eq!(meta.element_count, 1);
        assert_eq!(meta.file_count, 1);

        let record = store.load_drawing(id).unwrap();
        assert_eq!(record.name, "Sketch");
        assert_eq!(record.version, 1);
        assert_eq!(record.elements[0].id(), "a");
        assert_eq!(record.elements[0].version_nonce(), 5);
        assert_eq!(record.app_state["gridSize"], 20);
        assert!(record.files.contains_key("f1"));
    }

    pub fn duplicate_create_rejected(store: &dyn DrawingStorage) {
        let new = NewDrawing::named("Twice");
        let id = new.id;
        store.create_drawing(new.clone()).unwrap();
        assert_eq!(store.create_drawing(new), Err(StoreError::AlreadyExists(id)));
    }

    pub fn missing_drawing_not_found(store: &dyn DrawingStorage) {
        let id = Uuid::new_v4();
        assert_eq!(store.load_drawing(id), Err(StoreError::NotFound(id)));
        assert_eq!(store.load_metadata(id), Err(StoreError::NotFound(id)));
        let write = DrawingWrite::default();
        assert_eq!(store.write_drawing(id, 1, write), Err(StoreError::NotFound(id)));
    }

    pub fn optimistic_versioning(store: &dyn DrawingStorage) {
        let new = NewDrawing::named("Versioned");
        let id = new.id;
        store.create_drawing(new).unwrap();

        let write = DrawingWrite {
            elements: vec![Element::rectangle("a").versioned(1, 1)],
            ..Default::default()
        };
        assert_eq!(store.write_drawing(id, 1, write.clone()), Ok(2));
        assert_eq!(
            store.write_drawing(id, 1, write.clone()),
            Err(StoreError::VersionConflict { expected: 1, actual: 2 })
        );
        assert_eq!(store.write_drawing(id, 2, write), Ok(3));
        assert_eq!(store.load_metadata(id).unwrap().version, 3);
    }

    pub fn file_write_modes(store: &dyn DrawingStorage) {
        let mut new = NewDrawing::named("Files");
        new.files = files(&["keep", "drop"]);
        let id = new.id;
        store.create_drawing(new).unwrap();

        let mut changed = blob("keep");
        changed.data_url = "data:image/png;base64,BBBB".into();
        let mut append_files = files(&["new"]);
        append_files.insert("keep".into(), changed);
        let append = DrawingWrite {
            files: append_files,
            file_mode: FileWriteMode::Append,
            ..Default::default()
        };
        store.write_drawing(id, 1, append).unwrap();

        let record = store.load_drawing(id).unwrap();
        assert_eq!(record.files.len(), 3);
        // Files are immutable: append never overwrites.
        assert_eq!(record.files["keep"], blob("keep"));

        let replace = DrawingWrite {
            files: files(&["keep"]),
            file_mode: FileWriteMode::Replace,
            ..Default::default()
        };
        store.write_drawing(id, 2, replace).unwrap();
        let record = store.load_drawing(id).unwrap();
        assert_eq!(record.files.keys().collect::<Vec<_>>(), vec!["keep"]);
        assert_eq!(store.load_metadata(id).unwrap().file_count, 1);
    }

    pub fn list_and_delete(store: &dyn DrawingStorage) {
        let a = NewDrawing::named("A");
        let b = NewDrawing::named("B");
        let (a_id, b_id) = (a.id, b.id);
        store.create_drawing(a).unwrap();
        store.create_drawing(b).unwrap();

        let ids: Vec<Uuid> = store.list_drawings().unwrap().iter().map(|m| m.id).collect();
        assert!(ids.contains(&a_id) && ids.contains(&b_id));

        store.delete_drawing(a_id).unwrap();
        assert_eq!(store.load_drawing(a_id), Err(StoreError::NotFound(a_id)));
        assert_eq!(store.delete_drawing(a_id), Err(StoreError::NotFound(a_id)));
        assert!(store.load_drawing(b_id).is_ok());
    }
}
