//! In-memory [`DrawingStorage`] for storage-less deployments and tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{
    DrawingMetadata, DrawingRecord, DrawingStorage, DrawingWrite, FileWriteMode, NewDrawing,
    StoreError,
};
use crate::element::now_millis;

#[derive(Default)]
pub struct MemoryStore {
    drawings: Mutex<HashMap<Uuid, DrawingRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<Uuid, DrawingRecord>>, StoreError> {
        self.drawings
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store poisoned".into()))
    }
}

fn metadata(record: &DrawingRecord) -> DrawingMetadata {
    let scene_size = serde_json::to_vec(&record.elements)
        .map(|v| v.len() as u64)
        .unwrap_or(0);
    DrawingMetadata {
        id: record.id,
        name: record.name.clone(),
        collection_id: record.collection_id,
        version: record.version,
        element_count: record.elements.len() as u64,
        file_count: record.files.len() as u64,
        scene_size,
        compressed_size: scene_size,
        created_at: record.created_at,
        updated_at: record.updated_at,
    }
}

impl DrawingStorage for MemoryStore {
    fn create_drawing(&self, drawing: NewDrawing) -> Result<DrawingMetadata, StoreError> {
        let mut drawings = self.lock()?;
        if drawings.contains_key(&drawing.id) {
            return Err(StoreError::AlreadyExists(drawing.id));
        }
        let now = now_millis();
        let record = DrawingRecord {
            id: drawing.id,
            name: drawing.name,
            collection_id: drawing.collection_id,
            version: 1,
            created_at: now,
            updated_at: now,
            elements: drawing.elements,
            app_state: drawing.app_state,
            files: drawing.files,
        };
        let meta = metadata(&record);
        drawings.insert(record.id, record);
        Ok(meta)
    }

    fn load_drawing(&self, id: Uuid) -> Result<DrawingRecord, StoreError> {
        self.lock()?.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    fn write_drawing(
        &self,
        id: Uuid,
        expected_version: u64,
        write: DrawingWrite,
    ) -> Result<u64, StoreError> {
        let mut drawings = self.lock()?;
        let record = drawings.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if record.version != expected_version {
            return Err(StoreError::VersionConflict {
                expected: expected_version,
                actual: record.version,
            });
        }

        record.elements = write.elements;
        record.app_state = write.app_state;
        match write.file_mode {
            FileWriteMode::Append => {
                for (file_id, blob) in write.files {
                    record.files.entry(file_id).or_insert(blob);
                }
            }
            FileWriteMode::Replace => record.files = write.files,
        }
        record.version = expected_version + 1;
        record.updated_at = now_millis();
        Ok(record.version)
    }

    fn load_metadata(&self, id: Uuid) -> Result<DrawingMetadata, StoreError> {
        self.lock()?.get(&id).map(metadata).ok_or(StoreError::NotFound(id))
    }

    fn list_drawings(&self) -> Result<Vec<DrawingMetadata>, StoreError> {
        Ok(self.lock()?.values().map(metadata).collect())
    }

    fn delete_drawing(&self, id: Uuid) -> Result<(), StoreError> {
        self.lock()?
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(id))
    }
}
