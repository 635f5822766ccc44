//! RocksDB-backed drawing store.
//!
//! Column families:
//! - `drawings`: scene body (elements + appState), JSON, LZ4 compressed
//! - `files`   : one entry per file, keyed by `<drawing_id:16><file_id>`, LZ4 compressed
//! - `metadata`: [`DrawingMetadata`], bincode
//!
//! The compare-version-then-write step runs under a process-wide mutex so
//! the optimistic check and the batch write are atomic for this process.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{
    DrawingMetadata, DrawingRecord, DrawingStorage, DrawingWrite, FileWriteMode, NewDrawing,
    StoreError, StoredScene,
};
use crate::element::{now_millis, Element};
use crate::files::{FileBlob, FileMap};

const CF_DRAWINGS: &str = "drawings";
const CF_FILES: &str = "files";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DRAWINGS, CF_FILES, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 128MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("canvas_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// RocksDB-backed [`DrawingStorage`].
pub struct DrawingStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    write_lock: Mutex<()>,
}

impl DrawingStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened drawing store at {}", config.path.display());
        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DRAWINGS => {
                // Values are already LZ4 framed.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_FILES => {
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.write_lock
            .lock()
            .map_err(|_| StoreError::Unavailable("write lock poisoned".into()))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    /// `<drawing_id:16><file_id>`
    fn file_key(drawing_id: Uuid, file_id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(16 + file_id.len());
        key.extend_from_slice(drawing_id.as_bytes());
        key.extend_from_slice(file_id.as_bytes());
        key
    }

    /// Encode and compress a scene body. Returns (raw size, compressed bytes).
    fn encode_scene(elements: &[Element], app_state: &serde_json::Value) -> Result<(usize, Vec<u8>), StoreError> {
        #[derive(serde::Serialize)]
        #[serde(rename_all = "camelCase")]
        struct SceneRef<'a> {
            elements: &'a [Element],
            app_state: &'a serde_json::Value,
        }

        let raw = serde_json::to_vec(&SceneRef { elements, app_state })
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok((raw.len(), lz4_flex::compress_prepend_size(&raw)))
    }

    fn decode_scene(bytes: &[u8]) -> Result<StoredScene, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        serde_json::from_slice(&raw).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn encode_file(blob: &FileBlob) -> Result<Vec<u8>, StoreError> {
        let raw = serde_json::to_vec(blob).map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    fn decode_file(bytes: &[u8]) -> Result<FileBlob, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        serde_json::from_slice(&raw).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Raw keys of every stored file of a drawing.
    fn file_keys(&self, drawing_id: Uuid) -> Result<Vec<Box<[u8]>>, StoreError> {
        let cf = self.cf(CF_FILES)?;
        let prefix: &[u8] = drawing_id.as_bytes();
        let mut keys = Vec::new();

        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if key.len() < 16 || &key[..16] != prefix {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }

    fn load_files(&self, drawing_id: Uuid) -> Result<FileMap, StoreError> {
        let cf = self.cf(CF_FILES)?;
        let prefix: &[u8] = drawing_id.as_bytes();
        let mut files = FileMap::new();

        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() < 16 || &key[..16] != prefix {
                break;
            }
            let blob = Self::decode_file(&value)?;
            files.insert(blob.id.clone(), blob);
        }
        Ok(files)
    }

    fn metadata_if_exists(&self, id: Uuid) -> Result<Option<DrawingMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(DrawingMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl DrawingStorage for DrawingStore {
    fn create_drawing(&self, drawing: NewDrawing) -> Result<DrawingMetadata, StoreError> {
        let _guard = self.lock()?;
        if self.metadata_if_exists(drawing.id)?.is_some() {
            return Err(StoreError::AlreadyExists(drawing.id));
        }

        let cf_drawings = self.cf(CF_DRAWINGS)?;
        let cf_files = self.cf(CF_FILES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let (scene_size, compressed) = Self::encode_scene(&drawing.elements, &drawing.app_state)?;
        let now = now_millis();
        let meta = DrawingMetadata {
            id: drawing.id,
            name: drawing.name,
            collection_id: drawing.collection_id,
            version: 1,
            element_count: drawing.elements.len() as u64,
            file_count: drawing.files.len() as u64,
            scene_size: scene_size as u64,
            compressed_size: compressed.len() as u64,
            created_at: now,
            updated_at: now,
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_drawings, drawing.id.as_bytes(), &compressed);
        for (file_id, blob) in &drawing.files {
            batch.put_cf(&cf_files, Self::file_key(drawing.id, file_id), Self::encode_file(blob)?);
        }
        batch.put_cf(&cf_meta, drawing.id.as_bytes(), meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;

        log::info!("Created drawing {} ({})", meta.id, meta.name);
        Ok(meta)
    }

    fn load_drawing(&self, id: Uuid) -> Result<DrawingRecord, StoreError> {
        let meta = self.load_metadata(id)?;
        let cf = self.cf(CF_DRAWINGS)?;
        let scene = match self.db.get_cf(&cf, id.as_bytes())? {
            Some(bytes) => Self::decode_scene(&bytes)?,
            None => return Err(StoreError::NotFound(id)),
        };
        let files = self.load_files(id)?;

        Ok(DrawingRecord {
            id,
            name: meta.name,
            collection_id: meta.collection_id,
            version: meta.version,
            created_at: meta.created_at,
            updated_at: meta.updated_at,
            elements: scene.elements,
            app_state: scene.app_state,
            files,
        })
    }

    fn write_drawing(
        &self,
        id: Uuid,
        expected_version: u64,
        write: DrawingWrite,
    ) -> Result<u64, StoreError> {
        let _guard = self.lock()?;
        let mut meta = self.metadata_if_exists(id)?.ok_or(StoreError::NotFound(id))?;
        if meta.version != expected_version {
            return Err(StoreError::VersionConflict {
                expected: expected_version,
                actual: meta.version,
            });
        }

        let cf_drawings = self.cf(CF_DRAWINGS)?;
        let cf_files = self.cf(CF_FILES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let (scene_size, compressed) = Self::encode_scene(&write.elements, &write.app_state)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_drawings, id.as_bytes(), &compressed);

        let stored: HashSet<Vec<u8>> = self
            .file_keys(id)?
            .into_iter()
            .map(|k| k.into_vec())
            .collect();
        let file_count = match write.file_mode {
            FileWriteMode::Append => {
                let mut count = stored.len();
                for (file_id, blob) in &write.files {
                    let key = Self::file_key(id, file_id);
                    if !stored.contains(&key) {
                        batch.put_cf(&cf_files, &key, Self::encode_file(blob)?);
                        count += 1;
                    }
                }
                count
            }
            FileWriteMode::Replace => {
                let wanted: HashSet<Vec<u8>> =
                    write.files.keys().map(|f| Self::file_key(id, f)).collect();
                for key in stored.difference(&wanted) {
                    batch.delete_cf(&cf_files, key);
                }
                for (file_id, blob) in &write.files {
                    batch.put_cf(&cf_files, Self::file_key(id, file_id), Self::encode_file(blob)?);
                }
                write.files.len()
            }
        };

        meta.version = expected_version + 1;
        meta.element_count = write.elements.len() as u64;
        meta.file_count = file_count as u64;
        meta.scene_size = scene_size as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_millis();
        batch.put_cf(&cf_meta, id.as_bytes(), meta.encode()?);

        self.db.write_opt(batch, &self.write_options())?;
        log::debug!("Wrote drawing {id} at version {}", meta.version);
        Ok(meta.version)
    }

    fn load_metadata(&self, id: Uuid) -> Result<DrawingMetadata, StoreError> {
        self.metadata_if_exists(id)?.ok_or(StoreError::NotFound(id))
    }

    fn list_drawings(&self) -> Result<Vec<DrawingMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut drawings = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            drawings.push(DrawingMetadata::decode(&value)?);
        }
        Ok(drawings)
    }

    fn delete_drawing(&self, id: Uuid) -> Result<(), StoreError> {
        let _guard = self.lock()?;
        if self.metadata_if_exists(id)?.is_none() {
            return Err(StoreError::NotFound(id));
        }

        let cf_drawings = self.cf(CF_DRAWINGS)?;
        let cf_files = self.cf(CF_FILES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_drawings, id.as_bytes());
        batch.delete_cf(&cf_meta, id.as_bytes());
        for key in self.file_keys(id)? {
            batch.delete_cf(&cf_files, key);
        }
        self.db.write_opt(batch, &self.write_options())?;

        log::info!("Deleted drawing {id}");
        Ok(())
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::conformance;
    use serde_json::json;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, DrawingStore) {
        let dir = TempDir::new().unwrap();
        let store = DrawingStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    #[test]
    fn test_store_open() {
        let (dir, store) = open_store();
        assert_eq!(store.path(), dir.path());
        assert!(store.list_drawings().unwrap().is_empty());
    }

    #[test]
    fn test_create_load_roundtrip() {
        let (_dir, store) = open_store();
        conformance::create_load_roundtrip(&store);
    }

    #[test]
    fn test_duplicate_create_rejected() {
        let (_dir, store) = open_store();
        conformance::duplicate_create_rejected(&store);
    }

    #[test]
    fn test_missing_drawing_not_found() {
        let (_dir, store) = open_store();
        conformance::missing_drawing_not_found(&store);
    }

    #[test]
    fn test_optimistic_versioning() {
        let (_dir, store) = open_store();
        conformance::optimistic_versioning(&store);
    }

    #[test]
    fn test_file_write_modes() {
        let (_dir, store) = open_store();
        conformance::file_write_modes(&store);
    }

    #[test]
    fn test_list_and_delete() {
        let (_dir, store) = open_store();
        conformance::list_and_delete(&store);
    }

    #[test]
    fn test_files_isolated_between_drawings() {
        let (_dir, store) = open_store();
        let mut a = NewDrawing::named("a");
        a.files.insert(
            "shared".into(),
            FileBlob::new("shared", "image/png", "data:image/png;base64,AAAA", 1),
        );
        let b = NewDrawing::named("b");
        let (a_id, b_id) = (a.id, b.id);
        store.create_drawing(a).unwrap();
        store.create_drawing(b).unwrap();

        assert_eq!(store.load_drawing(a_id).unwrap().files.len(), 1);
        assert!(store.load_drawing(b_id).unwrap().files.is_empty());

        store.delete_drawing(b_id).unwrap();
        assert_eq!(store.load_drawing(a_id).unwrap().files.len(), 1);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let id = {
            let store = DrawingStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            let mut new = NewDrawing::named("persisted");
            new.elements = vec![Element::rectangle("r").versioned(4, 2)];
            let id = new.id;
            store.create_drawing(new).unwrap();
            store.sync().unwrap();
            id
        };

        let store = DrawingStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        let record = store.load_drawing(id).unwrap();
        assert_eq!(record.elements[0].version(), 4);
        assert_eq!(record.version, 1);
    }

    #[test]
    fn test_scene_is_compressed() {
        let (_dir, store) = open_store();
        let mut new = NewDrawing::named("big");
        new.elements = (0..500)
            .map(|i| Element::rectangle(format!("r{i}")).with_prop("strokeColor", json!("#1e1e1e")))
            .collect();
        let meta = store.create_drawing(new).unwrap();
        assert!(meta.compressed_size < meta.scene_size);
        assert_eq!(meta.element_count, 500);
    }

    #[test]
    fn test_concurrent_writers_one_wins() {
        let (_dir, store) = open_store();
        let new = NewDrawing::named("race");
        let id = new.id;
        store.create_drawing(new).unwrap();

        let store = std::sync::Arc::new(store);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.write_drawing(id, 1, DrawingWrite::default()))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, StoreError::VersionConflict { expected: 1, actual: 2 })));
    }
}
