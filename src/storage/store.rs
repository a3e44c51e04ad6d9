//! Local chunk and manifest storage using sled embedded database
//!
//! Four trees:
//! - `chunks`: chunk bytes (plaintext or ciphertext) keyed by plaintext hash
//! - `seals`: IV, tag and key for every chunk stored as ciphertext
//! - `manifests`: manifest JSON keyed by manifest id
//! - `metadata`: a single aggregate record (node id, totals, file summaries)
//!
//! Every write that touches the aggregate record goes through `write_lock`,
//! so concurrent stores of the same chunk count it once.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

use crate::crypto::{sha256_hex, ContentHash};
use crate::files::FileManifest;

const METADATA_KEY: &[u8] = b"aggregate";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
    #[error("Chunk not found: {0}")]
    ChunkNotFound(ContentHash),
    #[error("Manifest not found: {0}")]
    ManifestNotFound(ContentHash),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Whether a chunk write hit an existing blob
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    Existing,
}

/// How a ciphertext blob was produced. All fields are hex.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkSeal {
    pub iv: String,
    pub auth_tag: String,
    pub key: String,
}

/// Per-file entry in the aggregate record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSummary {
    pub file_name: String,
    pub size: u64,
    pub chunks: usize,
    pub encrypted: bool,
    pub stored_at: DateTime<Utc>,
}

/// Aggregate record kept in the `metadata` tree
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageMetadata {
    pub node_id: String,
    pub created_at: DateTime<Utc>,
    pub total_chunks: u64,
    pub total_size: u64,
    /// Manifest id (hex) -> summary
    pub files: BTreeMap<String, FileSummary>,
}

impl StorageMetadata {
    fn new(created_at: DateTime<Utc>) -> Self {
        Self {
            node_id: sha256_hex(created_at.to_rfc3339().as_bytes()),
            created_at,
            total_chunks: 0,
            total_size: 0,
            files: BTreeMap::new(),
        }
    }
}

/// Public view of the aggregate record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub node_id: String,
    pub total_chunks: u64,
    pub total_size: u64,
    pub file_count: usize,
    pub created_at: DateTime<Utc>,
}

/// Local storage for chunks and manifests
pub struct LocalStore {
    db: Db,
    chunks: Tree,
    seals: Tree,
    manifests: Tree,
    metadata: Tree,
    write_lock: Mutex<()>,
}

impl LocalStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let chunks = db.open_tree("chunks")?;
        let seals = db.open_tree("seals")?;
        let manifests = db.open_tree("manifests")?;
        let metadata = db.open_tree("metadata")?;

        let store = Self {
            db,
            chunks,
            seals,
            manifests,
            metadata,
            write_lock: Mutex::new(()),
        };

        if store.metadata.get(METADATA_KEY)?.is_none() {
            let initial = StorageMetadata::new(Utc::now());
            info!("Initialised storage metadata, node id {}", initial.node_id);
            store.save_metadata(&initial)?;
        }

        Ok(store)
    }

    fn load_metadata(&self) -> Result<StorageMetadata, StorageError> {
        match self.metadata.get(METADATA_KEY)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(StorageMetadata::new(Utc::now())),
        }
    }

    fn save_metadata(&self, metadata: &StorageMetadata) -> Result<(), StorageError> {
        self.metadata
            .insert(METADATA_KEY, serde_json::to_vec(metadata)?)?;
        Ok(())
    }

    /// Store plaintext chunk bytes under their hash.
    ///
    /// An existing blob is left untouched and totals are not changed.
    pub fn store_chunk(&self, hash: &ContentHash, data: &[u8]) -> Result<StoreOutcome, StorageError> {
        self.insert_chunk(hash, data, None)
    }

    /// Store ciphertext under the plaintext hash together with its seal.
    ///
    /// As with `store_chunk`, an existing blob and its seal are kept.
    pub fn store_sealed_chunk(
        &self,
        hash: &ContentHash,
        data: &[u8],
        seal: &ChunkSeal,
    ) -> Result<StoreOutcome, StorageError> {
        self.insert_chunk(hash, data, Some(seal))
    }

    fn insert_chunk(
        &self,
        hash: &ContentHash,
        data: &[u8],
        seal: Option<&ChunkSeal>,
    ) -> Result<StoreOutcome, StorageError> {
        let _guard = self.write_lock.lock();

        if self.chunks.contains_key(hash.as_bytes())? {
            debug!("Chunk {} already stored", hash);
            return Ok(StoreOutcome::Existing);
        }

        if let Some(seal) = seal {
            self.seals.insert(hash.as_bytes(), serde_json::to_vec(seal)?)?;
        }
        self.chunks.insert(hash.as_bytes(), data)?;

        let mut metadata = self.load_metadata()?;
        metadata.total_chunks += 1;
        metadata.total_size += data.len() as u64;
        self.save_metadata(&metadata)?;

        debug!("Stored chunk {} ({} bytes)", hash, data.len());
        Ok(StoreOutcome::Stored)
    }

    /// Retrieve chunk bytes
    pub fn retrieve_chunk(&self, hash: &ContentHash) -> Result<Vec<u8>, StorageError> {
        self.chunks
            .get(hash.as_bytes())?
            .map(|v| v.to_vec())
            .ok_or(StorageError::ChunkNotFound(*hash))
    }

    /// Seal of a ciphertext chunk; `None` when the chunk is absent or plaintext
    pub fn chunk_seal(&self, hash: &ContentHash) -> Result<Option<ChunkSeal>, StorageError> {
        match self.seals.get(hash.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Check if we have a chunk
    pub fn has_chunk(&self, hash: &ContentHash) -> Result<bool, StorageError> {
        Ok(self.chunks.contains_key(hash.as_bytes())?)
    }

    /// Stored size of a chunk without copying it out
    pub fn chunk_size(&self, hash: &ContentHash) -> Result<Option<u64>, StorageError> {
        Ok(self.chunks.get(hash.as_bytes())?.map(|v| v.len() as u64))
    }

    /// Delete a chunk, adjusting totals. Returns whether it existed.
    pub fn delete_chunk(&self, hash: &ContentHash) -> Result<bool, StorageError> {
        let _guard = self.write_lock.lock();

        let Some(old) = self.chunks.remove(hash.as_bytes())? else {
            return Ok(false);
        };
        self.seals.remove(hash.as_bytes())?;

        let mut metadata = self.load_metadata()?;
        metadata.total_chunks = metadata.total_chunks.saturating_sub(1);
        metadata.total_size = metadata.total_size.saturating_sub(old.len() as u64);
        self.save_metadata(&metadata)?;

        Ok(true)
    }

    /// Persist a manifest, assigning its id if absent. Returns the id.
    pub fn store_manifest(&self, manifest: &mut FileManifest) -> Result<ContentHash, StorageError> {
        let id = match manifest.id {
            Some(id) => id,
            None => {
                let id = manifest.compute_id()?;
                manifest.id = Some(id);
                id
            }
        };

        let _guard = self.write_lock.lock();

        self.manifests.insert(id.as_bytes(), manifest.to_bytes()?)?;

        let mut metadata = self.load_metadata()?;
        metadata.files.insert(
            id.to_hex(),
            FileSummary {
                file_name: manifest.file_name.clone(),
                size: manifest.size,
                chunks: manifest.chunk_count(),
                encrypted: manifest.encrypted,
                stored_at: Utc::now(),
            },
        );
        self.save_metadata(&metadata)?;

        info!("Stored manifest {} for {}", id, manifest.file_name);
        Ok(id)
    }

    /// Retrieve a manifest by id
    pub fn retrieve_manifest(&self, id: &ContentHash) -> Result<FileManifest, StorageError> {
        let bytes = self
            .manifests
            .get(id.as_bytes())?
            .ok_or(StorageError::ManifestNotFound(*id))?;
        Ok(FileManifest::from_bytes(&bytes)?)
    }

    /// List all stored manifest ids
    pub fn list_manifests(&self) -> Result<Vec<ContentHash>, StorageError> {
        let mut ids = Vec::new();
        for item in self.manifests.iter() {
            let (key, _) = item?;
            if let Ok(bytes) = <[u8; 32]>::try_from(key.as_ref()) {
                ids.push(ContentHash::from_bytes(bytes));
            }
        }
        Ok(ids)
    }

    /// List all stored chunk hashes
    pub fn list_chunks(&self) -> Result<Vec<ContentHash>, StorageError> {
        let mut hashes = Vec::new();
        for item in self.chunks.iter() {
            let (key, _) = item?;
            if let Ok(bytes) = <[u8; 32]>::try_from(key.as_ref()) {
                hashes.push(ContentHash::from_bytes(bytes));
            }
        }
        Ok(hashes)
    }

    /// Full aggregate record
    pub fn metadata(&self) -> Result<StorageMetadata, StorageError> {
        self.load_metadata()
    }

    pub fn get_storage_stats(&self) -> Result<StorageStats, StorageError> {
        let metadata = self.load_metadata()?;
        Ok(StorageStats {
            node_id: metadata.node_id,
            total_chunks: metadata.total_chunks,
            total_size: metadata.total_size,
            file_count: metadata.files.len(),
            created_at: metadata.created_at,
        })
    }

    /// Flush changes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::create_file_manifest;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_store_and_retrieve() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();

        let data = b"test chunk data";
        let hash = ContentHash::from_data(data);

        assert_eq!(store.store_chunk(&hash, data).unwrap(), StoreOutcome::Stored);
        assert!(store.has_chunk(&hash).unwrap());
        assert_eq!(store.retrieve_chunk(&hash).unwrap(), data.to_vec());
    }

    #[test]
    fn test_missing_chunk() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        let hash = ContentHash::from_data(b"absent");
        assert!(matches!(
            store.retrieve_chunk(&hash),
            Err(StorageError::ChunkNotFound(h)) if h == hash
        ));
        assert!(!store.has_chunk(&hash).unwrap());
    }

    #[test]
    fn test_dedup_counts_once() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();

        let data = b"same bytes";
        let hash = ContentHash::from_data(data);

        store.store_chunk(&hash, data).unwrap();
        assert_eq!(store.store_chunk(&hash, data).unwrap(), StoreOutcome::Existing);

        let stats = store.get_storage_stats().unwrap();
        assert_eq!(stats.total_chunks, 1);
        assert_eq!(stats.total_size, data.len() as u64);
    }

    #[test]
    fn test_existing_blob_untouched() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();

        let hash = ContentHash::from_data(b"plain");
        store.store_chunk(&hash, b"first ciphertext").unwrap();
        store.store_chunk(&hash, b"second ciphertext").unwrap();

        assert_eq!(store.retrieve_chunk(&hash).unwrap(), b"first ciphertext".to_vec());
    }

    #[test]
    fn test_sealed_chunk_keeps_first_seal() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();

        let hash = ContentHash::from_data(b"plain");
        let first = ChunkSeal {
            iv: "00".repeat(12),
            auth_tag: "11".repeat(16),
            key: "22".repeat(32),
        };
        let second = ChunkSeal {
            key: "33".repeat(32),
            ..first.clone()
        };

        assert_eq!(store.store_sealed_chunk(&hash, b"c1", &first).unwrap(), StoreOutcome::Stored);
        assert_eq!(store.store_sealed_chunk(&hash, b"c2", &second).unwrap(), StoreOutcome::Existing);

        assert_eq!(store.chunk_seal(&hash).unwrap(), Some(first));
        assert_eq!(store.retrieve_chunk(&hash).unwrap(), b"c1".to_vec());
        assert_eq!(store.chunk_size(&hash).unwrap(), Some(2));

        assert!(store.delete_chunk(&hash).unwrap());
        assert_eq!(store.chunk_seal(&hash).unwrap(), None);
        assert_eq!(store.chunk_size(&hash).unwrap(), None);
    }

    #[test]
    fn test_plaintext_chunk_has_no_seal() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();

        let hash = ContentHash::from_data(b"clear");
        store.store_chunk(&hash, b"clear").unwrap();
        assert_eq!(store.chunk_seal(&hash).unwrap(), None);
    }

    #[test]
    fn test_concurrent_identical_writes() {
        let dir = tempdir().unwrap();
        let store = Arc::new(LocalStore::open(dir.path()).unwrap());

        let data = b"raced".to_vec();
        let hash = ContentHash::from_data(&data);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let data = data.clone();
                std::thread::spawn(move || store.store_chunk(&hash, &data).unwrap())
            })
            .collect();

        let stored = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| *o == StoreOutcome::Stored)
            .count();

        assert_eq!(stored, 1);
        assert_eq!(store.get_storage_stats().unwrap().total_chunks, 1);
    }

    #[test]
    fn test_manifest_roundtrip_assigns_id() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();

        let mut manifest = create_file_manifest(b"hello manifest", "hello.txt", 4, Utc::now()).unwrap();
        let expected = manifest.compute_id().unwrap();

        let id = store.store_manifest(&mut manifest).unwrap();
        assert_eq!(id, expected);
        assert_eq!(manifest.id, Some(id));

        let loaded = store.retrieve_manifest(&id).unwrap();
        assert_eq!(loaded, manifest);
        assert_eq!(store.list_manifests().unwrap(), vec![id]);

        let metadata = store.metadata().unwrap();
        let summary = &metadata.files[&id.to_hex()];
        assert_eq!(summary.file_name, "hello.txt");
        assert_eq!(summary.chunks, 4);
        assert_eq!(store.get_storage_stats().unwrap().file_count, 1);
    }

    #[test]
    fn test_missing_manifest() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        let id = ContentHash::from_data(b"nope");
        assert!(matches!(
            store.retrieve_manifest(&id),
            Err(StorageError::ManifestNotFound(_))
        ));
    }

    #[test]
    fn test_metadata_survives_reopen() {
        let dir = tempdir().unwrap();
        let node_id = {
            let store = LocalStore::open(dir.path()).unwrap();
            store.store_chunk(&ContentHash::from_data(b"a"), b"a").unwrap();
            store.flush().unwrap();
            store.get_storage_stats().unwrap().node_id
        };

        let store = LocalStore::open(dir.path()).unwrap();
        let stats = store.get_storage_stats().unwrap();
        assert_eq!(stats.node_id, node_id);
        assert_eq!(stats.node_id.len(), 64);
        assert_eq!(stats.total_chunks, 1);
    }

    #[test]
    fn test_delete_chunk() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();

        let hash = ContentHash::from_data(b"gone");
        store.store_chunk(&hash, b"gone").unwrap();
        assert!(store.delete_chunk(&hash).unwrap());
        assert!(!store.delete_chunk(&hash).unwrap());
        assert_eq!(store.get_storage_stats().unwrap().total_chunks, 0);
        assert!(store.list_chunks().unwrap().is_empty());
    }
}
