//! File upload pipeline
//!
//! chunk -> (encrypt) -> store locally -> register provider -> replicate
//! -> manifest -> DAG -> register file -> announce.
//!
//! Chunks are deduplicated by plaintext hash. A repeated chunk inside one
//! file reuses the first occurrence's entry; a chunk already stored by an
//! earlier upload is described in the manifest by its stored seal, so the
//! manifest always matches the bytes on disk.
//!
//! Nothing is rolled back on failure: chunks and DHT entries written before
//! the error stay in place.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::node::{NodeError, StorageNode};
use super::protocol::{FileAnnouncement, FILE_ANNOUNCE_TOPIC};
use super::substrate::{chunk_key, cid_key, file_key, manifest_key};
use crate::crypto::{encrypt_chunk, generate_encryption_key, verify_chunk, ContentHash, EncryptionKey};
use crate::files::{split_to_chunks, Chunk, FileManifest, ManifestChunk, DEFAULT_CHUNK_SIZE};
use crate::ipld::{create_file_dag, create_raw_cid, Cid};
use crate::storage::{ChunkSeal, StoreOutcome};

/// Upload options
#[derive(Clone, Debug)]
pub struct UploadOptions {
    pub encrypt: bool,
    pub chunk_size: usize,
    /// Target number of peers holding each chunk
    pub replication_factor: usize,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            encrypt: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
            replication_factor: 3,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub file_id: String,
    pub file_name: String,
    pub size: u64,
    pub chunks: usize,
    pub encrypted: bool,
    #[serde(rename = "rootCID")]
    pub root_cid: Cid,
}

impl StorageNode {
    /// Upload a file to the network
    pub async fn upload_file(
        &self,
        data: &[u8],
        file_name: &str,
        options: UploadOptions,
    ) -> Result<UploadResult, NodeError> {
        info!("Starting upload for file: {} ({} bytes)", file_name, data.len());

        let key = options.encrypt.then(generate_encryption_key);
        let chunks = split_to_chunks(data, options.chunk_size)?;
        info!("Split file into {} chunks", chunks.len());

        let mut manifest = FileManifest::from_chunks(file_name, options.chunk_size, &chunks, self.now());
        let mut chunk_cids = Vec::with_capacity(chunks.len());
        let mut processed: HashMap<ContentHash, (ManifestChunk, Cid)> = HashMap::new();
        let peer_id = self.peer_id();

        for (i, (chunk, entry)) in chunks.iter().zip(manifest.chunks.iter_mut()).enumerate() {
            if let Some((first, cid)) = processed.get(&chunk.hash) {
                *entry = first.clone();
                chunk_cids.push(cid.clone());
                debug!("Chunk {}/{} repeats {}", i + 1, chunks.len(), chunk.hash);
                continue;
            }

            let cid = self.store_upload_chunk(chunk, key.as_ref(), entry)?;

            self.substrate()
                .dht_put(&chunk_key(&chunk.hash), peer_id.clone().into_bytes())
                .await?;

            if options.replication_factor > 1 {
                self.replicate_chunk(&chunk.hash, options.replication_factor).await?;
            }

            entry.cid = Some(cid.clone());
            chunk_cids.push(cid.clone());
            processed.insert(chunk.hash, (entry.clone(), cid));

            info!("Processed chunk {}/{}: {}", i + 1, chunks.len(), chunk.hash);
        }

        manifest.encrypted = key.is_some();
        manifest.encryption_key = key.map(|k| k.to_hex());

        let manifest_id = self.store().store_manifest(&mut manifest)?.to_hex();

        let dag = create_file_dag(&manifest, &chunk_cids)?;

        self.substrate()
            .dht_put(&file_key(file_name), manifest_id.clone().into_bytes())
            .await?;
        self.substrate()
            .dht_put(&manifest_key(&manifest_id), peer_id.clone().into_bytes())
            .await?;

        let announcement = FileAnnouncement {
            action: "upload".to_string(),
            file_id: manifest_id.clone(),
            file_name: file_name.to_string(),
            provider: peer_id,
            size: data.len() as u64,
            chunks: chunks.len(),
            root_cid: dag.root.cid.clone(),
        };
        self.publish_message(FILE_ANNOUNCE_TOPIC, &announcement).await?;

        info!("File upload complete: {}, ID: {}", file_name, manifest_id);

        Ok(UploadResult {
            file_id: manifest_id,
            file_name: file_name.to_string(),
            size: data.len() as u64,
            chunks: chunks.len(),
            encrypted: manifest.encrypted,
            root_cid: dag.root.cid,
        })
    }

    /// Store one chunk, optionally sealed under `key`, and fill in how it is
    /// stored. Returns the CID of the bytes actually in the store.
    fn store_upload_chunk(
        &self,
        chunk: &Chunk,
        key: Option<&EncryptionKey>,
        entry: &mut ManifestChunk,
    ) -> Result<Cid, NodeError> {
        match key {
            Some(key) => {
                let encrypted = encrypt_chunk(chunk, key.as_bytes())?;
                let seal = ChunkSeal {
                    iv: encrypted.iv_hex(),
                    auth_tag: encrypted.auth_tag_hex(),
                    key: key.to_hex(),
                };
                let outcome = self
                    .store()
                    .store_sealed_chunk(&chunk.hash, &encrypted.encrypted_data, &seal)?;
                if outcome == StoreOutcome::Stored {
                    entry.iv = Some(seal.iv);
                    entry.auth_tag = Some(seal.auth_tag);
                    return Ok(create_raw_cid(&encrypted.encrypted_data));
                }
            }
            None => {
                if self.store().store_chunk(&chunk.hash, &chunk.data)? == StoreOutcome::Stored {
                    return Ok(create_raw_cid(&chunk.data));
                }
            }
        }

        let stored = self.store().retrieve_chunk(&chunk.hash)?;
        match self.store().chunk_seal(&chunk.hash)? {
            Some(seal) => {
                debug!("Chunk {} already stored sealed; reusing its seal", chunk.hash);
                let file_key = key.map(|k| k.to_hex());
                entry.encryption_key = (file_key.as_deref() != Some(seal.key.as_str())).then_some(seal.key);
                entry.iv = Some(seal.iv);
                entry.auth_tag = Some(seal.auth_tag);
            }
            None if verify_chunk(&chunk.hash, &stored) => {
                if key.is_some() {
                    warn!("Chunk {} already stored in the clear; it stays unencrypted", chunk.hash);
                }
            }
            None => return Err(NodeError::UnreadableChunk(chunk.hash)),
        }
        Ok(create_raw_cid(&stored))
    }

    /// Register `cid:<cid>` with caller metadata plus provider and timestamp.
    ///
    /// Returns false if the DHT write fails.
    pub async fn store_cid(&self, cid: &Cid, metadata: Map<String, Value>) -> bool {
        let mut record = metadata;
        record.insert("provider".to_string(), Value::String(self.peer_id()));
        record.insert("timestamp".to_string(), Value::from(self.now().timestamp_millis()));

        let value = match serde_json::to_vec(&Value::Object(record)) {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to encode metadata for CID {}: {}", cid, e);
                return false;
            }
        };

        match self.substrate().dht_put(&cid_key(cid), value).await {
            Ok(()) => {
                info!("Stored CID {} in the network", cid);
                true
            }
            Err(e) => {
                warn!("Failed to store CID {}: {}", cid, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::memory::MemoryNetwork;
    use crate::network::node::test_support::{test_node, FixedClock};
    use crate::network::node::NodeConfig;
    use crate::network::protocol::{decode, REPLICATION_REQUEST_TOPIC};
    use crate::network::substrate::{get_first_value, provider_set, NetworkSubstrate};
    use crate::ipld::{parse_cid, Codec};
    use crate::storage::LocalStore;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::sync::Arc;

    const MIB: usize = 1024 * 1024;

    fn plain(replication_factor: usize) -> UploadOptions {
        UploadOptions {
            encrypt: false,
            chunk_size: MIB,
            replication_factor,
        }
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_default_options() {
        let options = UploadOptions::default();
        assert!(options.encrypt);
        assert_eq!(options.chunk_size, MIB);
        assert_eq!(options.replication_factor, 3);
    }

    #[tokio::test]
    async fn test_upload_unencrypted_three_chunks() {
        let network = MemoryNetwork::new();
        let (node, _dir) = test_node(&network, "peer-a");

        let data = patterned(3 * MIB);
        let result = node.upload_file(&data, "big.bin", plain(1)).await.unwrap();

        assert_eq!(result.chunks, 3);
        assert!(!result.encrypted);
        assert_eq!(result.size, data.len() as u64);
        assert_eq!(parse_cid(result.root_cid.as_str()).unwrap().codec, Codec::DagJson);

        let id = ContentHash::from_hex(&result.file_id).unwrap();
        let manifest = node.store().retrieve_manifest(&id).unwrap();
        assert_eq!(manifest.chunk_count(), 3);
        assert!(manifest.encryption_key.is_none());
        for (entry, expected) in manifest.chunks.iter().zip(data.chunks(MIB)) {
            assert_eq!(entry.cid.as_ref().unwrap(), &create_raw_cid(expected));
            assert!(entry.iv.is_none());
        }
    }

    #[tokio::test]
    async fn test_upload_registers_dht_pointers() {
        let network = MemoryNetwork::new();
        let (node, _dir) = test_node(&network, "peer-a");
        let observer = network.join("observer");

        let result = node.upload_file(b"hello world", "hello.txt", plain(1)).await.unwrap();

        let file_ref = get_first_value(&observer, &file_key("hello.txt")).await.unwrap();
        assert_eq!(file_ref.value_str(), Some(result.file_id.as_str()));

        let manifest_ref = get_first_value(&observer, &manifest_key(&result.file_id)).await.unwrap();
        assert_eq!(manifest_ref.value_str(), Some("peer-a"));

        let providers = observer
            .dht_get(&chunk_key(&ContentHash::from_data(b"hello world")))
            .await
            .unwrap();
        assert!(provider_set(&providers).contains("peer-a"));
    }

    #[tokio::test]
    async fn test_upload_encrypted_stores_ciphertext() {
        let network = MemoryNetwork::new();
        let (node, _dir) = test_node(&network, "peer-a");

        let data = patterned(10_000);
        let options = UploadOptions {
            chunk_size: 4096,
            replication_factor: 1,
            ..UploadOptions::default()
        };
        let result = node.upload_file(&data, "secret.bin", options).await.unwrap();
        assert!(result.encrypted);

        let id = ContentHash::from_hex(&result.file_id).unwrap();
        let manifest = node.store().retrieve_manifest(&id).unwrap();
        assert_eq!(manifest.encryption_key.as_ref().unwrap().len(), 64);

        for (entry, plaintext) in manifest.chunks.iter().zip(data.chunks(4096)) {
            let stored = node.store().retrieve_chunk(&entry.hash).unwrap();
            assert_ne!(stored, plaintext);
            assert_eq!(stored.len(), plaintext.len());
            assert_eq!(entry.iv.as_ref().unwrap().len(), 24);
            assert_eq!(entry.auth_tag.as_ref().unwrap().len(), 32);
            assert_eq!(entry.cid.as_ref().unwrap(), &create_raw_cid(&stored));
        }
    }

    #[tokio::test]
    async fn test_upload_announces_and_replicates() {
        let network = MemoryNetwork::new();
        let (node, _dir) = test_node(&network, "peer-a");
        let listener = network.join("listener");
        let mut announcements = listener.subscribe(FILE_ANNOUNCE_TOPIC).await.unwrap();
        let mut replication = listener.subscribe(REPLICATION_REQUEST_TOPIC).await.unwrap();

        let data = patterned(2 * MIB);
        let result = node.upload_file(&data, "two.bin", plain(3)).await.unwrap();

        let announcement: FileAnnouncement = decode(&announcements.recv().await.unwrap()).unwrap();
        assert_eq!(announcement.action, "upload");
        assert_eq!(announcement.file_id, result.file_id);
        assert_eq!(announcement.chunks, 2);
        assert_eq!(announcement.root_cid, result.root_cid);

        let mut requests = 0;
        while replication.try_recv().is_ok() {
            requests += 1;
        }
        assert_eq!(requests, 2);
    }

    #[tokio::test]
    async fn test_upload_rejects_zero_chunk_size() {
        let network = MemoryNetwork::new();
        let (node, _dir) = test_node(&network, "peer-a");
        let options = UploadOptions {
            chunk_size: 0,
            ..UploadOptions::default()
        };
        assert!(matches!(
            node.upload_file(b"x", "x", options).await,
            Err(NodeError::Chunk(_))
        ));
    }

    #[tokio::test]
    async fn test_store_cid_adds_provider_and_timestamp() {
        let network = MemoryNetwork::new();
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalStore::open(dir.path()).unwrap());
        let at = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
        let node = StorageNode::new(Arc::new(network.join("peer-a")), store, NodeConfig::default())
            .with_clock(Arc::new(FixedClock(at)));

        let cid = create_raw_cid(b"some content");
        let mut metadata = Map::new();
        metadata.insert("label".to_string(), json!("photos"));
        assert!(node.store_cid(&cid, metadata).await);

        let record = get_first_value(node.substrate().as_ref(), &cid_key(&cid)).await.unwrap();
        let value: Value = serde_json::from_slice(&record.value).unwrap();
        assert_eq!(value["label"], "photos");
        assert_eq!(value["provider"], "peer-a");
        assert_eq!(value["timestamp"], at.timestamp_millis());
    }
}
