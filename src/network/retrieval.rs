//! File retrieval pipeline and discovery handlers
//!
//! Retrieval is local-first. When the manifest is not held locally a file
//! request is broadcast and provider claims are collected, but fetching a
//! remote manifest needs a direct transfer protocol that does not exist yet.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::node::{answer_lookup, NodeError, StorageNode};
use super::protocol::{
    ChunkRequest, ChunkResponse, FileRequest, FileResponse, CHUNK_REQUEST_TOPIC,
    CHUNK_RESPONSE_TOPIC, FILE_REQUEST_TOPIC, FILE_RESPONSE_TOPIC,
};
use super::substrate::{file_key, lookup_values, manifest_key, provider_set};
use crate::crypto::{
    decrypt_chunk, verify_chunk, ContentHash, EncryptedChunk, EncryptedPayload, EncryptionKey,
};
use crate::files::{reassemble_chunks, Chunk, FileManifest, ManifestChunk};
use crate::storage::StorageError;

/// A fully reassembled file
#[derive(Clone, Debug)]
pub struct RetrievedFile {
    pub file_name: String,
    pub data: Vec<u8>,
    pub size: u64,
    pub manifest: FileManifest,
}

/// A `file:<name>` entry found in the DHT
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileLocation {
    pub file_name: String,
    pub manifest_id: String,
    pub provider: String,
}

impl StorageNode {
    /// Retrieve a file by manifest id. Returns the whole file or an error.
    pub async fn retrieve_file(&self, file_id: &str) -> Result<RetrievedFile, NodeError> {
        info!("Starting retrieval for file: {}", file_id);

        let providers = provider_set(&lookup_values(self.substrate().as_ref(), &manifest_key(file_id)).await);
        if providers.is_empty() {
            return Err(NodeError::FileNotFound(file_id.to_string()));
        }
        info!("Found {} providers for file {}", providers.len(), file_id);

        let manifest = match self.local_manifest(file_id)? {
            Some(manifest) => manifest,
            None => {
                let responses = self.request_remote_manifest(file_id).await?;
                return Err(NodeError::RemoteRetrievalUnimplemented {
                    file_id: file_id.to_string(),
                    responses,
                });
            }
        };

        let key = match (manifest.encrypted, manifest.encryption_key.as_deref()) {
            (false, _) => None,
            (true, Some(hex_key)) => Some(EncryptionKey::from_hex(hex_key)?),
            (true, None) => {
                return Err(NodeError::InvalidManifest(
                    "encrypted manifest carries no key".to_string(),
                ))
            }
        };

        let total = manifest.chunk_count();
        let mut chunks = Vec::with_capacity(total);
        for (i, entry) in manifest.chunks.iter().enumerate() {
            chunks.push(self.load_chunk(entry, key.as_ref())?);
            debug!("Retrieved chunk {}/{}: {}", i + 1, total, entry.hash);
        }

        let data = if chunks.is_empty() {
            Vec::new()
        } else {
            reassemble_chunks(&chunks)?
        };

        info!("File retrieval complete: {}, size: {} bytes", manifest.file_name, data.len());

        Ok(RetrievedFile {
            file_name: manifest.file_name.clone(),
            size: data.len() as u64,
            data,
            manifest,
        })
    }

    fn local_manifest(&self, file_id: &str) -> Result<Option<FileManifest>, NodeError> {
        let Ok(id) = ContentHash::from_hex(file_id) else {
            return Ok(None);
        };
        match self.store().retrieve_manifest(&id) {
            Ok(manifest) => Ok(Some(manifest)),
            Err(StorageError::ManifestNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read one chunk from the local store, decrypting it when the entry is
    /// sealed. A per-chunk key takes precedence over `file_key`.
    fn load_chunk(&self, entry: &ManifestChunk, file_key: Option<&EncryptionKey>) -> Result<Chunk, NodeError> {
        let stored = match self.store().retrieve_chunk(&entry.hash) {
            Ok(stored) => stored,
            Err(StorageError::ChunkNotFound(hash)) => {
                warn!("Chunk {} not available locally", hash);
                return Err(NodeError::ChunkUnavailable(hash));
            }
            Err(e) => return Err(e.into()),
        };

        if !entry.is_sealed() {
            if !verify_chunk(&entry.hash, &stored) {
                return Err(NodeError::CorruptChunk(entry.hash));
            }
            return Ok(Chunk {
                hash: entry.hash,
                data: stored,
            });
        }

        let (Some(iv), Some(auth_tag)) = (entry.iv.as_deref(), entry.auth_tag.as_deref()) else {
            return Err(NodeError::InvalidManifest(format!(
                "chunk {} has only one of iv and auth tag",
                entry.hash
            )));
        };
        let chunk_key = entry
            .encryption_key
            .as_deref()
            .map(EncryptionKey::from_hex)
            .transpose()?;
        let key = chunk_key.as_ref().or(file_key).ok_or_else(|| {
            NodeError::InvalidManifest(format!("chunk {} is sealed but no key is available", entry.hash))
        })?;

        let payload = EncryptedPayload::from_hex_parts(stored, iv, auth_tag)?;
        let encrypted = EncryptedChunk {
            hash: entry.hash,
            encrypted_data: payload.encrypted_data,
            iv: payload.iv,
            auth_tag: payload.auth_tag,
        };
        Ok(decrypt_chunk(&encrypted, key.as_bytes())?)
    }

    /// Broadcast a file request and count peers claiming the manifest
    async fn request_remote_manifest(&self, file_id: &str) -> Result<usize, NodeError> {
        let request = FileRequest {
            request_id: self.new_request_id(),
            file_id: file_id.to_string(),
            requester: self.peer_id(),
        };

        let rx = self.file_requests.register(&request.request_id).await;
        if let Err(e) = self.publish_message(FILE_REQUEST_TOPIC, &request).await {
            self.file_requests.remove(&request.request_id).await;
            return Err(e);
        }

        let responses = self
            .file_requests
            .collect(&request.request_id, rx, self.config().response_timeout, usize::MAX)
            .await;

        let claims: Vec<&FileResponse> = responses.iter().filter(|r| r.success).collect();
        for claim in &claims {
            info!("Peer {} claims manifest {}", claim.provider, file_id);
        }
        warn!("Manifest {} not available locally; network retrieval not implemented", file_id);
        Ok(claims.len())
    }

    /// Every `file:<name>` reference in the DHT
    pub async fn locate_file_by_name(&self, file_name: &str) -> Vec<FileLocation> {
        info!("Searching for file: {}", file_name);

        let locations: Vec<FileLocation> = lookup_values(self.substrate().as_ref(), &file_key(file_name))
            .await
            .into_iter()
            .filter_map(|record| {
                let manifest_id = record.value_str()?.to_string();
                Some(FileLocation {
                    file_name: file_name.to_string(),
                    manifest_id,
                    provider: record.from,
                })
            })
            .collect();

        info!("Found {} references for file {}", locations.len(), file_name);
        locations
    }

    /// Answer a peer's file request with a summary or an explicit not-found
    pub async fn handle_file_request(&self, request: &FileRequest) -> Result<FileResponse, NodeError> {
        let answer = answer_lookup("File", &request.file_id, self.local_manifest(&request.file_id));

        let response = FileResponse {
            request_id: request.request_id.clone(),
            file_id: request.file_id.clone(),
            provider: self.peer_id(),
            success: answer.is_ok(),
            manifest: answer.as_ref().ok().map(|m| m.summary()),
            reason: answer.err(),
        };

        self.publish_message(FILE_RESPONSE_TOPIC, &response).await?;
        if response.success {
            info!("Responded to file request for {}", request.file_id);
        }
        Ok(response)
    }

    /// Answer a peer's chunk request with the stored size or an explicit not-found
    pub async fn handle_chunk_request(&self, request: &ChunkRequest) -> Result<ChunkResponse, NodeError> {
        let lookup = match ContentHash::from_hex(&request.chunk_hash) {
            Ok(hash) => self.store().chunk_size(&hash),
            Err(_) => Ok(None),
        };
        let answer = answer_lookup("Chunk", &request.chunk_hash, lookup);

        let response = ChunkResponse {
            request_id: request.request_id.clone(),
            chunk_hash: request.chunk_hash.clone(),
            provider: self.peer_id(),
            success: answer.is_ok(),
            size: answer.as_ref().ok().copied(),
            reason: answer.err(),
        };

        self.publish_message(CHUNK_RESPONSE_TOPIC, &response).await?;
        if response.success {
            info!("Responded to chunk request for {}", request.chunk_hash);
        }
        Ok(response)
    }

    pub async fn handle_file_response(&self, response: FileResponse) {
        if response.success {
            info!("Peer {} has file {}", response.provider, response.file_id);
        }
        let request_id = response.request_id.clone();
        if !self.file_requests.resolve(&request_id, response).await {
            debug!("Unmatched file response {}", request_id);
        }
    }

    pub async fn handle_chunk_response(&self, response: ChunkResponse) {
        if response.success {
            info!("Peer {} has chunk {}", response.provider, response.chunk_hash);
        }
        let request_id = response.request_id.clone();
        if !self.chunk_requests.resolve(&request_id, response).await {
            debug!("Unmatched chunk response {}", request_id);
        }
    }

    /// Broadcast a chunk request and return peers that claim the chunk
    pub async fn request_chunk_providers(&self, hash: &ContentHash) -> Result<Vec<String>, NodeError> {
        let request = ChunkRequest {
            request_id: self.new_request_id(),
            chunk_hash: hash.to_hex(),
            requester: self.peer_id(),
        };

        let rx = self.chunk_requests.register(&request.request_id).await;
        if let Err(e) = self.publish_message(CHUNK_REQUEST_TOPIC, &request).await {
            self.chunk_requests.remove(&request.request_id).await;
            return Err(e);
        }

        let providers: Vec<String> = self
            .chunk_requests
            .collect(&request.request_id, rx, self.config().response_timeout, usize::MAX)
            .await
            .into_iter()
            .filter(|r| r.success)
            .map(|r| r.provider)
            .collect();

        info!("{} peers claim chunk {}", providers.len(), hash);
        Ok(providers)
    }
}
