//! Chunk replication
//!
//! Replica state is never persisted: the provider set for a chunk is read
//! from `chunk:<hash>` whenever it is needed. Replication requests are
//! broadcast; holders answer on `replication/response`. Bulk transfer to a
//! new holder needs a direct connection and is not part of this protocol.

use tracing::{debug, info, warn};

use super::node::{answer_lookup, NodeError, StorageNode};
use super::protocol::{
    ReplicationRequest, ReplicationResponse, REPLICATION_REQUEST_TOPIC, REPLICATION_RESPONSE_TOPIC,
};
use super::substrate::{chunk_key, lookup_values, provider_set};
use crate::crypto::ContentHash;

/// Replicas to aim for when the caller does not say
pub const DEFAULT_REPLICATION_FACTOR: usize = 3;

impl StorageNode {
    /// Register as provider and broadcast a replication request.
    ///
    /// Returns the request id.
    pub async fn replicate_chunk(
        &self,
        hash: &ContentHash,
        replication_factor: usize,
    ) -> Result<String, NodeError> {
        let request_id = self.new_request_id();
        self.send_replication_request(&request_id, hash).await?;
        info!(
            "Replication request sent for chunk {} (target {} replicas)",
            hash, replication_factor
        );
        Ok(request_id)
    }

    async fn send_replication_request(&self, request_id: &str, hash: &ContentHash) -> Result<(), NodeError> {
        self.substrate()
            .dht_put(&chunk_key(hash), self.peer_id().into_bytes())
            .await?;

        let request = ReplicationRequest {
            request_id: request_id.to_string(),
            chunk_hash: hash.to_hex(),
            requester: self.peer_id(),
            timestamp: self.now().timestamp_millis(),
        };
        self.publish_message(REPLICATION_REQUEST_TOPIC, &request).await
    }

    /// Answer a replication request with whether we hold the chunk
    pub async fn handle_replication_request(
        &self,
        request: &ReplicationRequest,
    ) -> Result<ReplicationResponse, NodeError> {
        let lookup = match ContentHash::from_hex(&request.chunk_hash) {
            Ok(hash) => self.store().has_chunk(&hash).map(|held| held.then_some(())),
            Err(_) => Ok(None),
        };
        let answer = answer_lookup("Chunk", &request.chunk_hash, lookup);

        let response = ReplicationResponse {
            request_id: request.request_id.clone(),
            chunk_hash: request.chunk_hash.clone(),
            provider: self.peer_id(),
            success: answer.is_ok(),
            reason: answer.err(),
        };

        self.publish_message(REPLICATION_RESPONSE_TOPIC, &response).await?;
        debug!(
            "Answered replication request {} from {}: {}",
            request.request_id, request.requester, response.success
        );
        Ok(response)
    }

    /// Record a provider claim. Claims for requests nobody is waiting on are
    /// only logged.
    pub async fn handle_replication_response(&self, response: ReplicationResponse) {
        if response.success {
            info!(
                "Peer {} has chunk {} from request {}",
                response.provider, response.chunk_hash, response.request_id
            );
        }
        let request_id = response.request_id.clone();
        if !self.replication_requests.resolve(&request_id, response).await {
            debug!("Unmatched replication response {}", request_id);
        }
    }

    /// Count distinct providers for a chunk and solicit more if below `target`.
    ///
    /// Returns the provider count found before any new request.
    pub async fn check_replication_factor(&self, hash: &ContentHash, target: usize) -> Result<usize, NodeError> {
        let records = lookup_values(self.substrate().as_ref(), &chunk_key(hash)).await;
        let providers = provider_set(&records);

        info!("Found {}/{} replicas for chunk {}", providers.len(), target, hash);

        if providers.len() < target {
            if self.store().has_chunk(hash)? {
                if let Err(e) = self.replicate_chunk(hash, target).await {
                    warn!("Cannot initiate replication for chunk {}: {}", hash, e);
                }
            } else {
                warn!("Cannot initiate replication for chunk {}: not held locally", hash);
            }
        }

        Ok(providers.len())
    }

    /// Register every given chunk as held by this node
    pub async fn announce_stored_chunks(&self, hashes: &[ContentHash]) -> Result<(), NodeError> {
        info!("Announcing {} chunks to the network", hashes.len());
        let peer_id = self.peer_id();
        for hash in hashes {
            self.substrate()
                .dht_put(&chunk_key(hash), peer_id.clone().into_bytes())
                .await?;
        }
        Ok(())
    }

    /// Broadcast a replication request and wait for up to `target` peers to
    /// claim the chunk within the response timeout.
    pub async fn solicit_replicas(&self, hash: &ContentHash, target: usize) -> Result<Vec<String>, NodeError> {
        let request_id = self.new_request_id();
        let rx = self.replication_requests.register(&request_id).await;

        if let Err(e) = self.send_replication_request(&request_id, hash).await {
            self.replication_requests.remove(&request_id).await;
            return Err(e);
        }

        let holders: Vec<String> = self
            .replication_requests
            .collect(&request_id, rx, self.config().response_timeout, usize::MAX)
            .await
            .into_iter()
            .filter(|r| r.success)
            .map(|r| r.provider)
            .take(target)
            .collect();

        info!("{}/{} peers confirmed chunk {}", holders.len(), target, hash);
        Ok(holders)
    }
}
