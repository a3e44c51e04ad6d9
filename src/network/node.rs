//! Storage node context
//!
//! `StorageNode` bundles everything the pipelines need: the substrate
//! handle, the local store, a clock and the pending-request tables. Upload,
//! retrieval and replication are implemented on it in their own modules.

use chrono::{DateTime, Utc};
use libp2p::{Multiaddr, PeerId};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::pending::PendingRequests;
use super::protocol::{
    decode, encode, ChunkRequest, ChunkResponse, FileAnnouncement, FileRequest, FileResponse,
    NodeDescriptor, ReplicationRequest, ReplicationResponse, ALL_TOPICS, CHUNK_REQUEST_TOPIC,
    CHUNK_RESPONSE_TOPIC, FILE_ANNOUNCE_TOPIC, FILE_REQUEST_TOPIC, FILE_RESPONSE_TOPIC,
    REPLICATION_REQUEST_TOPIC, REPLICATION_RESPONSE_TOPIC,
};
use super::substrate::{node_key, NetworkSubstrate, SubstrateError};
use crate::crypto::{ContentHash, EncryptionError};
use crate::files::ChunkError;
use crate::ipld::{CidError, DagError};
use crate::storage::{LocalStore, StorageError};

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Encryption error: {0}")]
    Encryption(#[from] EncryptionError),
    #[error("Chunking error: {0}")]
    Chunk(#[from] ChunkError),
    #[error("CID error: {0}")]
    Cid(#[from] CidError),
    #[error("DAG error: {0}")]
    Dag(#[from] DagError),
    #[error("Network error: {0}")]
    Substrate(#[from] SubstrateError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("File {0} not found in the network")]
    FileNotFound(String),
    #[error("Chunk {0} not available")]
    ChunkUnavailable(ContentHash),
    #[error("Chunk {0} does not match its hash")]
    CorruptChunk(ContentHash),
    #[error("Chunk {0} is stored without a seal and does not match its hash")]
    UnreadableChunk(ContentHash),
    #[error("Manifest {file_id} not available locally; network retrieval not implemented ({responses} peers answered)")]
    RemoteRetrievalUnimplemented { file_id: String, responses: usize },
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Node configuration
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Port to listen on (0 for random)
    pub listen_port: u16,
    /// Bootstrap peers to connect to
    pub bootstrap_peers: Vec<(PeerId, Multiaddr)>,
    /// How long to wait for broadcast responses
    pub response_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,
            bootstrap_peers: vec![],
            response_timeout: Duration::from_secs(5),
        }
    }
}

impl NodeConfig {
    /// Read `P2P_STORAGE_PORT` and `P2P_STORAGE_BOOTSTRAP` over the defaults
    pub fn from_env() -> Result<Self, NodeError> {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("P2P_STORAGE_PORT") {
            config.listen_port = port
                .trim()
                .parse()
                .map_err(|_| NodeError::Config(format!("invalid port: {}", port)))?;
        }
        if let Ok(peers) = std::env::var("P2P_STORAGE_BOOTSTRAP") {
            config.bootstrap_peers = parse_bootstrap_peers(&peers)?;
        }

        Ok(config)
    }
}

/// Parse a comma-separated list of `<peer-id>@<multiaddr>`
pub fn parse_bootstrap_peers(s: &str) -> Result<Vec<(PeerId, Multiaddr)>, NodeError> {
    s.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (peer, addr) = entry
                .split_once('@')
                .ok_or_else(|| NodeError::Config(format!("expected <peer-id>@<multiaddr>: {}", entry)))?;
            let peer: PeerId = peer
                .parse()
                .map_err(|_| NodeError::Config(format!("invalid peer id: {}", peer)))?;
            let addr: Multiaddr = addr
                .parse()
                .map_err(|_| NodeError::Config(format!("invalid multiaddr: {}", addr)))?;
            Ok((peer, addr))
        })
        .collect()
}

/// Source of timestamps
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A storage peer: local store plus network substrate
pub struct StorageNode {
    substrate: Arc<dyn NetworkSubstrate>,
    store: Arc<LocalStore>,
    clock: Arc<dyn Clock>,
    config: NodeConfig,
    pub(crate) file_requests: PendingRequests<FileResponse>,
    pub(crate) chunk_requests: PendingRequests<ChunkResponse>,
    pub(crate) replication_requests: PendingRequests<ReplicationResponse>,
}

impl StorageNode {
    pub fn new(substrate: Arc<dyn NetworkSubstrate>, store: Arc<LocalStore>, config: NodeConfig) -> Self {
        Self {
            substrate,
            store,
            clock: Arc::new(SystemClock),
            config,
            file_requests: PendingRequests::new(),
            chunk_requests: PendingRequests::new(),
            replication_requests: PendingRequests::new(),
        }
    }

    /// Replace the clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn peer_id(&self) -> String {
        self.substrate.local_peer_id()
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn substrate(&self) -> &Arc<dyn NetworkSubstrate> {
        &self.substrate
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Unique id for an outgoing request
    pub(crate) fn new_request_id(&self) -> String {
        format!("{}-{}", self.peer_id(), Uuid::new_v4())
    }

    pub(crate) async fn publish_message<T: Serialize>(
        &self,
        topic: &str,
        message: &T,
    ) -> Result<(), NodeError> {
        self.substrate.publish(topic, encode(message)?).await?;
        debug!("Published message to {}", topic);
        Ok(())
    }

    /// Subscribe to every protocol topic and dispatch incoming messages.
    ///
    /// One task per topic; each runs until its subscription closes.
    pub async fn start_handlers(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>, NodeError> {
        let mut handles = Vec::with_capacity(ALL_TOPICS.len());

        for topic in ALL_TOPICS {
            let mut rx = self.substrate.subscribe(topic).await?;
            let node = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                while let Some(payload) = rx.recv().await {
                    node.dispatch(topic, &payload).await;
                }
                debug!("Subscription to {} closed", topic);
            }));
        }

        info!("Storage handlers initialized on {} topics", handles.len());
        Ok(handles)
    }

    async fn dispatch(&self, topic: &str, payload: &[u8]) {
        let result = match topic {
            FILE_ANNOUNCE_TOPIC => decode::<FileAnnouncement>(payload)
                .map_err(NodeError::from)
                .map(|a| self.handle_announcement(&a)),
            FILE_REQUEST_TOPIC => match decode::<FileRequest>(payload) {
                Ok(request) => self.handle_file_request(&request).await.map(|_| ()),
                Err(e) => Err(e.into()),
            },
            FILE_RESPONSE_TOPIC => match decode::<FileResponse>(payload) {
                Ok(response) => {
                    self.handle_file_response(response).await;
                    Ok(())
                }
                Err(e) => Err(e.into()),
            },
            CHUNK_REQUEST_TOPIC => match decode::<ChunkRequest>(payload) {
                Ok(request) => self.handle_chunk_request(&request).await.map(|_| ()),
                Err(e) => Err(e.into()),
            },
            CHUNK_RESPONSE_TOPIC => match decode::<ChunkResponse>(payload) {
                Ok(response) => {
                    self.handle_chunk_response(response).await;
                    Ok(())
                }
                Err(e) => Err(e.into()),
            },
            REPLICATION_REQUEST_TOPIC => match decode::<ReplicationRequest>(payload) {
                Ok(request) => self.handle_replication_request(&request).await.map(|_| ()),
                Err(e) => Err(e.into()),
            },
            REPLICATION_RESPONSE_TOPIC => match decode::<ReplicationResponse>(payload) {
                Ok(response) => {
                    self.handle_replication_response(response).await;
                    Ok(())
                }
                Err(e) => Err(e.into()),
            },
            other => {
                debug!("Ignoring message on unknown topic {}", other);
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!("Error processing message on {}: {}", topic, e);
        }
    }

    fn handle_announcement(&self, announcement: &FileAnnouncement) {
        info!(
            "Peer {} announced {} ({} bytes, {} chunks, id {}, root {})",
            announcement.provider,
            announcement.file_name,
            announcement.size,
            announcement.chunks,
            announcement.file_id,
            announcement.root_cid
        );
    }

    /// Publish this node's descriptor under `node:<peerId>`
    pub async fn announce_node(&self) -> Result<NodeDescriptor, NodeError> {
        let stats = self.store.get_storage_stats()?;
        let descriptor = NodeDescriptor {
            peer_id: self.peer_id(),
            announced_at: self.now().timestamp_millis(),
            total_chunks: stats.total_chunks,
            total_size: stats.total_size,
            file_count: stats.file_count,
        };

        self.substrate
            .dht_put(&node_key(&descriptor.peer_id), encode(&descriptor)?)
            .await?;

        info!("Announced node {} to the network", descriptor.peer_id);
        Ok(descriptor)
    }
}

/// Turn a local lookup made for a peer into a response payload or the
/// failure reason to send back. Lookup errors are logged, not propagated.
pub(crate) fn answer_lookup<T, E: std::fmt::Display>(
    subject: &str,
    key: &str,
    lookup: Result<Option<T>, E>,
) -> Result<T, String> {
    match lookup {
        Ok(Some(found)) => Ok(found),
        Ok(None) => Err(format!("{} not found", subject)),
        Err(e) => {
            warn!("{} lookup for {} failed: {}", subject, key, e);
            Err("Storage error".to_string())
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::network::memory::MemoryNetwork;
    use tempfile::TempDir;

    /// Fixed clock for deterministic timestamps
    pub struct FixedClock(pub DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    /// A node on `network` backed by a fresh temp store
    pub fn test_node(network: &MemoryNetwork, peer_id: &str) -> (Arc<StorageNode>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalStore::open(dir.path()).unwrap());
        let config = NodeConfig {
            response_timeout: Duration::from_millis(200),
            ..NodeConfig::default()
        };
        let node = StorageNode::new(Arc::new(network.join(peer_id)), store, config);
        (Arc::new(node), dir)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::network::memory::MemoryNetwork;
    use crate::network::substrate::get_first_value;
    use chrono::TimeZone;

    #[test]
    fn test_parse_bootstrap_peers() {
        let peer = libp2p::identity::Keypair::generate_ed25519().public().to_peer_id();
        let input = format!(" {peer}@/ip4/127.0.0.1/tcp/4001 ,, {peer}@/ip4/10.0.0.2/tcp/9000");
        let peers = parse_bootstrap_peers(&input).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].0, peer);
        assert_eq!(peers[1].1, "/ip4/10.0.0.2/tcp/9000".parse::<Multiaddr>().unwrap());

        assert!(parse_bootstrap_peers("").unwrap().is_empty());
        assert!(matches!(parse_bootstrap_peers("no-at-sign"), Err(NodeError::Config(_))));
        assert!(matches!(
            parse_bootstrap_peers("bad@/ip4/127.0.0.1/tcp/1"),
            Err(NodeError::Config(_))
        ));
    }

    #[test]
    fn test_answer_lookup_reasons() {
        assert_eq!(answer_lookup::<u64, StorageError>("Chunk", "ab", Ok(Some(5))), Ok(5));
        assert_eq!(
            answer_lookup::<u64, StorageError>("Chunk", "ab", Ok(None)),
            Err("Chunk not found".to_string())
        );

        let broken = serde_json::from_slice::<serde_json::Value>(b"{").unwrap_err();
        assert_eq!(
            answer_lookup::<u64, _>("Chunk", "ab", Err(StorageError::Serialization(broken))),
            Err("Storage error".to_string())
        );
    }

    #[tokio::test]
    async fn test_request_ids_unique_and_prefixed() {
        let network = MemoryNetwork::new();
        let (node, _dir) = test_node(&network, "peer-a");
        let a = node.new_request_id();
        let b = node.new_request_id();
        assert_ne!(a, b);
        assert!(a.starts_with("peer-a-"));
    }

    #[tokio::test]
    async fn test_announce_node_descriptor() {
        let network = MemoryNetwork::new();
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalStore::open(dir.path()).unwrap());
        store.store_chunk(&ContentHash::from_data(b"abc"), b"abc").unwrap();

        let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let node = StorageNode::new(Arc::new(network.join("peer-a")), store, NodeConfig::default())
            .with_clock(Arc::new(FixedClock(at)));

        let descriptor = node.announce_node().await.unwrap();
        assert_eq!(descriptor.total_chunks, 1);
        assert_eq!(descriptor.announced_at, at.timestamp_millis());

        let observer = network.join("peer-b");
        let record = get_first_value(&observer, &node_key("peer-a")).await.unwrap();
        let stored: NodeDescriptor = decode(&record.value).unwrap();
        assert_eq!(stored, descriptor);
    }

    #[tokio::test]
    async fn test_handlers_ignore_malformed_payloads() {
        let network = MemoryNetwork::new();
        let (node, _dir) = test_node(&network, "peer-a");
        node.start_handlers().await.unwrap();

        let other = network.join("peer-b");
        let mut responses = other.subscribe(FILE_RESPONSE_TOPIC).await.unwrap();
        other
            .publish(FILE_REQUEST_TOPIC, b"{not json".to_vec())
            .await
            .unwrap();

        let waited =
            tokio::time::timeout(Duration::from_millis(100), responses.recv()).await;
        assert!(waited.is_err());
    }
}
