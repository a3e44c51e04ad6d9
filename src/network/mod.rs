//! Network layer
//!
//! - `substrate`: the broadcast + DHT capability the pipelines consume
//! - `memory` / `swarm`: in-process and libp2p implementations of it
//! - `node`: the `StorageNode` context and message dispatch
//! - `upload`, `retrieval`, `replication`: the pipelines

pub mod behaviour;
pub mod memory;
pub mod node;
pub mod pending;
pub mod protocol;
pub mod replication;
pub mod retrieval;
pub mod substrate;
pub mod swarm;
pub mod upload;

pub use behaviour::StorageBehaviour;
pub use memory::{MemoryNetwork, MemorySubstrate};
pub use node::{parse_bootstrap_peers, Clock, NodeConfig, NodeError, StorageNode, SystemClock};
pub use pending::PendingRequests;
pub use protocol::{
    ChunkRequest, ChunkResponse, FileAnnouncement, FileRequest, FileResponse, NodeDescriptor,
    ReplicationRequest, ReplicationResponse,
};
pub use replication::DEFAULT_REPLICATION_FACTOR;
pub use retrieval::{FileLocation, RetrievedFile};
pub use substrate::{get_first_value, DhtRecord, NetworkSubstrate, SubstrateError};
pub use swarm::SwarmSubstrate;
pub use upload::{UploadOptions, UploadResult};
