//! Combined network behaviour for the libp2p substrate

use libp2p::{gossipsub, identify, identity, kad, ping, swarm::NetworkBehaviour, StreamProtocol};
use std::time::Duration;

use super::substrate::SubstrateError;

pub const KAD_PROTOCOL: StreamProtocol = StreamProtocol::new("/p2p-storage/kad/1.0.0");
pub const IDENTIFY_PROTOCOL: &str = "/p2p-storage/id/1.0.0";

/// Combined network behaviour
#[derive(NetworkBehaviour)]
pub struct StorageBehaviour {
    /// Topic broadcast for announcements and discovery requests
    pub gossipsub: gossipsub::Behaviour,
    /// Kademlia DHT holding `chunk:`, `file:`, `manifest:` and `node:` records
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
    /// Identify protocol for peer info exchange
    pub identify: identify::Behaviour,
    /// Ping for connection keepalive
    pub ping: ping::Behaviour,
}

impl StorageBehaviour {
    pub fn new(key: &identity::Keypair) -> Result<Self, SubstrateError> {
        let local_peer_id = key.public().to_peer_id();

        let gossipsub_config = gossipsub::ConfigBuilder::default()
            .heartbeat_interval(Duration::from_secs(1))
            .validation_mode(gossipsub::ValidationMode::Strict)
            .build()
            .map_err(|e| SubstrateError::Transport(e.to_string()))?;
        let gossipsub = gossipsub::Behaviour::new(
            gossipsub::MessageAuthenticity::Signed(key.clone()),
            gossipsub_config,
        )
        .map_err(|e| SubstrateError::Transport(e.to_string()))?;

        let mut kad_config = kad::Config::new(KAD_PROTOCOL);
        kad_config.set_query_timeout(Duration::from_secs(60));
        let store = kad::store::MemoryStore::new(local_peer_id);
        let mut kademlia = kad::Behaviour::with_config(local_peer_id, store, kad_config);
        // Serve records even before an external address is confirmed
        kademlia.set_mode(Some(kad::Mode::Server));

        let identify = identify::Behaviour::new(identify::Config::new(
            IDENTIFY_PROTOCOL.to_string(),
            key.public(),
        ));

        let ping = ping::Behaviour::new(ping::Config::new().with_interval(Duration::from_secs(30)));

        Ok(Self {
            gossipsub,
            kademlia,
            identify,
            ping,
        })
    }
}
