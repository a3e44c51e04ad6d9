//! libp2p network substrate
//!
//! A single driver task owns the `Swarm`. `SwarmSubstrate` handles talk to
//! it over a command channel and get answers on oneshot channels.
//!
//! - `publish`/`subscribe` map onto gossipsub topics
//! - `dht_put`/`dht_get` map onto Kademlia records. Kademlia keeps one record
//!   per key per peer, so a lookup returns at most one value per responder.

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::{
    gossipsub::{self, IdentTopic, PublishError, TopicHash},
    identify, identity, kad, noise,
    swarm::SwarmEvent,
    tcp, yamux, Multiaddr, PeerId, Swarm,
};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::behaviour::{StorageBehaviour, StorageBehaviourEvent};
use super::node::NodeConfig;
use super::substrate::{DhtRecord, NetworkSubstrate, SubstrateError};

const COMMAND_CAPACITY: usize = 100;
const SUBSCRIPTION_CAPACITY: usize = 256;

type Reply<T> = oneshot::Sender<Result<T, SubstrateError>>;

enum Command {
    Publish {
        topic: String,
        payload: Vec<u8>,
        reply: Reply<()>,
    },
    Subscribe {
        topic: String,
        reply: Reply<mpsc::Receiver<Vec<u8>>>,
    },
    DhtPut {
        key: Vec<u8>,
        value: Vec<u8>,
        reply: Reply<()>,
    },
    DhtGet {
        key: Vec<u8>,
        reply: Reply<Vec<DhtRecord>>,
    },
}

struct PendingGet {
    records: Vec<DhtRecord>,
    reply: Reply<Vec<DhtRecord>>,
}

/// Handle to the libp2p driver task
#[derive(Clone)]
pub struct SwarmSubstrate {
    peer_id: PeerId,
    commands: mpsc::Sender<Command>,
}

impl SwarmSubstrate {
    /// Build the swarm, start listening, dial bootstrap peers and spawn the
    /// driver task.
    pub fn spawn(config: &NodeConfig) -> Result<(Self, JoinHandle<()>), SubstrateError> {
        let local_key = identity::Keypair::generate_ed25519();
        let peer_id = local_key.public().to_peer_id();
        info!("Local peer ID: {}", peer_id);

        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(local_key)
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| SubstrateError::Transport(e.to_string()))?
            .with_behaviour(|key| {
                StorageBehaviour::new(key).map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
            })
            .map_err(|e| SubstrateError::Transport(e.to_string()))?
            .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(60)))
            .build();

        let listen_addr: Multiaddr = format!("/ip4/0.0.0.0/tcp/{}", config.listen_port)
            .parse()
            .map_err(|e: libp2p::multiaddr::Error| SubstrateError::Transport(e.to_string()))?;
        swarm
            .listen_on(listen_addr)
            .map_err(|e| SubstrateError::Transport(e.to_string()))?;

        for (peer, addr) in &config.bootstrap_peers {
            swarm.behaviour_mut().kademlia.add_address(peer, addr.clone());
            if let Err(e) = swarm.dial(addr.clone()) {
                warn!("Failed to dial bootstrap peer {}: {}", peer, e);
            }
        }
        if !config.bootstrap_peers.is_empty() {
            if let Err(e) = swarm.behaviour_mut().kademlia.bootstrap() {
                warn!("Kademlia bootstrap failed: {:?}", e);
            }
        }

        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let driver = SwarmDriver {
            swarm,
            commands: rx,
            subscriptions: HashMap::new(),
            pending_puts: HashMap::new(),
            pending_gets: HashMap::new(),
        };
        let handle = tokio::spawn(driver.run());

        Ok((Self { peer_id, commands: tx }, handle))
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, SubstrateError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| SubstrateError::Closed)?;
        rx.await.map_err(|_| SubstrateError::Closed)?
    }
}

#[async_trait]
impl NetworkSubstrate for SwarmSubstrate {
    fn local_peer_id(&self) -> String {
        self.peer_id.to_string()
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), SubstrateError> {
        let topic = topic.to_string();
        self.request(|reply| Command::Publish { topic, payload, reply }).await
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>, SubstrateError> {
        let topic = topic.to_string();
        self.request(|reply| Command::Subscribe { topic, reply }).await
    }

    async fn dht_put(&self, key: &[u8], value: Vec<u8>) -> Result<(), SubstrateError> {
        let key = key.to_vec();
        self.request(|reply| Command::DhtPut { key, value, reply }).await
    }

    async fn dht_get(&self, key: &[u8]) -> Result<Vec<DhtRecord>, SubstrateError> {
        let key = key.to_vec();
        self.request(|reply| Command::DhtGet { key, reply }).await
    }
}

struct SwarmDriver {
    swarm: Swarm<StorageBehaviour>,
    commands: mpsc::Receiver<Command>,
    subscriptions: HashMap<TopicHash, Vec<mpsc::Sender<Vec<u8>>>>,
    pending_puts: HashMap<kad::QueryId, Reply<()>>,
    pending_gets: HashMap<kad::QueryId, PendingGet>,
}

impl SwarmDriver {
    /// Run until every `SwarmSubstrate` handle is dropped
    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
            }
        }
        info!("Swarm driver stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Publish { topic, payload, reply } => {
                let result = match self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .publish(IdentTopic::new(topic.clone()), payload)
                {
                    Ok(_) => Ok(()),
                    // Nobody to deliver to yet; broadcast has no delivery guarantee
                    Err(PublishError::InsufficientPeers) | Err(PublishError::Duplicate) => {
                        debug!("No peers to receive message on {}", topic);
                        Ok(())
                    }
                    Err(e) => Err(SubstrateError::Publish {
                        topic,
                        reason: format!("{:?}", e),
                    }),
                };
                let _ = reply.send(result);
            }
            Command::Subscribe { topic, reply } => {
                let ident = IdentTopic::new(topic.clone());
                let result = match self.swarm.behaviour_mut().gossipsub.subscribe(&ident) {
                    Ok(_) => {
                        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
                        self.subscriptions.entry(ident.hash()).or_default().push(tx);
                        info!("Subscribed to topic: {}", topic);
                        Ok(rx)
                    }
                    Err(e) => Err(SubstrateError::Subscribe {
                        topic,
                        reason: format!("{:?}", e),
                    }),
                };
                let _ = reply.send(result);
            }
            Command::DhtPut { key, value, reply } => {
                let record = kad::Record::new(kad::RecordKey::new(&key), value);
                match self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .put_record(record, kad::Quorum::One)
                {
                    Ok(query_id) => {
                        self.pending_puts.insert(query_id, reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(SubstrateError::DhtPut(format!("{:?}", e))));
                    }
                }
            }
            Command::DhtGet { key, reply } => {
                let query_id = self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .get_record(kad::RecordKey::new(&key));
                self.pending_gets.insert(
                    query_id,
                    PendingGet {
                        records: Vec::new(),
                        reply,
                    },
                );
            }
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<StorageBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on {}", address);
            }
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                info!("Connected to {}", peer_id);
            }
            SwarmEvent::ConnectionClosed { peer_id, .. } => {
                info!("Disconnected from {}", peer_id);
            }
            SwarmEvent::Behaviour(StorageBehaviourEvent::Gossipsub(event)) => {
                self.handle_gossipsub_event(event);
            }
            SwarmEvent::Behaviour(StorageBehaviourEvent::Kademlia(event)) => {
                self.handle_kad_event(event);
            }
            SwarmEvent::Behaviour(StorageBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                debug!("Identified peer {}: {:?}", peer_id, info.protocols);
                for addr in info.listen_addrs {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr);
                }
            }
            _ => {}
        }
    }

    fn handle_gossipsub_event(&mut self, event: gossipsub::Event) {
        match event {
            gossipsub::Event::Message { message, .. } => {
                let Some(subscribers) = self.subscriptions.get_mut(&message.topic) else {
                    return;
                };
                subscribers.retain(|tx| !tx.is_closed());
                for tx in subscribers.iter() {
                    if tx.try_send(message.data.clone()).is_err() {
                        warn!("Subscriber on {} is full, dropping message", message.topic);
                    }
                }
            }
            gossipsub::Event::Subscribed { peer_id, topic } => {
                debug!("Peer {} subscribed to {}", peer_id, topic);
            }
            _ => {}
        }
    }

    fn handle_kad_event(&mut self, event: kad::Event) {
        let (id, result, step) = match event {
            kad::Event::OutboundQueryProgressed { id, result, step, .. } => (id, result, step),
            kad::Event::RoutingUpdated { peer, .. } => {
                debug!("Kademlia routing updated for {}", peer);
                return;
            }
            _ => return,
        };

        match result {
            kad::QueryResult::PutRecord(result) => {
                let Some(reply) = self.pending_puts.remove(&id) else {
                    return;
                };
                let outcome = match result {
                    Ok(_) => Ok(()),
                    // Stored locally; no remote peer confirmed it yet
                    Err(kad::PutRecordError::QuorumFailed { key, .. }) => {
                        debug!("Record {:?} stored locally only", key);
                        Ok(())
                    }
                    Err(e) => Err(SubstrateError::DhtPut(e.to_string())),
                };
                let _ = reply.send(outcome);
            }
            kad::QueryResult::GetRecord(result) => {
                let finished = step.last;
                match result {
                    Ok(kad::GetRecordOk::FoundRecord(peer_record)) => {
                        if let Some(pending) = self.pending_gets.get_mut(&id) {
                            let from = peer_record
                                .record
                                .publisher
                                .or(peer_record.peer)
                                .unwrap_or(*self.swarm.local_peer_id());
                            let record = DhtRecord {
                                value: peer_record.record.value,
                                from: from.to_string(),
                            };
                            if !pending.records.contains(&record) {
                                pending.records.push(record);
                            }
                        }
                        if finished {
                            self.finish_get(id);
                        }
                    }
                    Ok(kad::GetRecordOk::FinishedWithNoAdditionalRecord { .. }) => {
                        self.finish_get(id);
                    }
                    Err(e) => {
                        debug!("Record lookup ended: {}", e);
                        self.finish_get(id);
                    }
                }
            }
            kad::QueryResult::Bootstrap(Ok(ok)) => {
                debug!("Kademlia bootstrap step, {} remaining", ok.num_remaining);
            }
            _ => {}
        }
    }

    fn finish_get(&mut self, id: kad::QueryId) {
        if let Some(pending) = self.pending_gets.remove(&id) {
            let _ = pending.reply.send(Ok(pending.records));
        }
    }
}
