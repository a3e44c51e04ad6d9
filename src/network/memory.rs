//! In-process network substrate
//!
//! All peers joined to one `MemoryNetwork` share a DHT and topic table.
//! Used by tests and for running several nodes inside one process.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use super::substrate::{DhtRecord, NetworkSubstrate, SubstrateError};

/// Per-subscription buffer
const SUBSCRIPTION_CAPACITY: usize = 256;

struct Subscriber {
    peer_id: String,
    tx: mpsc::Sender<Vec<u8>>,
}

#[derive(Default)]
struct Hub {
    dht: HashMap<Vec<u8>, Vec<DhtRecord>>,
    topics: HashMap<String, Vec<Subscriber>>,
}

/// Shared hub that peers join
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a peer with the given identity
    pub fn join(&self, peer_id: impl Into<String>) -> MemorySubstrate {
        MemorySubstrate {
            peer_id: peer_id.into(),
            hub: self.hub.clone(),
        }
    }
}

/// One peer's view of a `MemoryNetwork`
pub struct MemorySubstrate {
    peer_id: String,
    hub: Arc<Mutex<Hub>>,
}

#[async_trait]
impl NetworkSubstrate for MemorySubstrate {
    fn local_peer_id(&self) -> String {
        self.peer_id.clone()
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), SubstrateError> {
        let targets: Vec<mpsc::Sender<Vec<u8>>> = {
            let mut hub = self.hub.lock();
            match hub.topics.get_mut(topic) {
                Some(subscribers) => {
                    subscribers.retain(|s| !s.tx.is_closed());
                    subscribers
                        .iter()
                        .filter(|s| s.peer_id != self.peer_id)
                        .map(|s| s.tx.clone())
                        .collect()
                }
                None => Vec::new(),
            }
        };

        debug!("{} published to {} ({} receivers)", self.peer_id, topic, targets.len());

        for tx in targets {
            match tx.try_send(payload.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("Subscriber on {} is full, dropping message", topic);
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>, SubstrateError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        self.hub
            .lock()
            .topics
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber {
                peer_id: self.peer_id.clone(),
                tx,
            });
        Ok(rx)
    }

    async fn dht_put(&self, key: &[u8], value: Vec<u8>) -> Result<(), SubstrateError> {
        let record = DhtRecord {
            value,
            from: self.peer_id.clone(),
        };
        let mut hub = self.hub.lock();
        let values = hub.dht.entry(key.to_vec()).or_default();
        if !values.contains(&record) {
            values.push(record);
        }
        Ok(())
    }

    async fn dht_get(&self, key: &[u8]) -> Result<Vec<DhtRecord>, SubstrateError> {
        Ok(self.hub.lock().dht.get(key).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dht_multi_valued() {
        let network = MemoryNetwork::new();
        let a = network.join("a");
        let b = network.join("b");

        a.dht_put(b"k", b"a".to_vec()).await.unwrap();
        a.dht_put(b"k", b"a".to_vec()).await.unwrap();
        b.dht_put(b"k", b"b".to_vec()).await.unwrap();

        let records = b.dht_get(b"k").await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().any(|r| r.from == "a" && r.value == b"a"));
        assert!(a.dht_get(b"missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_reaches_other_peers_only() {
        let network = MemoryNetwork::new();
        let a = network.join("a");
        let b = network.join("b");

        let mut a_rx = a.subscribe("t").await.unwrap();
        let mut b_rx = b.subscribe("t").await.unwrap();

        a.publish("t", b"hello".to_vec()).await.unwrap();

        assert_eq!(b_rx.recv().await.unwrap(), b"hello".to_vec());
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let network = MemoryNetwork::new();
        let a = network.join("a");
        a.publish("nobody", b"x".to_vec()).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_receiver_pruned() {
        let network = MemoryNetwork::new();
        let a = network.join("a");
        let b = network.join("b");

        drop(b.subscribe("t").await.unwrap());
        a.publish("t", b"x".to_vec()).await.unwrap();
        assert!(network.hub.lock().topics["t"].is_empty());
    }
}
