//! P2P storage daemon
//!
//! Opens the local store, joins the libp2p network, answers discovery and
//! replication requests, and runs until ctrl-c.

use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use p2p_storage::network::substrate::{get_first_value, node_key};
use p2p_storage::network::{NodeConfig, NodeDescriptor, StorageNode, SwarmSubstrate};
use p2p_storage::storage::LocalStore;

fn data_dir() -> PathBuf {
    match std::env::var_os("P2P_STORAGE_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("p2p-storage"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    tracing::info!("Starting P2P storage node");

    let config = NodeConfig::from_env()?;

    let data_dir = data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let store = Arc::new(LocalStore::open(data_dir.join("store"))?);
    tracing::info!("Local store opened at {:?}", data_dir);

    let (substrate, driver) = SwarmSubstrate::spawn(&config)?;
    let node = Arc::new(StorageNode::new(Arc::new(substrate), store.clone(), config));

    node.start_handlers().await?;
    node.announce_stored_chunks(&store.list_chunks()?).await?;
    let descriptor = node.announce_node().await?;

    tracing::info!(
        "Node {} ready: {} chunks, {} bytes, {} files",
        descriptor.peer_id,
        descriptor.total_chunks,
        descriptor.total_size,
        descriptor.file_count
    );

    for (peer, _) in &node.config().bootstrap_peers {
        let Some(record) = get_first_value(node.substrate().as_ref(), &node_key(&peer.to_string())).await
        else {
            continue;
        };
        match serde_json::from_slice::<NodeDescriptor>(&record.value) {
            Ok(known) => tracing::info!(
                "Bootstrap peer {} holds {} chunks in {} files",
                known.peer_id,
                known.total_chunks,
                known.file_count
            ),
            Err(e) => tracing::warn!("Unreadable descriptor for {}: {}", peer, e),
        }
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down"),
        _ = driver => tracing::warn!("Swarm driver exited"),
    }

    store.flush()?;
    Ok(())
}
