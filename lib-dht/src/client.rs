//! Node assembly
//!
//! Wires the reactor, network, storage tables, DHT engine, and the
//! publishing loops into one running node from plain configuration
//! values. Command-line parsing and configuration files live with the
//! front ends; they hand a [`NodeConfig`] in.

use crate::network::DhtNode;
use crate::publishing::{Publisher, Replicator};
use anyhow::{Context, Result};
use lib_events::{EventReactor, TaskSlot, DEFAULT_QUEUE_SIZE, DEFAULT_SLOT_SIZE};
use lib_keys::KeyBytes;
use lib_network::Network;
use lib_storage::{
    AggregatedKvpTable, DatabaseKvpTable, KvpTable, SharedFilesKvpTable, DEFAULT_CACHE_SIZE,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// Plain configuration values a front end hands to the node
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// The listen address; port 0 asks the OS for one
    pub listen_address: SocketAddr,
    /// The node id; random when absent
    pub node_id: Option<KeyBytes>,
    /// Directory holding the cache and shared-files databases
    pub cache_dir: PathBuf,
    /// Capacity bound of the persistent cache
    pub cache_size: u64,
    /// Directories offered to the network
    pub shared_directories: Vec<PathBuf>,
    /// Addresses joined through at startup
    pub bootstrap_addresses: Vec<SocketAddr>,
    /// An initial known contact to join through
    pub known_node_address: Option<SocketAddr>,
}

impl NodeConfig {
    pub fn new(cache_dir: PathBuf) -> Self {
        NodeConfig {
            listen_address: "0.0.0.0:0".parse().expect("static address"),
            node_id: None,
            cache_dir,
            cache_size: DEFAULT_CACHE_SIZE,
            shared_directories: Vec::new(),
            bootstrap_addresses: Vec::new(),
            known_node_address: None,
        }
    }
}

/// A running node: reactor, network, storage, engine, and publish loops
pub struct Client {
    reactor: Arc<EventReactor>,
    network: Arc<Network>,
    cache_table: Arc<DatabaseKvpTable>,
    shared_files_table: Arc<SharedFilesKvpTable>,
    kvp_table: Arc<AggregatedKvpTable>,
    dht: Arc<DhtNode>,
    publisher: Arc<Publisher>,
    replicator: Arc<Replicator>,
    upload_slot: Arc<TaskSlot>,
}

impl Client {
    /// Build and start a node.
    ///
    /// Binds the socket, opens the databases, spawns the reactor, kicks
    /// off directory hashing, and joins through the known node when one is
    /// configured.
    pub async fn start(config: NodeConfig) -> Result<Client> {
        std::fs::create_dir_all(&config.cache_dir)
            .with_context(|| format!("creating cache dir {:?}", config.cache_dir))?;

        let reactor = EventReactor::new(DEFAULT_QUEUE_SIZE);

        let network = Network::new(reactor.clone(), config.listen_address)
            .await
            .context("binding UDP socket")?;

        let cache_table = Arc::new(
            DatabaseKvpTable::new(&config.cache_dir.join("cache.db"), config.cache_size)
                .context("opening cache database")?,
        );

        let shared_files_table =
            SharedFilesKvpTable::new(&config.cache_dir.join("shared_files.db"))
                .context("opening shared files database")?;

        for directory in &config.shared_directories {
            shared_files_table.add_shared_directory(directory.clone());
        }

        let kvp_table = Arc::new(AggregatedKvpTable::new(
            cache_table.clone(),
            vec![
                cache_table.clone() as Arc<dyn KvpTable>,
                shared_files_table.clone() as Arc<dyn KvpTable>,
            ],
        ));

        let upload_slot = TaskSlot::new(DEFAULT_SLOT_SIZE);
        let download_slot = TaskSlot::new(DEFAULT_SLOT_SIZE);

        let dht = DhtNode::new(
            reactor.clone(),
            network.clone(),
            kvp_table.clone() as Arc<dyn KvpTable>,
            config.node_id,
            download_slot,
        );

        let publisher = Publisher::new(
            reactor.clone(),
            dht.clone(),
            kvp_table.clone() as Arc<dyn KvpTable>,
            upload_slot.clone(),
        );

        let replicator = Replicator::new(
            reactor.clone(),
            dht.clone(),
            kvp_table.clone() as Arc<dyn KvpTable>,
            upload_slot.clone(),
        );

        {
            let reactor = reactor.clone();
            tokio::spawn(async move { reactor.run().await });
        }

        let join_targets = config
            .bootstrap_addresses
            .iter()
            .copied()
            .chain(config.known_node_address);

        for address in join_targets {
            let join = dht.join_network(address);

            tokio::spawn(async move {
                if !join.result().await {
                    warn!(%address, "join through known node failed");
                }
            });
        }

        let _ = shared_files_table.hash_directories();

        Ok(Client {
            reactor,
            network,
            cache_table,
            shared_files_table,
            kvp_table,
            dht,
            publisher,
            replicator,
            upload_slot,
        })
    }

    pub fn dht(&self) -> &Arc<DhtNode> {
        &self.dht
    }

    pub fn reactor(&self) -> &Arc<EventReactor> {
        &self.reactor
    }

    pub fn cache_table(&self) -> &Arc<DatabaseKvpTable> {
        &self.cache_table
    }

    pub fn shared_files_table(&self) -> &Arc<SharedFilesKvpTable> {
        &self.shared_files_table
    }

    pub fn kvp_table(&self) -> &Arc<AggregatedKvpTable> {
        &self.kvp_table
    }

    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    pub fn replicator(&self) -> &Arc<Replicator> {
        &self.replicator
    }

    /// The slot carrying outbound publications
    pub fn upload_slot(&self) -> &Arc<TaskSlot> {
        &self.upload_slot
    }

    /// The bound address of the node's socket
    pub fn address(&self) -> SocketAddr {
        self.network.server_address()
    }

    /// Post the stop event; every component drains and shuts down
    pub fn stop(&self) {
        let _ = self.reactor.put_stop();
    }
}
