//! DHT network engine
//!
//! Dispatches the five RPCs over the network layer, keeps the routing
//! table fresh, and drives the shortlist lookups that publication and
//! retrieval are built on. Timeouts and malformed packets are never
//! errors here: they surface as absent results that feed back into the
//! shortlists.

use crate::models::{
    json_keys, nodes_from_json, nodes_to_json, rpcs, sort_nodes_by_distance, KvpExchangeInfo,
};
use crate::shortlist::Shortlist;
use crate::tables::{NodeInfo, RoutingError, RoutingTable, MAX_BUCKET_SIZE};
use crate::{MAX_VALUE_SIZE, NETWORK_ID, NETWORK_PARALLELISM, TIME_EXPIRE, TIME_REFRESH};
use lib_events::{
    Event, EventId, EventReactor, EventScheduler, Observer, Task, TaskSlot,
};
use lib_keys::{bucket_number, random_bucket_key, KeyBytes, KvpId};
use lib_network::transfer::DownloadTask;
use lib_network::wire::{DataPacket, PacketDict};
use lib_network::{Network, PacketReceiver};
use lib_storage::table::unix_now;
use lib_storage::KvpTable;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A successful ping: the measured round trip and the peer's descriptor
#[derive(Clone, Debug)]
pub struct PingResult {
    pub round_trip_time: Duration,
    pub node: NodeInfo,
}

/// A FIND_VALUE answer: either exchange infos or more nodes to try
#[derive(Clone, Debug, Default)]
pub struct FindValueResult {
    pub kvp_infos: Option<Vec<KvpExchangeInfo>>,
    pub nodes: Option<Vec<NodeInfo>>,
}

/// Fired when an upload to a single node starts (`added`) and finishes
#[derive(Clone)]
pub struct StoreNodeEvent {
    pub added: bool,
    pub node: NodeInfo,
    pub task: Task<u64>,
}

/// The distributed hash table engine
pub struct DhtNode {
    self_ref: Weak<DhtNode>,
    reactor: Arc<EventReactor>,
    network: Arc<Network>,
    routing_table: RoutingTable,
    key: KeyBytes,
    kvp_table: Arc<dyn KvpTable>,
    scheduler: EventScheduler,
    refresh_timer_id: EventId,
    download_slot: Arc<TaskSlot>,
    store_observer: Arc<Observer<StoreNodeEvent>>,
    // Keeps the network's weak receive handler alive
    dispatcher: Mutex<Option<Arc<dyn PacketReceiver>>>,
}

struct PacketDispatcher(Weak<DhtNode>);

impl PacketReceiver for PacketDispatcher {
    fn receive_packet(&self, packet: DataPacket) {
        if let Some(node) = self.0.upgrade() {
            node.receive_packet(packet);
        }
    }
}

impl DhtNode {
    /// Wire the engine onto a network and storage table.
    ///
    /// Registers itself as the network's packet receiver and starts the
    /// periodic bucket refresh.
    pub fn new(
        reactor: Arc<EventReactor>,
        network: Arc<Network>,
        kvp_table: Arc<dyn KvpTable>,
        node_id: Option<KeyBytes>,
        download_slot: Arc<TaskSlot>,
    ) -> Arc<Self> {
        let key = node_id.unwrap_or_else(KeyBytes::new_random);

        let node = Arc::new_cyclic(|weak| DhtNode {
            self_ref: weak.clone(),
            reactor: reactor.clone(),
            network: network.clone(),
            routing_table: RoutingTable::new(key),
            key,
            kvp_table,
            scheduler: EventScheduler::new(reactor),
            refresh_timer_id: EventId::new(),
            download_slot,
            store_observer: Arc::new(Observer::new()),
            dispatcher: Mutex::new(None),
        });

        let dispatcher: Arc<dyn PacketReceiver> =
            Arc::new(PacketDispatcher(Arc::downgrade(&node)));
        network.set_receive_handler(&dispatcher);
        *node.dispatcher.lock() = Some(dispatcher);

        node.setup_timers();

        info!(key = %node.key, address = %network.server_address(), "dht node started");

        node
    }

    fn strong(&self) -> Arc<DhtNode> {
        self.self_ref.upgrade().expect("dht node alive")
    }

    fn setup_timers(&self) {
        self.scheduler.every(
            Duration::from_secs(TIME_REFRESH / 4),
            Event::plain(self.refresh_timer_id),
        );

        let weak = self.self_ref.clone();
        self.reactor.register_handler(self.refresh_timer_id, move |_| {
            if let Some(node) = weak.upgrade() {
                tokio::spawn(async move { node.refresh_buckets().await });
            }
        });
    }

    pub fn key(&self) -> &KeyBytes {
        &self.key
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    pub fn address(&self) -> SocketAddr {
        self.network.server_address()
    }

    /// Our own node descriptor
    pub fn node(&self) -> NodeInfo {
        NodeInfo::new(self.key, self.address())
    }

    /// The slot gating inbound store transfers
    pub fn download_slot(&self) -> &Arc<TaskSlot> {
        &self.download_slot
    }

    /// Observer fired as store-to-node uploads start and finish
    pub fn store_observer(&self) -> &Arc<Observer<StoreNodeEvent>> {
        &self.store_observer
    }

    /// A payload dict holding the network id and our node id
    fn template_dict(&self) -> PacketDict {
        let mut payload = PacketDict::new();
        payload.insert(
            json_keys::NETWORK_ID.to_string(),
            Value::String(NETWORK_ID.to_string()),
        );
        payload.insert(
            json_keys::NODE_ID.to_string(),
            Value::String(self.key.base64()),
        );

        payload
    }

    fn receive_packet(&self, packet: DataPacket) {
        if packet.get_str(json_keys::NETWORK_ID) != Some(NETWORK_ID) {
            debug!(address = %packet.address, "unknown network id, discarding");
            return;
        }

        self.update_routing_table_from_packet(&packet);

        let rpc = packet.get_str(json_keys::RPC).map(str::to_string);

        match rpc.as_deref() {
            Some(rpcs::PING) => self.received_ping_rpc(&packet),
            Some(rpcs::FIND_NODE) => self.received_find_node_rpc(&packet),
            Some(rpcs::FIND_VALUE) => self.received_find_value_rpc(&packet),
            Some(rpcs::GET_VALUE) => {
                let node = self.strong();
                tokio::spawn(async move { node.received_get_value_rpc(packet).await });
            }
            Some(rpcs::STORE) => {
                let node = self.strong();
                tokio::spawn(async move { node.received_store_rpc(packet).await });
            }
            rpc => debug!(?rpc, "received unknown rpc"),
        }
    }

    fn packet_to_node(&self, packet: &DataPacket) -> Option<NodeInfo> {
        let key = packet
            .get_str(json_keys::NODE_ID)
            .and_then(KeyBytes::parse_silent)?;

        Some(NodeInfo::new(key, packet.address))
    }

    fn update_routing_table_from_packet(&self, packet: &DataPacket) {
        if let Some(node) = self.packet_to_node(packet) {
            self.update_routing_table(node);
        }
    }

    /// Update the routing table with a node that contacted or answered us
    pub fn update_routing_table(&self, node: NodeInfo) {
        if node.key == self.key {
            debug!(%node, "ignore node with our id on routing table update");
            return;
        }

        match self.routing_table.node_update(&node) {
            Ok(()) => {}
            Err(RoutingError::SelfNodeRejected) => {}
            Err(RoutingError::BucketFull {
                bucket_number,
                head,
                candidate,
            }) => {
                let this = self.strong();

                tokio::spawn(async move {
                    this.update_full_bucket(bucket_number, head, candidate).await;
                });
            }
        }
    }

    /// Resolve a full bucket by pinging its oldest node
    async fn update_full_bucket(
        self: Arc<Self>,
        bucket_number: usize,
        head: NodeInfo,
        candidate: NodeInfo,
    ) {
        debug!(bucket_number, "bucket full, verifying head");

        let responded = self.ping_node(&head).result().await.is_some();
        let bucket = &self.routing_table.buckets()[bucket_number];

        if responded {
            debug!(%head, %candidate, "bucket keeps old node");
            bucket.keep_old_node();
        } else {
            debug!(%head, %candidate, "bucket drops head for candidate");
            bucket.keep_new_node();
        }
    }

    /// Join the network through a known address.
    ///
    /// Pings the address, then asks it for nodes close to our own id and
    /// seeds the routing table with the answer.
    pub fn join_network(&self, address: SocketAddr) -> Task<bool> {
        info!(%address, "joining network");
        let this = self.strong();

        Task::spawn(move |ctx| async move {
            let ping_task = this.ping_address(address);
            ctx.hook(&ping_task);

            let ping = match ping_task.result().await {
                Some(ping) => ping,
                None => return false,
            };

            let own_key = this.key;
            let find_task = this.find_nodes_from_node(&ping.node, &own_key);
            ctx.hook(&find_task);

            match find_task.result().await {
                Some(nodes) => {
                    for node in nodes {
                        this.update_routing_table(node);
                    }

                    true
                }
                None => false,
            }
        })
    }

    /// Ping an address, returning the round trip time and node descriptor
    pub fn ping_address(&self, address: SocketAddr) -> Task<Option<PingResult>> {
        debug!(%address, "ping");
        let this = self.strong();

        Task::spawn(move |ctx| async move {
            let start = Instant::now();

            let mut payload = this.template_dict();
            payload.insert(
                json_keys::RPC.to_string(),
                Value::String(rpcs::PING.to_string()),
            );

            let send_task = match this
                .network
                .send_expect_reply(address, payload, this.network.default_timeout())
            {
                Ok(task) => task,
                Err(_) => return None,
            };

            ctx.hook(&send_task);

            let packet = send_task.result().await?;

            this.update_routing_table_from_packet(&packet);
            let node = this.packet_to_node(&packet)?;

            Some(PingResult {
                round_trip_time: start.elapsed(),
                node,
            })
        })
    }

    /// Ping a node
    pub fn ping_node(&self, node: &NodeInfo) -> Task<Option<PingResult>> {
        self.ping_address(node.address)
    }

    fn received_ping_rpc(&self, packet: &DataPacket) {
        debug!(address = %packet.address, "pong");
        let _ = self
            .network
            .send_answer_reply(packet, self.template_dict());
    }

    /// Ask a node for its closest nodes to a key
    pub fn find_nodes_from_node(
        &self,
        node: &NodeInfo,
        key: &KeyBytes,
    ) -> Task<Option<Vec<NodeInfo>>> {
        debug!(%node, %key, "find node");
        let this = self.strong();
        let node = node.clone();
        let key = *key;

        Task::spawn(move |ctx| async move {
            let mut payload = this.template_dict();
            payload.insert(
                json_keys::RPC.to_string(),
                Value::String(rpcs::FIND_NODE.to_string()),
            );
            payload.insert(json_keys::KEY.to_string(), Value::String(key.base64()));

            let send_task = match this.network.send_expect_reply(
                node.address,
                payload,
                this.network.default_timeout(),
            ) {
                Ok(task) => task,
                Err(_) => return None,
            };

            ctx.hook(&send_task);

            let packet = send_task.result().await?;
            this.update_routing_table_from_packet(&packet);

            let node_list = packet.payload.get(json_keys::NODES)?;

            match nodes_from_json(node_list) {
                Ok(nodes) => Some(nodes),
                Err(err) => {
                    debug!(%err, %node, "find node reply invalid");
                    None
                }
            }
        })
    }

    /// Ask a node about values for a key, optionally filtered to an index
    pub fn find_value_from_node(
        &self,
        node: &NodeInfo,
        key: &KeyBytes,
        index: Option<&KeyBytes>,
    ) -> Task<Option<FindValueResult>> {
        debug!(%node, %key, "find value");
        let this = self.strong();
        let node = node.clone();
        let key = *key;
        let index = index.copied();

        Task::spawn(move |ctx| async move {
            let mut payload = this.template_dict();
            payload.insert(
                json_keys::RPC.to_string(),
                Value::String(rpcs::FIND_VALUE.to_string()),
            );
            payload.insert(json_keys::KEY.to_string(), Value::String(key.base64()));

            if let Some(index) = index {
                payload.insert(json_keys::INDEX.to_string(), Value::String(index.base64()));
            }

            let send_task = match this.network.send_expect_reply(
                node.address,
                payload,
                this.network.default_timeout(),
            ) {
                Ok(task) => task,
                Err(_) => return None,
            };

            ctx.hook(&send_task);

            let packet = send_task.result().await?;
            this.update_routing_table_from_packet(&packet);

            if let Some(values) = packet.payload.get(json_keys::VALUES) {
                match KvpExchangeInfo::list_from_json(values) {
                    Ok(infos) => {
                        return Some(FindValueResult {
                            kvp_infos: Some(infos),
                            nodes: None,
                        })
                    }
                    Err(err) => {
                        debug!(%err, %node, "find value infos invalid");
                        return None;
                    }
                }
            }

            if let Some(node_list) = packet.payload.get(json_keys::NODES) {
                match nodes_from_json(node_list) {
                    Ok(nodes) => {
                        return Some(FindValueResult {
                            kvp_infos: None,
                            nodes: Some(nodes),
                        })
                    }
                    Err(err) => {
                        debug!(%err, %node, "find value nodes invalid");
                        return None;
                    }
                }
            }

            None
        })
    }

    fn received_find_node_rpc(&self, packet: &DataPacket) {
        let key = match packet.get_str(json_keys::KEY).and_then(KeyBytes::parse_silent) {
            Some(key) => key,
            None => {
                debug!(address = %packet.address, "find node with bad key");
                return;
            }
        };

        self.reply_find_node(packet, &key);
    }

    fn reply_find_node(&self, packet: &DataPacket, key: &KeyBytes) {
        let nodes = self.routing_table.get_close_nodes(key, MAX_BUCKET_SIZE);

        let mut payload = self.template_dict();
        payload.insert(json_keys::NODES.to_string(), nodes_to_json(&nodes));

        debug!(address = %packet.address, count = nodes.len(), "find node reply");
        let _ = self.network.send_answer_reply(packet, payload);
    }

    fn received_find_value_rpc(&self, packet: &DataPacket) {
        let key = match packet.get_str(json_keys::KEY).and_then(KeyBytes::parse_silent) {
            Some(key) => key,
            None => {
                debug!(address = %packet.address, "find value with bad key");
                return;
            }
        };

        let index = packet
            .get_str(json_keys::INDEX)
            .and_then(KeyBytes::parse_silent);

        let infos = match self.local_exchange_infos(&key, index.as_ref()) {
            Ok(infos) => infos,
            Err(err) => {
                warn!(%err, "find value lookup failed");
                return;
            }
        };

        if let Some(infos) = infos {
            let mut payload = self.template_dict();
            payload.insert(
                json_keys::VALUES.to_string(),
                KvpExchangeInfo::list_to_json(&infos),
            );

            let _ = self.network.send_answer_reply(packet, payload);
        } else {
            self.reply_find_node(packet, &key);
        }
    }

    /// Exchange infos for the pairs we hold under a key, or `None` when
    /// there are none
    fn local_exchange_infos(
        &self,
        key: &KeyBytes,
        index: Option<&KeyBytes>,
    ) -> Result<Option<Vec<KvpExchangeInfo>>, lib_storage::StorageError> {
        if let Some(index) = index {
            let kvpid = KvpId::new(*key, *index);

            if let Some(record) = self.kvp_table.record(&kvpid)? {
                return Ok(Some(vec![KvpExchangeInfo::from_record(&record)]));
            }
        }

        let records = self.kvp_table.records_by_key(key)?;

        if records.is_empty() {
            return Ok(None);
        }

        Ok(Some(
            records.iter().map(KvpExchangeInfo::from_record).collect(),
        ))
    }

    /// Run a node lookup for a key
    pub fn find_node_shortlist(&self, key: &KeyBytes) -> Task<Arc<Shortlist>> {
        self.find_shortlist(key, None, true)
    }

    /// Run a value lookup for a key, optionally filtered to an index
    pub fn find_value_shortlist(
        &self,
        key: &KeyBytes,
        index: Option<&KeyBytes>,
    ) -> Task<Arc<Shortlist>> {
        self.find_shortlist(key, index, false)
    }

    fn find_shortlist(
        &self,
        key: &KeyBytes,
        index: Option<&KeyBytes>,
        find_nodes: bool,
    ) -> Task<Arc<Shortlist>> {
        let this = self.strong();
        let key = *key;
        let index = index.copied();

        Task::spawn(move |ctx| async move {
            let shortlist = Arc::new(Shortlist::new(key, &this.routing_table, this.node()));

            while ctx.is_running() && !shortlist.is_finished() {
                let batch = shortlist.take_nodes_for_contacting(NETWORK_PARALLELISM);

                let contacts: Vec<(NodeInfo, Task<Option<FindValueResult>>)> = batch
                    .into_iter()
                    .map(|node| {
                        let task = if find_nodes {
                            let find = this.find_nodes_from_node(&node, &key);
                            ctx.hook(&find);

                            map_find_nodes(find)
                        } else {
                            let find = this.find_value_from_node(&node, &key, index.as_ref());
                            ctx.hook(&find);

                            find
                        };

                        (node, task)
                    })
                    .collect();

                for (node, task) in contacts {
                    match task.result().await {
                        None => {
                            debug!(%node, "lookup contact timed out");
                            shortlist.mark_inactive(&node);
                        }
                        Some(result) => {
                            if let Some(nodes) = result.nodes {
                                debug!(%node, count = nodes.len(), "lookup got nodes");
                                shortlist.add_nodes(nodes);
                                shortlist.mark_responded(&node, false, &[]);
                            } else if let Some(infos) = result.kvp_infos {
                                debug!(%node, count = infos.len(), "lookup got values");
                                shortlist.mark_responded(&node, true, &infos);
                            } else {
                                shortlist.mark_responded(&node, false, &[]);
                            }
                        }
                    }
                }
            }

            debug!(count = shortlist.nodes().len(), "lookup done");

            shortlist
        })
    }

    /// Download, from a node, the value associated to a pair.
    ///
    /// `offset` resumes the value part way in.
    pub fn get_value_from_node(
        &self,
        node: &NodeInfo,
        key: &KeyBytes,
        index: Option<&KeyBytes>,
        offset: u64,
    ) -> Arc<DownloadTask> {
        let transfer_id = self.network.new_sequence_id();

        let mut payload = self.template_dict();
        payload.insert(
            json_keys::RPC.to_string(),
            Value::String(rpcs::GET_VALUE.to_string()),
        );
        payload.insert(json_keys::KEY.to_string(), Value::String(key.base64()));
        payload.insert(
            json_keys::INDEX.to_string(),
            Value::String(index.unwrap_or(key).base64()),
        );
        payload.insert(
            json_keys::TRANSFER_ID.to_string(),
            Value::String(transfer_id.clone()),
        );

        if offset > 0 {
            payload.insert(json_keys::VALUE_OFFSET.to_string(), Value::from(offset));
        }

        let download = self.network.expect_incoming_transfer(
            &transfer_id,
            self.network.default_timeout(),
            None,
        );

        debug!(%node, %transfer_id, "get value");
        let _ = self.network.send(node.address, payload);

        download
    }

    async fn received_get_value_rpc(self: Arc<Self>, packet: DataPacket) {
        debug!(address = %packet.address, "get value request");

        let key = packet.get_str(json_keys::KEY).and_then(KeyBytes::parse_silent);
        let index = packet
            .get_str(json_keys::INDEX)
            .and_then(KeyBytes::parse_silent);

        let (key, index) = match (key, index) {
            (Some(key), Some(index)) => (key, index),
            _ => return,
        };

        let transfer_id = match packet.get_str(json_keys::TRANSFER_ID) {
            Some(id) => id.to_string(),
            None => {
                debug!("missing transfer id");
                return;
            }
        };

        let offset = match packet.payload.get(json_keys::VALUE_OFFSET) {
            None => 0,
            Some(value) => match value.as_u64() {
                Some(offset) => offset,
                None => {
                    debug!("offset parse error");
                    return;
                }
            },
        };

        let kvpid = KvpId::new(key, index);

        let data = match self.kvp_table.get(&kvpid) {
            Ok(Some(data)) => data,
            Ok(None) => {
                debug!(%kvpid, "value not in table");
                return;
            }
            Err(err) => {
                warn!(%err, "get value read failed");
                return;
            }
        };

        let start = usize::min(offset as usize, data.len());
        let task = self.network.send_bytes(
            packet.address,
            &transfer_id,
            data[start..].to_vec(),
            self.network.default_timeout(),
        );

        let bytes_sent = task.result().await;
        debug!(bytes_sent, "get value served");
    }

    /// Send a value to a node with STORE plus a chunked transfer.
    ///
    /// The task result is the number of bytes sent; zero means the node
    /// refused or never answered.
    pub fn store_to_node(
        &self,
        node: &NodeInfo,
        key: &KeyBytes,
        index: &KeyBytes,
        value: Vec<u8>,
        timestamp: u64,
    ) -> Task<u64> {
        debug!(%node, "store value to node");
        let this = self.strong();
        let node = node.clone();
        let key = *key;
        let index = *index;

        Task::spawn(move |ctx| async move {
            let mut payload = this.template_dict();
            payload.insert(
                json_keys::RPC.to_string(),
                Value::String(rpcs::STORE.to_string()),
            );
            payload.insert(json_keys::KEY.to_string(), Value::String(key.base64()));
            payload.insert(json_keys::INDEX.to_string(), Value::String(index.base64()));
            payload.insert(json_keys::SIZE.to_string(), Value::from(value.len() as u64));
            payload.insert(json_keys::TIMESTAMP.to_string(), Value::from(timestamp));

            let send_task = match this.network.send_expect_reply(
                node.address,
                payload,
                this.network.default_timeout(),
            ) {
                Ok(task) => task,
                Err(_) => return 0,
            };

            ctx.hook(&send_task);

            let packet = match send_task.result().await {
                Some(packet) => packet,
                None => return 0,
            };

            let transfer_id = match packet.get_str(json_keys::TRANSFER_ID) {
                Some(id) => id.to_string(),
                None => return 0,
            };

            let upload = this.network.send_bytes(
                node.address,
                &transfer_id,
                value,
                this.network.default_timeout(),
            );

            ctx.hook(&upload);
            upload.result().await
        })
    }

    async fn received_store_rpc(self: Arc<Self>, packet: DataPacket) {
        debug!(address = %packet.address, "store request");

        let key = packet.get_str(json_keys::KEY).and_then(KeyBytes::parse_silent);
        let index = packet
            .get_str(json_keys::INDEX)
            .and_then(KeyBytes::parse_silent);
        let size = packet.payload.get(json_keys::SIZE).and_then(Value::as_u64);
        let timestamp = packet
            .payload
            .get(json_keys::TIMESTAMP)
            .and_then(Value::as_u64);

        let (key, index, size, timestamp) = match (key, index, size, timestamp) {
            (Some(key), Some(index), Some(size), Some(timestamp)) => {
                (key, index, size, timestamp)
            }
            _ => {
                debug!("store request malformed");
                return;
            }
        };

        let kvpid = KvpId::new(key, index);

        let acceptable = match self.kvp_table.is_acceptable(&kvpid, size, timestamp) {
            Ok(acceptable) => acceptable,
            Err(err) => {
                warn!(%err, "store acceptance check failed");
                false
            }
        };

        if !acceptable {
            let _ = self
                .network
                .send_answer_reply(&packet, self.template_dict());
            return;
        }

        let transfer_id = self.network.new_sequence_id();

        let download = {
            let network = self.network.clone();
            let transfer_id = transfer_id.clone();

            self.download_slot
                .add(move || {
                    let download = network.expect_incoming_transfer(
                        &transfer_id,
                        network.default_timeout(),
                        Some(MAX_VALUE_SIZE),
                    );

                    download.task().clone()
                })
                .await
        };

        let mut payload = self.template_dict();
        payload.insert(
            json_keys::TRANSFER_ID.to_string(),
            Value::String(transfer_id),
        );

        let _ = self.network.send_answer_reply(&packet, payload);

        debug!(address = %packet.address, "store transfer begin");
        let data = download.result().await;

        if !index.validate_value(&data) {
            warn!(%kvpid, "store transfer hash mismatch, not stored");
            return;
        }

        let stored = self.kvp_table.set(&kvpid, &data).and_then(|_| {
            self.kvp_table.set_timestamp(&kvpid, timestamp)?;
            self.kvp_table.set_last_update(&kvpid, unix_now())?;
            self.kvp_table
                .set_time_to_live(&kvpid, self.expiration_time_for(&key))
        });

        match stored {
            Ok(()) => debug!(%kvpid, "store transfer complete"),
            Err(err) => warn!(%err, %kvpid, "store failed"),
        }
    }

    /// Receiver-side time-to-live for a stored key.
    ///
    /// Counts the peers already closer to the key than we are; once a full
    /// bucket's worth exists, the TTL is discounted exponentially because
    /// closer peers are expected to serve.
    pub fn expiration_time_for(&self, key: &KeyBytes) -> u64 {
        let home_bucket = bucket_number(&self.key, key);

        let lower_contacts: usize = self
            .routing_table
            .buckets()
            .iter()
            .take(home_bucket)
            .map(|bucket| bucket.len())
            .sum();

        let close_contacts = self.routing_table.count_close(key);
        let count = lower_contacts + close_contacts;

        if count < MAX_BUCKET_SIZE {
            TIME_EXPIRE
        } else {
            (TIME_EXPIRE as f64 / f64::exp(count as f64 / MAX_BUCKET_SIZE as f64)) as u64
        }
    }

    /// Look up stale buckets and refresh each with a random key in its
    /// range
    async fn refresh_buckets(self: Arc<Self>) {
        let now = unix_now();

        for bucket in self.routing_table.buckets() {
            if bucket.last_update() + TIME_REFRESH < now {
                let key = random_bucket_key(&self.key, bucket.number());
                let task = self.find_node_shortlist(&key);
                task.result().await;
            }
        }
    }

    /// Publish or replicate a value to the nodes closest to its key.
    ///
    /// The task result is the number of successful remote stores; zero is
    /// a valid outcome.
    pub fn store_value(&self, key: &KeyBytes, index: &KeyBytes) -> Task<u64> {
        debug!(%key, %index, "store value");
        let this = self.strong();
        let key = *key;
        let index = *index;

        Task::spawn(move |ctx| async move {
            let kvpid = KvpId::new(key, index);

            let record = match this.kvp_table.record(&kvpid) {
                Ok(Some(record)) => record,
                _ => {
                    warn!(%kvpid, "no record to publish");
                    return 0;
                }
            };

            let lookup = this.find_value_shortlist(&key, Some(&index));
            ctx.hook(&lookup);
            let shortlist = lookup.result().await;

            let useful = shortlist.useful_nodes();
            let mut targets: Vec<NodeInfo> = shortlist
                .nodes()
                .into_iter()
                .filter(|node| !useful.contains(node))
                .collect();
            sort_nodes_by_distance(&mut targets, &this.key);

            let _ = this.kvp_table.set_last_update(&kvpid, unix_now());

            if targets.is_empty() && useful.is_empty() {
                warn!(%kvpid, "no destination nodes for publication");
            }

            let mut queue: VecDeque<NodeInfo> = targets.into();
            let mut store_count = 0u64;

            while !queue.is_empty() {
                let mut batch = Vec::new();

                for _ in 0..NETWORK_PARALLELISM {
                    let node = match queue.pop_front() {
                        Some(node) => node,
                        None => break,
                    };

                    let value = match this.kvp_table.get(&kvpid) {
                        Ok(Some(value)) => value,
                        _ => continue,
                    };

                    let timestamp = record.timestamp.unwrap_or_else(unix_now);
                    let task = this.store_to_node(&node, &key, &index, value, timestamp);

                    ctx.hook(&task);
                    this.store_observer.fire(&StoreNodeEvent {
                        added: true,
                        node: node.clone(),
                        task: task.clone(),
                    });

                    batch.push((node, task));
                }

                for (node, task) in batch {
                    let bytes_sent = task.result().await;

                    this.store_observer.fire(&StoreNodeEvent {
                        added: false,
                        node,
                        task: task.clone(),
                    });

                    if bytes_sent > 0 {
                        store_count += 1;
                    }
                }
            }

            store_count
        })
    }

    /// Retrieve a value by pair id.
    ///
    /// The result is the validated bytes, or `None` when no peer had the
    /// value or three download rounds failed validation.
    pub fn get_value(&self, key: &KeyBytes, index: &KeyBytes) -> Task<Option<Vec<u8>>> {
        info!(key = %key.base16(), index = %index.base16(), "downloading value");
        let this = self.strong();
        let key = *key;
        let index = *index;

        Task::spawn(move |ctx| async move {
            let lookup = this.find_value_shortlist(&key, Some(&index));
            ctx.hook(&lookup);
            let shortlist = lookup.result().await;

            let mut useful = shortlist.useful_nodes();

            if useful.is_empty() {
                return None;
            }

            sort_nodes_by_distance(&mut useful, &key);
            let common_info = shortlist.most_common_exchange_info(&key, &index);
            let wanted_size = common_info.size.unwrap_or(0);

            for round in 0..3 {
                debug!(round, "download round");
                let mut buffer: Vec<u8> = Vec::new();

                for node in &useful {
                    if !ctx.is_running() {
                        return None;
                    }

                    let download =
                        this.get_value_from_node(node, &key, Some(&index), buffer.len() as u64);

                    ctx.hook(download.task());

                    let data = download.task().result().await;
                    buffer.extend_from_slice(&data);
                    ctx.set_progress(buffer.len() as u64);

                    if wanted_size > 0 && buffer.len() as u64 >= wanted_size {
                        break;
                    }
                }

                if index.validate_value(&buffer) {
                    this.replicate_downloaded(&shortlist, &key, &index, &buffer, &common_info);
                    return Some(buffer);
                }
            }

            None
        })
    }

    /// After a verified download, push the value to the closest node that
    /// did not have it
    fn replicate_downloaded(
        &self,
        shortlist: &Shortlist,
        key: &KeyBytes,
        index: &KeyBytes,
        value: &[u8],
        info: &KvpExchangeInfo,
    ) {
        let closest = match shortlist.sorted_nodes().into_iter().next() {
            Some(node) => node,
            None => return,
        };

        if shortlist.useful_nodes().contains(&closest) {
            return;
        }

        debug!(%closest, "replicating downloaded value");
        let timestamp = info.timestamp.unwrap_or_else(unix_now);
        let _ = self.store_to_node(&closest, key, index, value.to_vec(), timestamp);
    }
}

/// Adapt a node-lookup task to the value-lookup result shape
fn map_find_nodes(task: Task<Option<Vec<NodeInfo>>>) -> Task<Option<FindValueResult>> {
    Task::spawn(move |_ctx| async move {
        task.result().await.map(|nodes| FindValueResult {
            kvp_infos: None,
            nodes: Some(nodes),
        })
    })
}
