//! Routing table and buckets
//!
//! 160 k-buckets indexed by the XOR-distance prefix between the local node
//! id and a contact. Buckets hold up to K nodes in least-recently-seen
//! order. A full bucket enters a probation state holding one candidate
//! until the caller resolves it by pinging the oldest node: `keep_old_node`
//! drops the candidate, `keep_new_node` evicts the head.

use lib_keys::{bucket_number, KeyBytes, KEY_BIT_SIZE};
use lib_storage::table::unix_now;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;

/// Maximum nodes per bucket (constant k)
pub const MAX_BUCKET_SIZE: usize = 20;

/// An end-point contact: equality covers both key and address
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct NodeInfo {
    pub key: KeyBytes,
    pub address: SocketAddr,
}

impl NodeInfo {
    pub fn new(key: KeyBytes, address: SocketAddr) -> Self {
        NodeInfo { key, address }
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Node {} {}>", self.key.base16(), self.address)
    }
}

impl fmt::Debug for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Routing table update failures
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    /// The node carries our own id
    #[error("cannot add node that has our node id")]
    SelfNodeRejected,
    /// The bucket is full; the caller must verify the head node and then
    /// resolve the probation
    #[error("bucket {bucket_number} is full")]
    BucketFull {
        bucket_number: usize,
        head: NodeInfo,
        candidate: NodeInfo,
    },
}

struct BucketState {
    nodes: Vec<NodeInfo>,
    last_update: u64,
    full_pending: bool,
    candidate: Option<NodeInfo>,
}

/// A bucket of nodes in least-recently-seen order
pub struct Bucket {
    number: usize,
    state: Mutex<BucketState>,
}

impl Bucket {
    fn new(number: usize) -> Self {
        Bucket {
            number,
            state: Mutex::new(BucketState {
                nodes: Vec::new(),
                last_update: 0,
                full_pending: false,
                candidate: None,
            }),
        }
    }

    pub fn number(&self) -> usize {
        self.number
    }

    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.state.lock().nodes.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().nodes.is_empty()
    }

    pub fn contains(&self, node: &NodeInfo) -> bool {
        self.state.lock().nodes.contains(node)
    }

    /// When the bucket last changed, unix seconds. Zero means never.
    pub fn last_update(&self) -> u64 {
        self.state.lock().last_update
    }

    /// Add or move the node to the tail.
    ///
    /// While the bucket is full-pending, further updates are ignored; it
    /// leaves that state only through [`keep_old_node`](Self::keep_old_node)
    /// or [`keep_new_node`](Self::keep_new_node).
    pub fn node_update(&self, node: &NodeInfo) -> Result<(), RoutingError> {
        let mut state = self.state.lock();

        if state.full_pending {
            return Ok(());
        }

        if let Some(position) = state.nodes.iter().position(|n| n == node) {
            state.nodes.remove(position);
            state.nodes.push(node.clone());
            state.last_update = unix_now();
        } else if state.nodes.len() < MAX_BUCKET_SIZE {
            state.nodes.push(node.clone());
            state.last_update = unix_now();
        } else {
            state.full_pending = true;
            state.candidate = Some(node.clone());

            return Err(RoutingError::BucketFull {
                bucket_number: self.number,
                head: state.nodes[0].clone(),
                candidate: node.clone(),
            });
        }

        Ok(())
    }

    /// Keep the old node: it responded, so the candidate is dropped
    pub fn keep_old_node(&self) {
        let mut state = self.state.lock();

        state.full_pending = false;
        state.candidate = None;
        state.last_update = unix_now();
    }

    /// Keep the new node: the old head did not respond and is evicted
    pub fn keep_new_node(&self) {
        let mut state = self.state.lock();

        if let Some(candidate) = state.candidate.take() {
            state.nodes.remove(0);
            state.nodes.push(candidate);
        }

        state.full_pending = false;
        state.last_update = unix_now();
    }
}

/// The list of buckets keyed by distance prefix from the local node id
pub struct RoutingTable {
    key: KeyBytes,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(key: KeyBytes) -> Self {
        RoutingTable {
            key,
            buckets: (0..KEY_BIT_SIZE).map(Bucket::new).collect(),
        }
    }

    /// The local node id the table is centered on
    pub fn key(&self) -> &KeyBytes {
        &self.key
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub fn num_contacts(&self) -> usize {
        self.buckets.iter().map(Bucket::len).sum()
    }

    /// The bucket a key belongs to.
    ///
    /// A key equal to our own maps to the last bucket; the self-id check in
    /// [`node_update`](Self::node_update) keeps such nodes out.
    pub fn bucket_for(&self, key: &KeyBytes) -> &Bucket {
        let number = usize::min(bucket_number(&self.key, key), KEY_BIT_SIZE - 1);
        &self.buckets[number]
    }

    pub fn contains(&self, node: &NodeInfo) -> bool {
        self.bucket_for(&node.key).contains(node)
    }

    /// Route the update to the node's bucket
    pub fn node_update(&self, node: &NodeInfo) -> Result<(), RoutingError> {
        if node.key == self.key {
            return Err(RoutingError::SelfNodeRejected);
        }

        self.bucket_for(&node.key).node_update(node)
    }

    /// Return up to `count` nodes close to a key.
    ///
    /// If the home bucket holds enough, a random sample of it is returned;
    /// otherwise the home bucket seeds the result and the remainder is
    /// drawn from the other buckets in random order. Callers sort by
    /// distance themselves.
    pub fn get_close_nodes(&self, key: &KeyBytes, count: usize) -> Vec<NodeInfo> {
        let mut rng = rand::thread_rng();
        let home = self.bucket_for(key);
        let home_nodes = home.nodes();

        if home_nodes.len() >= count {
            return home_nodes
                .choose_multiple(&mut rng, count)
                .cloned()
                .collect();
        }

        let mut nodes: HashSet<NodeInfo> = home_nodes.into_iter().collect();
        let mut bucket_order: Vec<&Bucket> = self.buckets.iter().collect();
        bucket_order.shuffle(&mut rng);

        for bucket in bucket_order {
            let bucket_nodes = bucket.nodes();
            let needed = usize::min(bucket_nodes.len(), count - nodes.len());

            for node in bucket_nodes.choose_multiple(&mut rng, needed) {
                nodes.insert(node.clone());
            }

            if nodes.len() >= count {
                break;
            }
        }

        nodes.into_iter().collect()
    }

    /// Number of nodes in the key's home bucket strictly closer to it than
    /// we are
    pub fn count_close(&self, key: &KeyBytes) -> usize {
        let our_distance = self.key.distance(key);

        self.bucket_for(key)
            .nodes()
            .iter()
            .filter(|node| node.key.distance(key) < our_distance)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_keys::KEY_BYTE_SIZE;

    fn key_with_first_byte(first: u8) -> KeyBytes {
        let mut bytes = [0u8; KEY_BYTE_SIZE];
        bytes[0] = first;
        let random = KeyBytes::new_random();
        bytes[1..].copy_from_slice(&random.as_bytes()[1..]);

        KeyBytes::from_bytes(&bytes).unwrap()
    }

    fn node_at(key: KeyBytes, port: u16) -> NodeInfo {
        NodeInfo::new(key, format!("127.0.0.1:{}", port).parse().unwrap())
    }

    #[test]
    fn test_rejects_self_node() {
        let key = KeyBytes::new_random();
        let table = RoutingTable::new(key);

        let result = table.node_update(&node_at(key, 9000));
        assert!(matches!(result, Err(RoutingError::SelfNodeRejected)));
    }

    #[test]
    fn test_update_moves_node_to_tail() {
        let table = RoutingTable::new(key_with_first_byte(0x00));

        let first = node_at(key_with_first_byte(0x80), 9001);
        let second = node_at(key_with_first_byte(0x81), 9002);

        table.node_update(&first).unwrap();
        table.node_update(&second).unwrap();
        table.node_update(&first).unwrap();

        let bucket = table.bucket_for(&first.key);
        assert_eq!(bucket.nodes().last(), Some(&first));
        assert_eq!(bucket.len(), 2);
        assert!(table.contains(&first));
    }

    #[test]
    fn test_full_bucket_probation() {
        let self_key = key_with_first_byte(0x00);
        let table = RoutingTable::new(self_key);

        // Keys whose first bit differs from ours land in bucket 0
        let mut nodes = Vec::new();
        for i in 0..MAX_BUCKET_SIZE {
            let node = node_at(key_with_first_byte(0x80 | (i as u8 % 0x7F)), 9100 + i as u16);
            table.node_update(&node).unwrap();
            nodes.push(node);
        }

        let bucket = table.bucket_for(&nodes[0].key);
        assert_eq!(bucket.len(), MAX_BUCKET_SIZE);

        let candidate = node_at(key_with_first_byte(0xFF), 9200);
        let result = table.node_update(&candidate);

        let (head, probation_candidate) = match result {
            Err(RoutingError::BucketFull {
                head, candidate, ..
            }) => (head, candidate),
            other => panic!("expected BucketFull, got {:?}", other.err()),
        };

        assert_eq!(head, nodes[0]);
        assert_eq!(probation_candidate, candidate);

        // Updates are ignored while the probation is unresolved
        table.node_update(&candidate).unwrap();
        assert_eq!(bucket.len(), MAX_BUCKET_SIZE);

        // The head responded: the candidate is dropped
        bucket.keep_old_node();
        assert!(bucket.contains(&nodes[0]));
        assert!(!bucket.contains(&candidate));

        // Fill again and resolve the other way
        let second_candidate = node_at(key_with_first_byte(0xC1), 9201);
        assert!(table.node_update(&second_candidate).is_err());

        bucket.keep_new_node();
        assert!(!bucket.contains(&nodes[0]));
        assert!(bucket.contains(&second_candidate));
        assert_eq!(bucket.len(), MAX_BUCKET_SIZE);
    }

    #[test]
    fn test_bucket_size_never_exceeds_k() {
        let table = RoutingTable::new(key_with_first_byte(0x00));

        for i in 0..(MAX_BUCKET_SIZE * 2) {
            let node = node_at(key_with_first_byte(0x80), 9300 + i as u16);
            let _ = table.node_update(&node);

            let bucket = table.bucket_for(&node.key);
            if bucket.state.lock().full_pending {
                bucket.keep_old_node();
            }
        }

        for bucket in table.buckets() {
            assert!(bucket.len() <= MAX_BUCKET_SIZE);
        }
    }

    #[test]
    fn test_get_close_nodes_prefers_home_bucket() {
        let self_key = key_with_first_byte(0x00);
        let table = RoutingTable::new(self_key);

        // Bucket 0 nodes
        for i in 0..5 {
            table
                .node_update(&node_at(key_with_first_byte(0x80), 9400 + i))
                .unwrap();
        }

        // A far bucket node
        let far = node_at(key_with_first_byte(0x01), 9500);
        table.node_update(&far).unwrap();

        let target = key_with_first_byte(0xF0);
        let close = table.get_close_nodes(&target, 3);

        assert_eq!(close.len(), 3);
        for node in &close {
            assert_eq!(bucket_number(&self_key, &node.key), 0);
        }

        // Asking for more than stored returns everything available
        let all = table.get_close_nodes(&target, 50);
        assert_eq!(all.len(), 6);
    }

    #[test]
    fn test_count_close() {
        let self_key = key_with_first_byte(0xFF);
        let table = RoutingTable::new(self_key);

        let target = key_with_first_byte(0x00);

        // This node shares the target's first bit, so it is closer to the
        // target than we are
        let closer = node_at(key_with_first_byte(0x01), 9600);
        table.node_update(&closer).unwrap();

        assert_eq!(table.count_close(&target), 1);
    }
}
