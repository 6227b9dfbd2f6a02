//! Lookup shortlist
//!
//! The running state of a node or value lookup: candidate nodes, who has
//! been contacted, who responded, and which peers reported having values.
//! Size and timestamp reports are tallied per pair so the downloader can
//! take a majority vote across responders.

use crate::models::{sort_nodes_by_distance, KvpExchangeInfo};
use crate::tables::{NodeInfo, RoutingTable, MAX_BUCKET_SIZE};
use crate::NETWORK_PARALLELISM;
use lib_keys::{KeyBytes, KvpId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

struct ShortlistState {
    nodes: HashSet<NodeInfo>,
    uncontacted: HashSet<NodeInfo>,
    contacted: HashSet<NodeInfo>,
    responded: HashSet<NodeInfo>,
    useful: HashSet<NodeInfo>,
    size_tallies: HashMap<KvpId, HashMap<u64, usize>>,
    timestamp_tallies: HashMap<KvpId, HashMap<u64, usize>>,
    initial_closest: Option<NodeInfo>,
    closest: Option<NodeInfo>,
    iteration_count: usize,
}

impl ShortlistState {
    fn closest_of(&self, target: &KeyBytes) -> Option<NodeInfo> {
        self.nodes
            .iter()
            .min_by_key(|node| node.key.distance(target))
            .cloned()
    }
}

/// A shortlist of nodes close to a key
pub struct Shortlist {
    target: KeyBytes,
    self_node: NodeInfo,
    state: Mutex<ShortlistState>,
}

impl Shortlist {
    /// Seed the shortlist with the closest known nodes
    pub fn new(target: KeyBytes, routing_table: &RoutingTable, self_node: NodeInfo) -> Self {
        let seeds = routing_table.get_close_nodes(&target, NETWORK_PARALLELISM);

        let mut state = ShortlistState {
            nodes: seeds.iter().cloned().collect(),
            uncontacted: seeds.into_iter().collect(),
            contacted: HashSet::new(),
            responded: HashSet::new(),
            useful: HashSet::new(),
            size_tallies: HashMap::new(),
            timestamp_tallies: HashMap::new(),
            initial_closest: None,
            closest: None,
            iteration_count: 0,
        };

        state.initial_closest = state.closest_of(&target);
        state.closest = state.initial_closest.clone();

        Shortlist {
            target,
            self_node,
            state: Mutex::new(state),
        }
    }

    pub fn target(&self) -> &KeyBytes {
        &self.target
    }

    /// All candidate nodes still on the shortlist
    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.state.lock().nodes.iter().cloned().collect()
    }

    /// Peers that reported having a value for the target
    pub fn useful_nodes(&self) -> Vec<NodeInfo> {
        self.state.lock().useful.iter().cloned().collect()
    }

    /// Candidates sorted by distance to the target, closest first
    pub fn sorted_nodes(&self) -> Vec<NodeInfo> {
        let mut nodes = self.nodes();
        sort_nodes_by_distance(&mut nodes, &self.target);
        nodes
    }

    /// Pop up to `count` nodes off the uncontacted set, marking them
    /// contacted and counting an iteration
    pub fn take_nodes_for_contacting(&self, count: usize) -> Vec<NodeInfo> {
        let mut state = self.state.lock();
        let mut taken = Vec::new();

        for _ in 0..count {
            let node = match state.uncontacted.iter().next().cloned() {
                Some(node) => node,
                None => break,
            };

            state.uncontacted.remove(&node);
            state.contacted.insert(node.clone());
            taken.push(node);
        }

        state.iteration_count += 1;

        taken
    }

    /// Record a response from a contacted node.
    ///
    /// `useful` marks peers that reported values; their exchange infos feed
    /// the per-pair size and timestamp tallies.
    pub fn mark_responded(&self, node: &NodeInfo, useful: bool, infos: &[KvpExchangeInfo]) {
        let mut state = self.state.lock();

        state.responded.insert(node.clone());

        if useful {
            state.useful.insert(node.clone());
        }

        for info in infos {
            let kvpid = info.kvpid();

            if let Some(size) = info.size {
                *state
                    .size_tallies
                    .entry(kvpid)
                    .or_default()
                    .entry(size)
                    .or_insert(0) += 1;
            }

            if let Some(timestamp) = info.timestamp {
                *state
                    .timestamp_tallies
                    .entry(kvpid)
                    .or_default()
                    .entry(timestamp)
                    .or_insert(0) += 1;
            }
        }
    }

    /// Drop a node that timed out from the candidate set
    pub fn mark_inactive(&self, node: &NodeInfo) {
        let mut state = self.state.lock();

        state.nodes.remove(node);

        let closest = state.closest_of(&self.target);
        state.closest = closest;
    }

    /// Add more possible nodes to contact, skipping ourselves and anyone
    /// already contacted
    pub fn add_nodes(&self, nodes: impl IntoIterator<Item = NodeInfo>) {
        let mut state = self.state.lock();

        for node in nodes {
            if node == self.self_node || state.contacted.contains(&node) {
                continue;
            }

            if state.nodes.insert(node.clone()) {
                state.uncontacted.insert(node);
            }
        }

        let closest = state.closest_of(&self.target);
        state.closest = closest;
    }

    /// Whether the lookup is complete.
    ///
    /// Completion on enough responses, an exhausted candidate set, or the
    /// progress rule: at least two iterations done and the closest node
    /// seen has improved over the initial closest.
    pub fn is_finished(&self) -> bool {
        let state = self.state.lock();

        let limit_condition =
            state.responded.len() >= MAX_BUCKET_SIZE || state.uncontacted.is_empty();

        let improvement_condition = state.iteration_count >= 2
            && match (&state.closest, &state.initial_closest) {
                (Some(closest), Some(initial)) => {
                    closest.key.distance(&self.target) < initial.key.distance(&self.target)
                }
                _ => false,
            };

        limit_condition || improvement_condition
    }

    pub fn iteration_count(&self) -> usize {
        self.state.lock().iteration_count
    }

    /// The most commonly reported exchange info for a pair across
    /// responders
    pub fn most_common_exchange_info(&self, key: &KeyBytes, index: &KeyBytes) -> KvpExchangeInfo {
        let state = self.state.lock();
        let kvpid = KvpId::new(*key, *index);

        let size = state
            .size_tallies
            .get(&kvpid)
            .and_then(|tally| tally.iter().max_by_key(|(_, count)| **count))
            .map(|(size, _)| *size);

        let timestamp = state
            .timestamp_tallies
            .get(&kvpid)
            .and_then(|tally| tally.iter().max_by_key(|(_, count)| **count))
            .map(|(timestamp, _)| *timestamp);

        KvpExchangeInfo {
            key: *key,
            index: *index,
            size,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(tag: &[u8], port: u16) -> NodeInfo {
        NodeInfo::new(
            KeyBytes::new_hash(tag),
            format!("127.0.0.1:{}", port).parse().unwrap(),
        )
    }

    fn empty_shortlist(target: KeyBytes) -> Shortlist {
        let self_node = node(b"self", 5000);
        let table = RoutingTable::new(self_node.key);

        Shortlist::new(target, &table, self_node)
    }

    #[test]
    fn test_add_nodes_skips_self_and_contacted() {
        let shortlist = empty_shortlist(KeyBytes::new_hash(b"t"));
        let self_node = node(b"self", 5000);
        let peer = node(b"peer", 5001);

        shortlist.add_nodes([self_node, peer.clone()]);
        assert_eq!(shortlist.nodes(), vec![peer.clone()]);

        let taken = shortlist.take_nodes_for_contacting(NETWORK_PARALLELISM);
        assert_eq!(taken, vec![peer.clone()]);

        // Re-adding a contacted node changes nothing
        shortlist.add_nodes([peer]);
        assert!(shortlist.take_nodes_for_contacting(NETWORK_PARALLELISM).is_empty());
    }

    #[test]
    fn test_finishes_when_uncontacted_exhausted() {
        let shortlist = empty_shortlist(KeyBytes::new_hash(b"t"));
        assert!(shortlist.is_finished());

        shortlist.add_nodes([node(b"peer", 5001)]);
        assert!(!shortlist.is_finished());

        shortlist.take_nodes_for_contacting(NETWORK_PARALLELISM);
        assert!(shortlist.is_finished());
    }

    #[test]
    fn test_progress_rule_needs_two_iterations_and_improvement() {
        let target = KeyBytes::new_hash(b"t");
        let self_node = node(b"self", 5000);
        let table = RoutingTable::new(self_node.key);

        // Peers at known distances from the target
        let mut peers: Vec<NodeInfo> =
            (0..32u16).map(|i| node(&i.to_be_bytes(), 6000 + i)).collect();
        sort_nodes_by_distance(&mut peers, &target);
        let nearest = peers.remove(0);
        let far = peers.pop().unwrap();

        // The far node seeds the shortlist as the initial closest
        table.node_update(&far).unwrap();
        let shortlist = Shortlist::new(target, &table, self_node);

        shortlist.take_nodes_for_contacting(1);
        shortlist.mark_responded(&far, false, &[]);

        // It reports a nearer node; one iteration is not enough to finish
        shortlist.add_nodes([nearest.clone(), peers.pop().unwrap()]);
        assert!(!shortlist.is_finished());

        shortlist.take_nodes_for_contacting(1);

        // Two iterations and the closest improved over the initial closest
        assert!(shortlist.iteration_count() >= 2);
        assert!(shortlist.is_finished());
    }

    #[test]
    fn test_mark_inactive_removes_candidate() {
        let shortlist = empty_shortlist(KeyBytes::new_hash(b"t"));
        let peer = node(b"gone", 5002);

        shortlist.add_nodes([peer.clone()]);
        shortlist.take_nodes_for_contacting(1);
        shortlist.mark_inactive(&peer);

        assert!(shortlist.nodes().is_empty());
    }

    #[test]
    fn test_majority_vote_on_size_and_timestamp() {
        let target = KeyBytes::new_hash(b"t");
        let index = KeyBytes::new_hash(b"v");
        let shortlist = empty_shortlist(target);

        let info = |size, timestamp| KvpExchangeInfo {
            key: target,
            index,
            size: Some(size),
            timestamp: Some(timestamp),
        };

        for (i, (size, timestamp)) in [(100, 7), (100, 7), (200, 8)].iter().enumerate() {
            let peer = node(&[i as u8], 7000 + i as u16);
            shortlist.add_nodes([peer.clone()]);
            shortlist.take_nodes_for_contacting(1);
            shortlist.mark_responded(&peer, true, &[info(*size, *timestamp)]);
        }

        let common = shortlist.most_common_exchange_info(&target, &index);
        assert_eq!(common.size, Some(100));
        assert_eq!(common.timestamp, Some(7));
        assert_eq!(shortlist.useful_nodes().len(), 3);
    }
}
