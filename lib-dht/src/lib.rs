//! Bytestag DHT Engine
//!
//! The Kademlia-style distributed hash table: XOR-distance routing over
//! 160 k-buckets, shortlist-driven lookups, the five RPCs layered on the
//! UDP network, receiver-side expiry policy, and the publisher/replicator
//! loops that keep values alive in the network.

pub mod client;
pub mod models;
pub mod network;
pub mod publishing;
pub mod shortlist;
pub mod tables;

pub use client::{Client, NodeConfig};
pub use network::{DhtNode, FindValueResult, PingResult, StoreNodeEvent};
pub use publishing::{Publisher, Replicator};
pub use shortlist::Shortlist;
pub use tables::{Bucket, NodeInfo, RoutingError, RoutingTable, MAX_BUCKET_SIZE};

/// The unique network id; packets carrying any other id are discarded
pub const NETWORK_ID: &str = "BYTESTAG";

/// The largest value the node stores or serves: 1 MiB
pub const MAX_VALUE_SIZE: u64 = 1_048_576;

/// Concurrent outstanding requests per lookup iteration (constant alpha)
pub const NETWORK_PARALLELISM: usize = 3;

/// Time-to-live from original publication date, in seconds
pub const TIME_EXPIRE: u64 = 86_400;

/// Time before an unaccessed bucket is refreshed, in seconds
pub const TIME_REFRESH: u64 = 3_600;

/// Interval between replication sweeps, in seconds
pub const TIME_REPLICATE: u64 = 3_600;

/// Time after which the original publisher must republish, in seconds
pub const TIME_REPUBLISH: u64 = 86_400;
