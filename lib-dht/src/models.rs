//! Wire models
//!
//! JSON shapes exchanged by the RPCs: node lists and key-value exchange
//! info. All binary fields travel as base64 strings and are decoded here,
//! at the packet boundary, never deeper in.

use crate::tables::NodeInfo;
use lib_keys::{KeyBytes, KvpId};
use lib_storage::KvpRecord;
use serde_json::{Map, Value};
use std::net::{IpAddr, SocketAddr};

/// The keys used in the DHT JSON payloads
pub mod json_keys {
    pub const RPC: &str = "rpc";
    pub const NETWORK_ID: &str = "netid";
    pub const NODE_ID: &str = "nodeid";
    pub const NODES: &str = "nodes";
    pub const KEY: &str = "key";
    pub const INDEX: &str = "index";
    pub const VALUES: &str = "vals";
    pub const SIZE: &str = "size";
    pub const TRANSFER_ID: &str = "xferid";
    pub const VALUE_OFFSET: &str = "valofs";
    pub const TIMESTAMP: &str = "timestmp";
}

/// The RPC names
pub mod rpcs {
    pub const PING: &str = "ping";
    pub const STORE: &str = "store";
    pub const FIND_NODE: &str = "findnode";
    pub const FIND_VALUE: &str = "findval";
    pub const GET_VALUE: &str = "getval";
}

mod node_keys {
    pub const HOST: &str = "host";
    pub const PORT: &str = "port";
    pub const NODE_ID: &str = "id";
}

/// Wire decoding failures
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("not a list")]
    NotAList,
    #[error("invalid node entry: {0}")]
    InvalidNode(String),
    #[error("invalid exchange info: {0}")]
    InvalidExchangeInfo(String),
}

/// Encode a node list for a reply
pub fn nodes_to_json(nodes: &[NodeInfo]) -> Value {
    let list: Vec<Value> = nodes
        .iter()
        .map(|node| {
            let mut entry = Map::new();
            entry.insert(
                node_keys::HOST.to_string(),
                Value::String(node.address.ip().to_string()),
            );
            entry.insert(
                node_keys::PORT.to_string(),
                Value::from(node.address.port()),
            );
            entry.insert(
                node_keys::NODE_ID.to_string(),
                Value::String(node.key.base64()),
            );
            entry
        })
        .map(Value::Object)
        .collect();

    Value::Array(list)
}

/// Decode a node list from a reply, validating each entry
pub fn nodes_from_json(value: &Value) -> Result<Vec<NodeInfo>, ModelError> {
    let array = value.as_array().ok_or(ModelError::NotAList)?;
    let mut nodes = Vec::with_capacity(array.len());

    for entry in array {
        let entry = entry
            .as_object()
            .ok_or_else(|| ModelError::InvalidNode("item is not an object".to_string()))?;

        let host = entry
            .get(node_keys::HOST)
            .and_then(Value::as_str)
            .ok_or_else(|| ModelError::InvalidNode("not a valid host".to_string()))?;

        let port = entry
            .get(node_keys::PORT)
            .and_then(Value::as_u64)
            .filter(|port| (1..=u16::MAX as u64).contains(port))
            .ok_or_else(|| ModelError::InvalidNode("not a valid port number".to_string()))?;

        let key = entry
            .get(node_keys::NODE_ID)
            .and_then(Value::as_str)
            .and_then(KeyBytes::parse_silent)
            .ok_or_else(|| ModelError::InvalidNode("not a valid node id".to_string()))?;

        let ip: IpAddr = host
            .parse()
            .map_err(|_| ModelError::InvalidNode("not a valid host".to_string()))?;

        nodes.push(NodeInfo::new(key, SocketAddr::new(ip, port as u16)));
    }

    Ok(nodes)
}

/// Sort nodes in place by XOR distance to a key, closest first
pub fn sort_nodes_by_distance(nodes: &mut [NodeInfo], key: &KeyBytes) {
    nodes.sort_by_key(|node| node.key.distance(key));
}

/// Description of a stored pair used for storage decisions
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KvpExchangeInfo {
    pub key: KeyBytes,
    pub index: KeyBytes,
    pub size: Option<u64>,
    pub timestamp: Option<u64>,
}

impl KvpExchangeInfo {
    pub fn from_record(record: &KvpRecord) -> Self {
        KvpExchangeInfo {
            key: record.kvpid.key,
            index: record.kvpid.index,
            size: Some(record.size),
            timestamp: record.timestamp,
        }
    }

    pub fn kvpid(&self) -> KvpId {
        KvpId::new(self.key, self.index)
    }

    pub fn to_json(&self) -> Value {
        let mut entry = Map::new();
        entry.insert(
            json_keys::KEY.to_string(),
            Value::String(self.key.base64()),
        );
        entry.insert(
            json_keys::INDEX.to_string(),
            Value::String(self.index.base64()),
        );
        entry.insert(
            json_keys::SIZE.to_string(),
            self.size.map(Value::from).unwrap_or(Value::Null),
        );
        entry.insert(
            "time".to_string(),
            self.timestamp.map(Value::from).unwrap_or(Value::Null),
        );

        Value::Object(entry)
    }

    pub fn from_json(value: &Value) -> Result<Self, ModelError> {
        let entry = value
            .as_object()
            .ok_or_else(|| ModelError::InvalidExchangeInfo("not an object".to_string()))?;

        let key = entry
            .get(json_keys::KEY)
            .and_then(Value::as_str)
            .and_then(KeyBytes::parse_silent)
            .ok_or_else(|| ModelError::InvalidExchangeInfo("bad key".to_string()))?;

        let index = entry
            .get(json_keys::INDEX)
            .and_then(Value::as_str)
            .and_then(KeyBytes::parse_silent)
            .ok_or_else(|| ModelError::InvalidExchangeInfo("bad index".to_string()))?;

        let size = match entry.get(json_keys::SIZE) {
            None | Some(Value::Null) => None,
            Some(value) => Some(value.as_u64().ok_or_else(|| {
                ModelError::InvalidExchangeInfo("size is not an integer".to_string())
            })?),
        };

        let timestamp = match entry.get("time") {
            None | Some(Value::Null) => None,
            Some(value) => Some(value.as_u64().ok_or_else(|| {
                ModelError::InvalidExchangeInfo("timestamp is not a number".to_string())
            })?),
        };

        Ok(KvpExchangeInfo {
            key,
            index,
            size,
            timestamp,
        })
    }

    pub fn list_to_json(infos: &[KvpExchangeInfo]) -> Value {
        Value::Array(infos.iter().map(KvpExchangeInfo::to_json).collect())
    }

    pub fn list_from_json(value: &Value) -> Result<Vec<KvpExchangeInfo>, ModelError> {
        let array = value.as_array().ok_or(ModelError::NotAList)?;

        array.iter().map(KvpExchangeInfo::from_json).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn some_nodes() -> Vec<NodeInfo> {
        vec![
            NodeInfo::new(KeyBytes::new_hash(b"a"), "127.0.0.1:4001".parse().unwrap()),
            NodeInfo::new(KeyBytes::new_hash(b"b"), "127.0.0.1:4002".parse().unwrap()),
        ]
    }

    #[test]
    fn test_node_list_round_trip() {
        let nodes = some_nodes();
        let encoded = nodes_to_json(&nodes);
        let decoded = nodes_from_json(&encoded).unwrap();

        assert_eq!(decoded, nodes);
    }

    #[test]
    fn test_node_list_validation() {
        assert!(nodes_from_json(&Value::from(3)).is_err());

        let bad_port = serde_json::json!([{"host": "127.0.0.1", "port": 0, "id": KeyBytes::new_hash(b"x").base64()}]);
        assert!(nodes_from_json(&bad_port).is_err());

        let bad_id = serde_json::json!([{"host": "127.0.0.1", "port": 4001, "id": "@@"}]);
        assert!(nodes_from_json(&bad_id).is_err());
    }

    #[test]
    fn test_sort_by_distance() {
        let target = KeyBytes::new_hash(b"target");
        let mut nodes = some_nodes();
        nodes.push(NodeInfo::new(target, "127.0.0.1:4003".parse().unwrap()));

        sort_nodes_by_distance(&mut nodes, &target);
        assert_eq!(nodes[0].key, target);
    }

    #[test]
    fn test_exchange_info_round_trip() {
        let info = KvpExchangeInfo {
            key: KeyBytes::new_hash(b"k"),
            index: KeyBytes::new_hash(b"v"),
            size: Some(1500),
            timestamp: Some(12345678),
        };

        let decoded = KvpExchangeInfo::from_json(&info.to_json()).unwrap();
        assert_eq!(decoded, info);

        let list = KvpExchangeInfo::list_to_json(&[info.clone()]);
        assert_eq!(KvpExchangeInfo::list_from_json(&list).unwrap(), vec![info]);
    }

    #[test]
    fn test_exchange_info_wire_field_names() {
        let info = KvpExchangeInfo {
            key: KeyBytes::new_hash(b"k"),
            index: KeyBytes::new_hash(b"v"),
            size: Some(9),
            timestamp: Some(1),
        };

        let json = info.to_json();
        let object = json.as_object().unwrap();

        for field in ["key", "index", "size", "time"] {
            assert!(object.contains_key(field), "missing {}", field);
        }
    }
}
