//! Wire framing
//!
//! Each datagram is `deflate(json_utf8(payload))`. The payload is a JSON
//! object carrying a sequence id for requests, a reply id echoing the
//! request being answered, or a transfer id for bulk chunks.

use crate::MAX_UDP_PACKET_SIZE;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::SocketAddr;
use tracing::debug;

/// The keys used in the JSON data
pub mod json_keys {
    pub const SEQUENCE_ID: &str = "seq_id";
    pub const REPLY_SEQUENCE_ID: &str = "reply_id";
    pub const TRANSFER_ID: &str = "xfer_id";
    pub const TRANSFER_DATA: &str = "xfer_data";
}

/// A JSON payload object
pub type PacketDict = serde_json::Map<String, Value>;

/// Errors surfaced by the network layer
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// The compressed datagram would exceed the UDP limit
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("payload encoding error: {0}")]
    Json(#[from] serde_json::Error),
    /// The network has shut down
    #[error("network stopped")]
    Stopped,
}

/// A parsed inbound or outbound JSON data packet
#[derive(Clone, Debug)]
pub struct DataPacket {
    /// The remote address
    pub address: SocketAddr,
    /// The payload object
    pub payload: PacketDict,
    /// The sequence id or echoed reply id, if present
    pub sequence_id: Option<String>,
}

impl DataPacket {
    pub fn new(address: SocketAddr, payload: PacketDict) -> Self {
        let sequence_id = payload
            .get(json_keys::SEQUENCE_ID)
            .or_else(|| payload.get(json_keys::REPLY_SEQUENCE_ID))
            .and_then(Value::as_str)
            .map(str::to_string);

        DataPacket {
            address,
            payload,
            sequence_id,
        }
    }

    /// A string field of the payload
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Pack a payload object into its transmission format
pub fn pack_udp_data(payload: &PacketDict) -> Result<Vec<u8>, NetworkError> {
    let json = serde_json::to_vec(payload)?;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    let data = encoder.finish()?;

    if data.len() < MAX_UDP_PACKET_SIZE {
        Ok(data)
    } else {
        Err(NetworkError::PayloadTooLarge(data.len()))
    }
}

/// Unpack a datagram into a payload object.
///
/// Malformed datagrams are discarded with a debug log.
pub fn unpack_udp_data(data: &[u8]) -> Option<PacketDict> {
    let mut decoder = ZlibDecoder::new(data);
    let mut json = Vec::new();

    if let Err(err) = decoder.read_to_end(&mut json) {
        debug!(%err, "failed datagram decompression");
        return None;
    }

    match serde_json::from_slice::<Value>(&json) {
        Ok(Value::Object(payload)) => Some(payload),
        Ok(_) => {
            debug!("datagram payload is not an object");
            None
        }
        Err(err) => {
            debug!(%err, "failed json parsing");
            None
        }
    }
}
