//! Bytestag Network Layer
//!
//! One UDP socket per node carries everything: RPC requests, replies
//! correlated by sequence id, and chunked bulk transfers. Datagrams are
//! deflate-compressed JSON objects. Replies target the origin port because
//! sends go out of the same socket the server receives on.

pub mod network;
pub mod reply;
pub mod transfer;
pub mod wire;

pub use network::{Network, PacketReceiver};
pub use reply::ReplyTable;
pub use transfer::{DownloadTask, SpooledBuffer};
pub use wire::{DataPacket, NetworkError, PacketDict};

use std::time::Duration;

/// The maximum UDP packet size allowed
pub const MAX_UDP_PACKET_SIZE: usize = 65507;

/// The time before a reply is timed out
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// The size of the parts of a value transmitted per datagram
pub const STREAM_DATA_SIZE: usize = 1024;

/// The size of a sequence id before base64 encoding
pub const SEQUENCE_ID_SIZE: usize = 20;

/// Number of datagram attempts before a send gives up on its reply
pub const SEND_ATTEMPTS: u32 = 2;

/// In-memory spool limit before a download spills to a temp file
pub const SPOOL_THRESHOLD: usize = 1_048_576;
