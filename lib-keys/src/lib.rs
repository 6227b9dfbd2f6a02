//! Bytestag Key Space
//!
//! The 160-bit identifier space shared by node IDs and content hashes.
//! Provides XOR distance, bucket numbering, the base16/32/64 codecs used on
//! the wire, and the magnet URI surface that carries keys between clients.

pub mod keys;
pub mod kvpid;
pub mod magnet;

pub use keys::{
    bucket_number, leading_zero_bits, random_bucket_key, KeyBytes, KeyDistance, KeyError,
    KEY_BIT_SIZE, KEY_BYTE_SIZE,
};
pub use kvpid::KvpId;
pub use magnet::MagnetUri;
