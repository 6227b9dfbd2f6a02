//! 160-bit keys and XOR distance
//!
//! `KeyBytes` is the fixed-width binary value used for node IDs, search
//! topics, and content hashes. Keys order as unsigned big-endian integers,
//! which for 20-byte arrays is plain lexicographic order.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use data_encoding::BASE32;
use rand::RngCore;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};
use std::fmt;

/// Width of the key space in bits (constant B)
pub const KEY_BIT_SIZE: usize = 160;

/// Width of the key space in bytes
pub const KEY_BYTE_SIZE: usize = KEY_BIT_SIZE / 8;

/// Errors for key parsing and validation
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// The decoded value is not 160 bits wide
    #[error("invalid key length: {0} bytes")]
    InvalidLength(usize),
    /// The string is not valid hex, base32, or base64
    #[error("invalid key encoding")]
    InvalidKey,
    /// Not a magnet URI
    #[error("not a magnet URI: {0}")]
    NotMagnet(String),
}

/// A fixed-width binary value that represents keys and node IDs
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyBytes([u8; KEY_BYTE_SIZE]);

impl KeyBytes {
    /// Create a key from random bytes
    pub fn new_random() -> Self {
        let mut bytes = [0u8; KEY_BYTE_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        KeyBytes(bytes)
    }

    /// Create a key from a raw byte slice, which must be exactly 20 bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != KEY_BYTE_SIZE {
            return Err(KeyError::InvalidLength(bytes.len()));
        }

        let mut key = [0u8; KEY_BYTE_SIZE];
        key.copy_from_slice(bytes);
        Ok(KeyBytes(key))
    }

    /// Create a key as the SHA-1 digest of arbitrary bytes
    pub fn new_hash(data: &[u8]) -> Self {
        let digest = Sha1::digest(data);
        let mut key = [0u8; KEY_BYTE_SIZE];
        key.copy_from_slice(&digest);
        KeyBytes(key)
    }

    /// Parse a key from a string in hex, base32, or base64.
    ///
    /// The encodings are tried in that order; the first decoder that accepts
    /// the string wins, and the decoded value must be exactly 160 bits.
    pub fn parse(s: &str) -> Result<Self, KeyError> {
        if let Ok(bytes) = hex::decode(s) {
            return Self::from_bytes(&bytes);
        }

        if let Ok(bytes) = BASE32.decode(s.to_ascii_uppercase().as_bytes()) {
            return Self::from_bytes(&bytes);
        }

        if let Ok(bytes) = BASE64.decode(s) {
            return Self::from_bytes(&bytes);
        }

        Err(KeyError::InvalidKey)
    }

    /// Parse a key, returning `None` instead of an error on failure
    pub fn parse_silent(s: &str) -> Option<Self> {
        Self::parse(s).ok()
    }

    /// The raw bytes of the key
    pub fn as_bytes(&self) -> &[u8; KEY_BYTE_SIZE] {
        &self.0
    }

    /// The hex representation
    pub fn base16(&self) -> String {
        hex::encode_upper(self.0)
    }

    /// The base32 representation
    pub fn base32(&self) -> String {
        BASE32.encode(&self.0)
    }

    /// The base64 representation used on the wire
    pub fn base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// XOR distance from another key
    pub fn distance(&self, other: &KeyBytes) -> KeyDistance {
        let mut out = [0u8; KEY_BYTE_SIZE];

        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        KeyDistance(out)
    }

    /// Whether this key is the SHA-1 digest of the given value
    pub fn validate_value(&self, value: &[u8]) -> bool {
        *self == KeyBytes::new_hash(value)
    }
}

impl fmt::Display for KeyBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base16())
    }
}

impl fmt::Debug for KeyBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyBytes({})", self.base16())
    }
}

impl Serialize for KeyBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.base64())
    }
}

impl<'de> Deserialize<'de> for KeyBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        KeyBytes::parse(&s).map_err(D::Error::custom)
    }
}

/// XOR distance between two keys.
///
/// Distances compare as unsigned big-endian integers; the derived
/// lexicographic ordering over the byte array is exactly that.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyDistance([u8; KEY_BYTE_SIZE]);

impl KeyDistance {
    /// The raw bytes of the distance
    pub fn as_bytes(&self) -> &[u8; KEY_BYTE_SIZE] {
        &self.0
    }

    /// Whether the distance is zero, that is, the keys were equal
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Number of leading zero bits in the distance
    pub fn leading_zero_bits(&self) -> usize {
        leading_zero_bits(&self.0)
    }
}

impl fmt::Debug for KeyDistance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyDistance({})", hex::encode_upper(self.0))
    }
}

/// Return the number of leading zero bits in a byte slice
pub fn leading_zero_bits(bytes: &[u8]) -> usize {
    let mut count = 0;

    for &byte in bytes {
        if byte == 0 {
            count += 8;
        } else {
            count += byte.leading_zeros() as usize;
            break;
        }
    }

    count
}

/// Compute the bucket number for two keys.
///
/// Ranges over `0..=160`; the maximum is reached only when the keys are
/// equal, which the routing table rejects before indexing.
pub fn bucket_number(key_1: &KeyBytes, key_2: &KeyBytes) -> usize {
    key_1.distance(key_2).leading_zero_bits()
}

/// Return a random key that falls into the given bucket of a node.
///
/// The leading `bucket_number` bits match the node key, the bit at position
/// `bucket_number` is flipped, and the remaining bits are random.
pub fn random_bucket_key(node_key: &KeyBytes, bucket_number: usize) -> KeyBytes {
    assert!(bucket_number < KEY_BIT_SIZE);

    let mut bytes = [0u8; KEY_BYTE_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);

    let node_bytes = node_key.as_bytes();
    let full_bytes = bucket_number / 8;
    let partial_bits = bucket_number % 8;

    bytes[..full_bytes].copy_from_slice(&node_bytes[..full_bytes]);

    if partial_bits > 0 {
        let mask = 0xFFu8 << (8 - partial_bits);
        bytes[full_bytes] = (node_bytes[full_bytes] & mask) | (bytes[full_bytes] & !mask);
    }

    let bit_mask = 0x80u8 >> (bucket_number % 8);
    let flipped = node_bytes[full_bytes] ^ bit_mask;
    bytes[full_bytes] = (bytes[full_bytes] & !bit_mask) | (flipped & bit_mask);

    KeyBytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex() {
        let key = KeyBytes::parse("DA39A3EE5E6B4B0D3255BFEF95601890AFD80709").unwrap();
        assert_eq!(key, KeyBytes::new_hash(b""));

        let lower = KeyBytes::parse("da39a3ee5e6b4b0d3255bfef95601890afd80709").unwrap();
        assert_eq!(lower, key);
    }

    #[test]
    fn test_parse_base32() {
        let key = KeyBytes::parse("3I42H3S6NNFQ2MSVX7XZKYAYSCX5QBYJ").unwrap();
        assert_eq!(key, KeyBytes::new_hash(b""));
    }

    #[test]
    fn test_parse_base64() {
        let key = KeyBytes::new_hash(b"hello");
        let parsed = KeyBytes::parse(&key.base64()).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_parse_garbage() {
        assert!(KeyBytes::parse("not a key at all!!").is_err());
        assert!(KeyBytes::parse_silent("@@@").is_none());
        // Valid hex of the wrong width must not fall through to base32
        assert!(KeyBytes::parse("aabbccdd").is_err());
    }

    #[test]
    fn test_codec_round_trip() {
        let key = KeyBytes::new_random();

        assert_eq!(KeyBytes::parse(&key.base16()).unwrap(), key);
        assert_eq!(KeyBytes::parse(&key.base32()).unwrap(), key);
        assert_eq!(KeyBytes::parse(&key.base64()).unwrap(), key);
    }

    #[test]
    fn test_distance_symmetry() {
        for _ in 0..32 {
            let a = KeyBytes::new_random();
            let b = KeyBytes::new_random();

            assert_eq!(a.distance(&b), b.distance(&a));
        }

        let a = KeyBytes::new_random();
        assert!(a.distance(&a).is_zero());
    }

    #[test]
    fn test_bucket_number_bounds() {
        for _ in 0..32 {
            let a = KeyBytes::new_random();
            let b = KeyBytes::new_random();
            let n = bucket_number(&a, &b);

            assert!(n <= KEY_BIT_SIZE);
            assert_eq!(n == KEY_BIT_SIZE, a == b);
        }

        let a = KeyBytes::new_random();
        assert_eq!(bucket_number(&a, &a), KEY_BIT_SIZE);
    }

    #[test]
    fn test_leading_zero_bits() {
        assert_eq!(leading_zero_bits(&[0x00, 0x00]), 16);
        assert_eq!(leading_zero_bits(&[0x00, 0x01]), 15);
        assert_eq!(leading_zero_bits(&[0x80, 0x00]), 0);
        assert_eq!(leading_zero_bits(&[0x01]), 7);
    }

    #[test]
    fn test_random_bucket_key() {
        let node_key = KeyBytes::new_random();

        for i in 0..KEY_BIT_SIZE {
            let key = random_bucket_key(&node_key, i);
            assert_eq!(bucket_number(&node_key, &key), i, "bucket {}", i);
        }
    }

    #[test]
    fn test_validate_value() {
        let data = b"some stored value";
        let key = KeyBytes::new_hash(data);

        assert!(key.validate_value(data));
        assert!(!key.validate_value(b"some other value"));
    }

    #[test]
    fn test_ordering_is_big_endian() {
        let small = KeyBytes::from_bytes(&[0u8; 20]).unwrap();
        let mut big_bytes = [0u8; 20];
        big_bytes[0] = 1;
        let big = KeyBytes::from_bytes(&big_bytes).unwrap();

        assert!(small < big);
    }
}
