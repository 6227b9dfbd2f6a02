//! Key-value pair identifiers

use crate::keys::KeyBytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The components of a stored value's identity.
///
/// `key` is the search topic; `index` is the SHA-1 of the stored bytes. For
/// a single file part the two coincide; for file-info records they differ.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KvpId {
    pub key: KeyBytes,
    pub index: KeyBytes,
}

impl KvpId {
    pub fn new(key: KeyBytes, index: KeyBytes) -> Self {
        KvpId { key, index }
    }
}

impl fmt::Display for KvpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<KVPID {}:{}>", self.key.base16(), self.index.base16())
    }
}

impl fmt::Debug for KvpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_is_componentwise() {
        let key = KeyBytes::new_hash(b"topic");
        let index = KeyBytes::new_hash(b"value");

        assert_eq!(KvpId::new(key, index), KvpId::new(key, index));
        assert_ne!(KvpId::new(key, index), KvpId::new(index, key));
    }
}
