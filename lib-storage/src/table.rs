//! Key-value table interface
//!
//! Every writer enforces the content-address invariant: the index of a pair
//! is the SHA-1 of its value. Mutations fire the table's `value_changed`
//! observer, which the publisher listens to for republish scheduling. The
//! hash task fires it with `None` after a bulk rescan.

use lib_events::Observer;
use lib_keys::{KeyBytes, KvpId};
use std::sync::Arc;

/// Errors from the storage layer
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The value does not hash to the pair's index
    #[error("value does not match index hash")]
    IndexMismatch,
    /// Write attempted on a read-only table. Programmer error.
    #[error("table is read-only")]
    ReadOnly,
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("key error: {0}")]
    Key(#[from] lib_keys::KeyError),
    /// A filename cannot be made safe for the platform
    #[error("unsafe filename: {0}")]
    UnsafeFilename(String),
}

/// Information about a stored key-value pair
#[derive(Clone, Debug, PartialEq)]
pub struct KvpRecord {
    pub kvpid: KvpId,
    /// Length of the value in bytes
    pub size: u64,
    /// Original publication time, unix seconds
    pub timestamp: Option<u64>,
    /// How long the record is kept from its publication time
    pub time_to_live: Option<u64>,
    /// Whether this node is the publisher of the pair
    pub is_original: bool,
    /// When the value was last published or replicated, unix seconds
    pub last_update: u64,
}

/// A table of key-value pairs addressed by `(key, index)`
pub trait KvpTable: Send + Sync {
    fn contains(&self, kvpid: &KvpId) -> Result<bool, StorageError>;

    fn get(&self, kvpid: &KvpId) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store a value after validating `index == SHA1(value)` and fire the
    /// change observer
    fn set(&self, kvpid: &KvpId, value: &[u8]) -> Result<(), StorageError> {
        if !kvpid.index.validate_value(value) {
            return Err(StorageError::IndexMismatch);
        }

        self.set_raw(kvpid, value)?;
        self.value_changed().fire(&Some(*kvpid));

        Ok(())
    }

    /// Backend write; called only with a validated value
    fn set_raw(&self, kvpid: &KvpId, value: &[u8]) -> Result<(), StorageError>;

    /// Delete a pair and fire the change observer
    fn delete(&self, kvpid: &KvpId) -> Result<(), StorageError> {
        self.delete_raw(kvpid)?;
        self.value_changed().fire(&Some(*kvpid));

        Ok(())
    }

    /// Backend delete
    fn delete_raw(&self, kvpid: &KvpId) -> Result<(), StorageError>;

    /// The indices stored under a key
    fn indices(&self, key: &KeyBytes) -> Result<Vec<KeyBytes>, StorageError>;

    /// Every pair id in the table
    fn keys(&self) -> Result<Vec<KvpId>, StorageError>;

    /// The record for a pair, if stored
    fn record(&self, kvpid: &KvpId) -> Result<Option<KvpRecord>, StorageError>;

    /// The records stored under a key
    fn records_by_key(&self, key: &KeyBytes) -> Result<Vec<KvpRecord>, StorageError> {
        let mut records = Vec::new();

        for index in self.indices(key)? {
            if let Some(record) = self.record(&KvpId::new(*key, index))? {
                records.push(record);
            }
        }

        Ok(records)
    }

    /// Whether the table accepts a new pair of this size and timestamp
    fn is_acceptable(&self, kvpid: &KvpId, size: u64, timestamp: u64)
        -> Result<bool, StorageError>;

    /// Observer fired with `Some(kvpid)` on set/delete and `None` after a
    /// bulk rescan
    fn value_changed(&self) -> &Observer<Option<KvpId>>;

    fn set_timestamp(&self, kvpid: &KvpId, seconds: u64) -> Result<(), StorageError>;

    fn set_time_to_live(&self, kvpid: &KvpId, seconds: u64) -> Result<(), StorageError>;

    fn set_is_original(&self, kvpid: &KvpId, is_original: bool) -> Result<(), StorageError>;

    fn set_last_update(&self, kvpid: &KvpId, seconds: u64) -> Result<(), StorageError>;

    /// Remove expired pairs, returning how many were removed.
    ///
    /// Tables without expiry semantics remove nothing.
    fn clean(&self) -> Result<u64, StorageError> {
        Ok(0)
    }
}

/// Shared handle type used across the node
pub type SharedKvpTable = Arc<dyn KvpTable>;

/// Current unix time in seconds
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
