//! In-memory key-value table

use crate::table::{KvpRecord, KvpTable, StorageError};
use lib_events::Observer;
use lib_keys::{KeyBytes, KvpId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone, Default)]
struct MemoryEntry {
    value: Vec<u8>,
    timestamp: Option<u64>,
    time_to_live: Option<u64>,
    is_original: bool,
    last_update: u64,
}

/// A table backed by a process-local map
#[derive(Default)]
pub struct MemoryKvpTable {
    entries: Mutex<HashMap<KvpId, MemoryEntry>>,
    value_changed: Arc<Observer<Option<KvpId>>>,
}

impl MemoryKvpTable {
    pub fn new() -> Self {
        MemoryKvpTable::default()
    }

    // Field updates on an absent pair are no-ops, matching the database
    // table's UPDATE semantics
    fn with_entry(
        &self,
        kvpid: &KvpId,
        apply: impl FnOnce(&mut MemoryEntry),
    ) -> Result<(), StorageError> {
        if let Some(entry) = self.entries.lock().get_mut(kvpid) {
            apply(entry);
        }

        Ok(())
    }
}

impl KvpTable for MemoryKvpTable {
    fn contains(&self, kvpid: &KvpId) -> Result<bool, StorageError> {
        Ok(self.entries.lock().contains_key(kvpid))
    }

    fn get(&self, kvpid: &KvpId) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.lock().get(kvpid).map(|entry| entry.value.clone()))
    }

    fn set_raw(&self, kvpid: &KvpId, value: &[u8]) -> Result<(), StorageError> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(*kvpid).or_default();
        entry.value = value.to_vec();

        Ok(())
    }

    fn delete_raw(&self, kvpid: &KvpId) -> Result<(), StorageError> {
        self.entries.lock().remove(kvpid);
        Ok(())
    }

    fn indices(&self, key: &KeyBytes) -> Result<Vec<KeyBytes>, StorageError> {
        Ok(self
            .entries
            .lock()
            .keys()
            .filter(|kvpid| kvpid.key == *key)
            .map(|kvpid| kvpid.index)
            .collect())
    }

    fn keys(&self) -> Result<Vec<KvpId>, StorageError> {
        Ok(self.entries.lock().keys().copied().collect())
    }

    fn record(&self, kvpid: &KvpId) -> Result<Option<KvpRecord>, StorageError> {
        Ok(self.entries.lock().get(kvpid).map(|entry| KvpRecord {
            kvpid: *kvpid,
            size: entry.value.len() as u64,
            timestamp: entry.timestamp,
            time_to_live: entry.time_to_live,
            is_original: entry.is_original,
            last_update: entry.last_update,
        }))
    }

    fn is_acceptable(
        &self,
        kvpid: &KvpId,
        _size: u64,
        timestamp: u64,
    ) -> Result<bool, StorageError> {
        let entries = self.entries.lock();

        match entries.get(kvpid) {
            Some(entry) => Ok(entry.timestamp != Some(timestamp)),
            None => Ok(true),
        }
    }

    fn value_changed(&self) -> &Observer<Option<KvpId>> {
        &self.value_changed
    }

    fn set_timestamp(&self, kvpid: &KvpId, seconds: u64) -> Result<(), StorageError> {
        self.with_entry(kvpid, |entry| entry.timestamp = Some(seconds))
    }

    fn set_time_to_live(&self, kvpid: &KvpId, seconds: u64) -> Result<(), StorageError> {
        self.with_entry(kvpid, |entry| entry.time_to_live = Some(seconds))
    }

    fn set_is_original(&self, kvpid: &KvpId, is_original: bool) -> Result<(), StorageError> {
        self.with_entry(kvpid, |entry| entry.is_original = is_original)
    }

    fn set_last_update(&self, kvpid: &KvpId, seconds: u64) -> Result<(), StorageError> {
        self.with_entry(kvpid, |entry| entry.last_update = seconds)
    }

    fn clean(&self) -> Result<u64, StorageError> {
        let now = crate::table::unix_now();
        let mut entries = self.entries.lock();
        let before = entries.len();

        entries.retain(|_, entry| match (entry.timestamp, entry.time_to_live) {
            (Some(timestamp), Some(ttl)) => timestamp + ttl >= now,
            _ => true,
        });

        Ok((before - entries.len()) as u64)
    }
}
