//! Aggregated key-value table
//!
//! Composes several tables behind one interface. Reads consult the tables
//! in order and return the first hit; writes go to the designated primary.
//! Index listings concatenate across tables, so duplicates surface
//! naturally and consumers must be tolerant of them.

use crate::table::{KvpRecord, KvpTable, StorageError};
use lib_events::Observer;
use lib_keys::{KeyBytes, KvpId};
use std::sync::Arc;

/// Combines several tables, writing to one of them
pub struct AggregatedKvpTable {
    primary: Arc<dyn KvpTable>,
    tables: Vec<Arc<dyn KvpTable>>,
    value_changed: Arc<Observer<Option<KvpId>>>,
}

impl AggregatedKvpTable {
    /// Build an aggregate over `tables` with `primary` receiving writes.
    ///
    /// `primary` must also appear in `tables` for reads to see it. Change
    /// events from every table re-fire on the aggregate.
    pub fn new(primary: Arc<dyn KvpTable>, tables: Vec<Arc<dyn KvpTable>>) -> Self {
        let value_changed = Arc::new(Observer::new());

        for table in &tables {
            let observer = value_changed.clone();

            table
                .value_changed()
                .register(move |change: &Option<KvpId>| observer.fire(change));
        }

        AggregatedKvpTable {
            primary,
            tables,
            value_changed,
        }
    }

    pub fn tables(&self) -> &[Arc<dyn KvpTable>] {
        &self.tables
    }

    pub fn primary(&self) -> &Arc<dyn KvpTable> {
        &self.primary
    }
}

impl KvpTable for AggregatedKvpTable {
    fn contains(&self, kvpid: &KvpId) -> Result<bool, StorageError> {
        for table in &self.tables {
            if table.contains(kvpid)? {
                return Ok(true);
            }
        }

        Ok(false)
    }

    fn get(&self, kvpid: &KvpId) -> Result<Option<Vec<u8>>, StorageError> {
        for table in &self.tables {
            if let Some(value) = table.get(kvpid)? {
                return Ok(Some(value));
            }
        }

        Ok(None)
    }

    fn set_raw(&self, kvpid: &KvpId, value: &[u8]) -> Result<(), StorageError> {
        self.primary.set_raw(kvpid, value)
    }

    fn delete_raw(&self, kvpid: &KvpId) -> Result<(), StorageError> {
        self.primary.delete_raw(kvpid)
    }

    fn indices(&self, key: &KeyBytes) -> Result<Vec<KeyBytes>, StorageError> {
        let mut indices = Vec::new();

        for table in &self.tables {
            indices.extend(table.indices(key)?);
        }

        Ok(indices)
    }

    fn keys(&self) -> Result<Vec<KvpId>, StorageError> {
        let mut keys = Vec::new();

        for table in &self.tables {
            keys.extend(table.keys()?);
        }

        Ok(keys)
    }

    fn record(&self, kvpid: &KvpId) -> Result<Option<KvpRecord>, StorageError> {
        for table in &self.tables {
            if table.contains(kvpid)? {
                return table.record(kvpid);
            }
        }

        Ok(None)
    }

    fn records_by_key(&self, key: &KeyBytes) -> Result<Vec<KvpRecord>, StorageError> {
        let mut records = Vec::new();

        for table in &self.tables {
            for index in table.indices(key)? {
                if let Some(record) = self.record(&KvpId::new(*key, index))? {
                    records.push(record);
                }
            }
        }

        Ok(records)
    }

    /// Delegates to the primary only when the pair is absent from every
    /// table
    fn is_acceptable(
        &self,
        kvpid: &KvpId,
        size: u64,
        timestamp: u64,
    ) -> Result<bool, StorageError> {
        if self.contains(kvpid)? {
            return Ok(false);
        }

        self.primary.is_acceptable(kvpid, size, timestamp)
    }

    fn value_changed(&self) -> &Observer<Option<KvpId>> {
        &self.value_changed
    }

    fn set_timestamp(&self, kvpid: &KvpId, seconds: u64) -> Result<(), StorageError> {
        self.owner_of(kvpid)?.set_timestamp(kvpid, seconds)
    }

    fn set_time_to_live(&self, kvpid: &KvpId, seconds: u64) -> Result<(), StorageError> {
        self.owner_of(kvpid)?.set_time_to_live(kvpid, seconds)
    }

    fn set_is_original(&self, kvpid: &KvpId, is_original: bool) -> Result<(), StorageError> {
        self.owner_of(kvpid)?.set_is_original(kvpid, is_original)
    }

    fn set_last_update(&self, kvpid: &KvpId, seconds: u64) -> Result<(), StorageError> {
        self.owner_of(kvpid)?.set_last_update(kvpid, seconds)
    }

    fn clean(&self) -> Result<u64, StorageError> {
        let mut removed = 0;

        for table in &self.tables {
            removed += table.clean()?;
        }

        Ok(removed)
    }
}

impl AggregatedKvpTable {
    /// The first table containing the pair, falling back to the primary
    fn owner_of(&self, kvpid: &KvpId) -> Result<&Arc<dyn KvpTable>, StorageError> {
        for table in &self.tables {
            if table.contains(kvpid)? {
                return Ok(table);
            }
        }

        Ok(&self.primary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKvpTable;

    fn pair(value: &[u8]) -> KvpId {
        let index = KeyBytes::new_hash(value);
        KvpId::new(index, index)
    }

    fn build() -> (Arc<MemoryKvpTable>, Arc<MemoryKvpTable>, AggregatedKvpTable) {
        let cache: Arc<MemoryKvpTable> = Arc::new(MemoryKvpTable::new());
        let shared: Arc<MemoryKvpTable> = Arc::new(MemoryKvpTable::new());

        let aggregate = AggregatedKvpTable::new(
            cache.clone(),
            vec![cache.clone() as Arc<dyn KvpTable>, shared.clone() as Arc<dyn KvpTable>],
        );

        (cache, shared, aggregate)
    }

    #[test]
    fn test_reads_consult_tables_in_order() {
        let (_cache, shared, aggregate) = build();

        let value = b"only in secondary".to_vec();
        let kvpid = pair(&value);
        shared.set(&kvpid, &value).unwrap();

        assert!(aggregate.contains(&kvpid).unwrap());
        assert_eq!(aggregate.get(&kvpid).unwrap(), Some(value));
        assert!(aggregate.record(&kvpid).unwrap().is_some());
    }

    #[test]
    fn test_writes_go_to_primary() {
        let (cache, shared, aggregate) = build();

        let value = b"written through".to_vec();
        let kvpid = pair(&value);

        aggregate.set(&kvpid, &value).unwrap();

        assert!(cache.contains(&kvpid).unwrap());
        assert!(!shared.contains(&kvpid).unwrap());
    }

    #[test]
    fn test_indices_concatenate_with_duplicates() {
        let (cache, shared, aggregate) = build();

        let value = b"everywhere".to_vec();
        let kvpid = pair(&value);

        cache.set(&kvpid, &value).unwrap();
        shared.set(&kvpid, &value).unwrap();

        // Both tables report the index; the duplicate surfaces
        assert_eq!(aggregate.indices(&kvpid.key).unwrap().len(), 2);
        assert_eq!(aggregate.records_by_key(&kvpid.key).unwrap().len(), 2);
    }

    #[test]
    fn test_is_acceptable_only_when_absent_everywhere() {
        let (_cache, shared, aggregate) = build();

        let value = b"present".to_vec();
        let kvpid = pair(&value);

        assert!(aggregate.is_acceptable(&kvpid, 7, 1).unwrap());

        shared.set(&kvpid, &value).unwrap();
        assert!(!aggregate.is_acceptable(&kvpid, 7, 1).unwrap());
    }

    #[test]
    fn test_change_events_re_fire() {
        let (cache, _shared, aggregate) = build();
        let seen = Arc::new(parking_lot::Mutex::new(0u32));

        {
            let seen = seen.clone();
            aggregate.value_changed().register(move |_| *seen.lock() += 1);
        }

        let value = b"observed".to_vec();
        let kvpid = pair(&value);
        cache.set(&kvpid, &value).unwrap();

        assert_eq!(*seen.lock(), 1);
    }
}
