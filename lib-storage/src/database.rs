//! Persistent cache table
//!
//! A capacity-bounded SQLite table holding replicated and published values.
//! The database runs write-ahead logging with `synchronous=NORMAL`; all
//! statements are short single-row operations behind one connection lock.

use crate::table::{unix_now, KvpRecord, KvpTable, StorageError};
use lib_events::Observer;
use lib_keys::{KeyBytes, KvpId};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// A key-value table stored as a SQLite database
pub struct DatabaseKvpTable {
    connection: Mutex<Connection>,
    max_size: AtomicU64,
    path: PathBuf,
    value_changed: Arc<Observer<Option<KvpId>>>,
}

impl DatabaseKvpTable {
    /// Open or create the cache at `path` with the given capacity bound
    pub fn new(path: &Path, max_size: u64) -> Result<Self, StorageError> {
        let connection = open_connection(path)?;

        connection.execute(
            "CREATE TABLE IF NOT EXISTS kvps (\
             key_id BLOB NOT NULL, index_id BLOB NOT NULL,\
             timestamp INTEGER,\
             time_to_live INTEGER,\
             is_original INTEGER,\
             value BLOB,\
             last_update INTEGER DEFAULT 0,\
             PRIMARY KEY (key_id, index_id))",
            [],
        )?;

        Ok(DatabaseKvpTable {
            connection: Mutex::new(connection),
            max_size: AtomicU64::new(max_size),
            path: path.to_path_buf(),
            value_changed: Arc::new(Observer::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The maximum size the table will grow
    pub fn max_size(&self) -> u64 {
        self.max_size.load(Ordering::SeqCst)
    }

    pub fn set_max_size(&self, max_size: u64) {
        self.max_size.store(max_size, Ordering::SeqCst);
    }

    /// The current size of the database file
    pub fn database_size(&self) -> Result<u64, StorageError> {
        let connection = self.connection.lock();

        let page_count: u64 = connection.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: u64 = connection.query_row("PRAGMA page_size", [], |row| row.get(0))?;

        Ok(page_count * page_size)
    }

    fn save_field(&self, kvpid: &KvpId, field: &str, value: i64) -> Result<(), StorageError> {
        // Field names come from the callers below, never from input
        let statement = format!(
            "UPDATE kvps SET {} = ?1 WHERE key_id = ?2 AND index_id = ?3",
            field
        );

        self.connection.lock().execute(
            &statement,
            params![value, kvpid.key.as_bytes(), kvpid.index.as_bytes()],
        )?;

        Ok(())
    }

    fn get_record_row(&self, kvpid: &KvpId) -> Result<Option<KvpRecord>, StorageError> {
        let connection = self.connection.lock();

        let row = connection
            .query_row(
                "SELECT length(value), timestamp, time_to_live, is_original, last_update \
                 FROM kvps WHERE key_id = ?1 AND index_id = ?2 LIMIT 1",
                params![kvpid.key.as_bytes(), kvpid.index.as_bytes()],
                |row| {
                    Ok(KvpRecord {
                        kvpid: *kvpid,
                        size: row.get::<_, Option<u64>>(0)?.unwrap_or(0),
                        timestamp: row.get(1)?,
                        time_to_live: row.get(2)?,
                        is_original: row.get::<_, Option<bool>>(3)?.unwrap_or(false),
                        last_update: row.get::<_, Option<u64>>(4)?.unwrap_or(0),
                    })
                },
            )
            .optional()?;

        Ok(row)
    }
}

fn open_connection(path: &Path) -> Result<Connection, StorageError> {
    let connection = Connection::open(path)?;

    connection.pragma_update(None, "synchronous", "NORMAL")?;
    // journal_mode reports the new mode back as a row
    let _mode: String = connection.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    connection.pragma_update(None, "foreign_keys", "ON")?;

    Ok(connection)
}

impl KvpTable for DatabaseKvpTable {
    fn contains(&self, kvpid: &KvpId) -> Result<bool, StorageError> {
        let found: Option<i64> = self
            .connection
            .lock()
            .query_row(
                "SELECT 1 FROM kvps WHERE key_id = ?1 AND index_id = ?2 LIMIT 1",
                params![kvpid.key.as_bytes(), kvpid.index.as_bytes()],
                |row| row.get(0),
            )
            .optional()?;

        Ok(found.is_some())
    }

    fn get(&self, kvpid: &KvpId) -> Result<Option<Vec<u8>>, StorageError> {
        let value = self
            .connection
            .lock()
            .query_row(
                "SELECT value FROM kvps WHERE key_id = ?1 AND index_id = ?2 LIMIT 1",
                params![kvpid.key.as_bytes(), kvpid.index.as_bytes()],
                |row| row.get(0),
            )
            .optional()?;

        Ok(value)
    }

    fn set_raw(&self, kvpid: &KvpId, value: &[u8]) -> Result<(), StorageError> {
        self.connection.lock().execute(
            "INSERT INTO kvps (value, key_id, index_id) VALUES (?1, ?2, ?3) \
             ON CONFLICT (key_id, index_id) DO UPDATE SET value = ?1",
            params![value, kvpid.key.as_bytes(), kvpid.index.as_bytes()],
        )?;

        Ok(())
    }

    fn delete_raw(&self, kvpid: &KvpId) -> Result<(), StorageError> {
        self.connection.lock().execute(
            "DELETE FROM kvps WHERE key_id = ?1 AND index_id = ?2",
            params![kvpid.key.as_bytes(), kvpid.index.as_bytes()],
        )?;

        Ok(())
    }

    fn indices(&self, key: &KeyBytes) -> Result<Vec<KeyBytes>, StorageError> {
        let connection = self.connection.lock();
        let mut statement =
            connection.prepare("SELECT index_id FROM kvps WHERE key_id = ?1")?;

        let rows = statement.query_map(params![key.as_bytes()], |row| {
            row.get::<_, Vec<u8>>(0)
        })?;

        let mut indices = Vec::new();

        for row in rows {
            indices.push(KeyBytes::from_bytes(&row?)?);
        }

        Ok(indices)
    }

    fn keys(&self) -> Result<Vec<KvpId>, StorageError> {
        let connection = self.connection.lock();
        let mut statement = connection.prepare("SELECT key_id, index_id FROM kvps")?;

        let rows = statement.query_map([], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut keys = Vec::new();

        for row in rows {
            let (key, index) = row?;
            keys.push(KvpId::new(
                KeyBytes::from_bytes(&key)?,
                KeyBytes::from_bytes(&index)?,
            ));
        }

        Ok(keys)
    }

    fn record(&self, kvpid: &KvpId) -> Result<Option<KvpRecord>, StorageError> {
        self.get_record_row(kvpid)
    }

    fn is_acceptable(
        &self,
        kvpid: &KvpId,
        size: u64,
        timestamp: u64,
    ) -> Result<bool, StorageError> {
        if let Some(record) = self.record(kvpid)? {
            if record.timestamp == Some(timestamp) {
                return Ok(false);
            }
        }

        if self.database_size()? + size > self.max_size() {
            return Ok(false);
        }

        Ok(true)
    }

    fn value_changed(&self) -> &Observer<Option<KvpId>> {
        &self.value_changed
    }

    fn set_timestamp(&self, kvpid: &KvpId, seconds: u64) -> Result<(), StorageError> {
        self.save_field(kvpid, "timestamp", seconds as i64)
    }

    fn set_time_to_live(&self, kvpid: &KvpId, seconds: u64) -> Result<(), StorageError> {
        self.save_field(kvpid, "time_to_live", seconds as i64)
    }

    fn set_is_original(&self, kvpid: &KvpId, is_original: bool) -> Result<(), StorageError> {
        self.save_field(kvpid, "is_original", is_original as i64)
    }

    fn set_last_update(&self, kvpid: &KvpId, seconds: u64) -> Result<(), StorageError> {
        self.save_field(kvpid, "last_update", seconds as i64)
    }

    fn clean(&self) -> Result<u64, StorageError> {
        debug!("clean database");

        let removed = self.connection.lock().execute(
            "DELETE FROM kvps WHERE timestamp + time_to_live < ?1",
            params![unix_now() as i64],
        )?;

        Ok(removed as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_table(dir: &TempDir, max_size: u64) -> DatabaseKvpTable {
        DatabaseKvpTable::new(&dir.path().join("cache.db"), max_size).unwrap()
    }

    fn pair(value: &[u8]) -> KvpId {
        let index = KeyBytes::new_hash(value);
        KvpId::new(index, index)
    }

    #[test]
    fn test_set_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let table = open_table(&dir, 1 << 30);

        let value = b"persisted value".to_vec();
        let kvpid = pair(&value);

        table.set(&kvpid, &value).unwrap();
        assert!(table.contains(&kvpid).unwrap());
        assert_eq!(table.get(&kvpid).unwrap(), Some(value));

        table.delete(&kvpid).unwrap();
        assert_eq!(table.get(&kvpid).unwrap(), None);
    }

    #[test]
    fn test_record_fields_persist() {
        let dir = TempDir::new().unwrap();
        let table = open_table(&dir, 1 << 30);

        let value = b"with metadata".to_vec();
        let kvpid = pair(&value);

        table.set(&kvpid, &value).unwrap();
        table.set_timestamp(&kvpid, 12345678).unwrap();
        table.set_time_to_live(&kvpid, 86400).unwrap();
        table.set_is_original(&kvpid, true).unwrap();
        table.set_last_update(&kvpid, 999).unwrap();

        let record = table.record(&kvpid).unwrap().unwrap();
        assert_eq!(record.size, value.len() as u64);
        assert_eq!(record.timestamp, Some(12345678));
        assert_eq!(record.time_to_live, Some(86400));
        assert!(record.is_original);
        assert_eq!(record.last_update, 999);
    }

    #[test]
    fn test_is_acceptable_duplicate_and_capacity() {
        let dir = TempDir::new().unwrap();
        let table = open_table(&dir, 1 << 30);

        let value = b"dup check".to_vec();
        let kvpid = pair(&value);

        assert!(table.is_acceptable(&kvpid, value.len() as u64, 777).unwrap());

        table.set(&kvpid, &value).unwrap();
        table.set_timestamp(&kvpid, 777).unwrap();

        assert!(!table.is_acceptable(&kvpid, value.len() as u64, 777).unwrap());
        assert!(table.is_acceptable(&kvpid, value.len() as u64, 778).unwrap());

        // A tiny capacity refuses any new pair
        table.set_max_size(1);
        let other = pair(b"other");
        assert!(!table.is_acceptable(&other, 100, 1).unwrap());
    }

    #[test]
    fn test_clean_removes_expired_rows() {
        let dir = TempDir::new().unwrap();
        let table = open_table(&dir, 1 << 30);

        let expired = b"expired".to_vec();
        let fresh = b"fresh".to_vec();
        let expired_id = pair(&expired);
        let fresh_id = pair(&fresh);

        table.set(&expired_id, &expired).unwrap();
        table.set_timestamp(&expired_id, 1).unwrap();
        table.set_time_to_live(&expired_id, 1).unwrap();

        table.set(&fresh_id, &fresh).unwrap();
        table.set_timestamp(&fresh_id, unix_now()).unwrap();
        table.set_time_to_live(&fresh_id, 86400).unwrap();

        assert_eq!(table.clean().unwrap(), 1);
        assert!(!table.contains(&expired_id).unwrap());
        assert!(table.contains(&fresh_id).unwrap());
    }

    #[test]
    fn test_reopen_preserves_rows() {
        let dir = TempDir::new().unwrap();
        let value = b"durable".to_vec();
        let kvpid = pair(&value);

        {
            let table = open_table(&dir, 1 << 30);
            table.set(&kvpid, &value).unwrap();
        }

        let table = open_table(&dir, 1 << 30);
        assert_eq!(table.get(&kvpid).unwrap(), Some(value));
    }
}
