//! Shared files table
//!
//! A read-only key-value view over a set of shared directories. Files are
//! hashed in 256 KiB parts; a part lookup (`key == index`) reads bytes
//! straight out of the file on disk, and a file-info lookup returns the
//! cached canonical JSON document. Writes always fail: the filesystem is
//! the source of truth and `hash_directories` is how the view updates.

use crate::models::{FileInfo, COLLECTION_COOKIE};
use crate::table::{KvpRecord, KvpTable, StorageError};
use lib_events::{Observer, Task, TaskContext};
use lib_keys::{KeyBytes, KvpId};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use sha1::{Digest, Sha1};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Size of a file slice hashed and served as one value: 256 KiB
pub const PART_SIZE: usize = 1 << 18;

const COLLECTION_TYPE_BYTESTAG: i64 = 1;
const COLLECTION_TYPE_BITTORRENT: i64 = 2;

/// Provides a key-value view of shared files split into pieces
pub struct SharedFilesKvpTable {
    self_ref: std::sync::Weak<SharedFilesKvpTable>,
    connection: Mutex<Connection>,
    shared_directories: Mutex<Vec<PathBuf>>,
    value_changed: Arc<Observer<Option<KvpId>>>,
}

impl SharedFilesKvpTable {
    /// Open or create the view's database at `path`
    pub fn new(path: &Path) -> Result<Arc<Self>, StorageError> {
        let connection = Connection::open(path)?;

        connection.pragma_update(None, "synchronous", "NORMAL")?;
        let _mode: String =
            connection.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        connection.pragma_update(None, "foreign_keys", "ON")?;

        connection.execute_batch(
            "CREATE TABLE IF NOT EXISTS files (\
             id INTEGER PRIMARY KEY,\
             filename TEXT NOT NULL UNIQUE,\
             key BLOB NOT NULL,\
             `index` BLOB NOT NULL,\
             size INTEGER NOT NULL,\
             mtime INTEGER NOT NULL,\
             part_size INTEGER NOT NULL,\
             last_update INTEGER DEFAULT 0,\
             file_hash_info BLOB NOT NULL);\
             CREATE TABLE IF NOT EXISTS parts (\
             hash_id BLOB PRIMARY KEY,\
             file_id INTEGER NOT NULL,\
             file_offset INTEGER NOT NULL,\
             last_update INTEGER DEFAULT 0,\
             FOREIGN KEY (file_id) REFERENCES files (id) ON DELETE CASCADE);\
             CREATE TABLE IF NOT EXISTS collections (\
             file_id INTEGER PRIMARY KEY,\
             type INTEGER NOT NULL,\
             FOREIGN KEY (file_id) REFERENCES files (id) ON DELETE CASCADE);\
             CREATE INDEX IF NOT EXISTS key ON files (key);",
        )?;

        Ok(Arc::new_cyclic(|weak| SharedFilesKvpTable {
            self_ref: weak.clone(),
            connection: Mutex::new(connection),
            shared_directories: Mutex::new(Vec::new()),
            value_changed: Arc::new(Observer::new()),
        }))
    }

    /// The directories being shared
    pub fn shared_directories(&self) -> Vec<PathBuf> {
        self.shared_directories.lock().clone()
    }

    /// Add a directory to share. Takes effect on the next
    /// [`hash_directories`](Self::hash_directories) run.
    pub fn add_shared_directory(&self, directory: PathBuf) {
        self.shared_directories.lock().push(directory);
    }

    pub fn num_files(&self) -> Result<u64, StorageError> {
        let count: u64 =
            self.connection
                .lock()
                .query_row("SELECT COUNT(1) FROM files", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn num_collections(&self) -> Result<u64, StorageError> {
        let count: u64 = self.connection.lock().query_row(
            "SELECT COUNT(1) FROM collections",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Total size of the shared files on disk
    pub fn total_disk_size(&self) -> Result<u64, StorageError> {
        let total: Option<u64> =
            self.connection
                .lock()
                .query_row("SELECT SUM(size) FROM files", [], |row| row.get(0))?;
        Ok(total.unwrap_or(0))
    }

    /// Hash the shared directories and populate the view.
    ///
    /// Walks directories in sorted order, rehashes files whose size or
    /// mtime changed, prunes rows whose file is gone, and finally fires the
    /// change observer once with `None`. Progress is bytes hashed.
    pub fn hash_directories(&self) -> Task<()> {
        let table = self.self_ref.upgrade().expect("table alive");

        Task::spawn(move |ctx| async move {
            let run = {
                let table = table.clone();
                tokio::task::spawn_blocking(move || table.run_hash_task(&ctx))
            };

            match run.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(%err, "shared files hashing failed"),
                Err(err) => warn!(%err, "shared files hashing panicked"),
            }

            table.value_changed.fire(&None);
        })
    }

    fn run_hash_task(&self, ctx: &TaskContext) -> Result<(), StorageError> {
        let directories = self.shared_directories();

        if directories.is_empty() {
            info!("no directories to hash");
        }

        let mut bytes_hashed = 0u64;

        for directory in &directories {
            if !ctx.is_running() {
                return Ok(());
            }

            info!(?directory, "hashing directory");

            for (path, size, mtime) in walk_dir(directory) {
                if !ctx.is_running() {
                    return Ok(());
                }

                if let Err(err) = self.hash_file(ctx, &path, size, mtime, &mut bytes_hashed) {
                    warn!(%err, ?path, "failed to hash file");
                }
            }
        }

        self.prune(&directories)?;

        Ok(())
    }

    fn hash_file(
        &self,
        ctx: &TaskContext,
        path: &Path,
        size: u64,
        mtime: i64,
        bytes_hashed: &mut u64,
    ) -> Result<(), StorageError> {
        let filename = path.to_string_lossy().to_string();

        {
            let connection = self.connection.lock();

            let existing: Option<(i64, u64, i64)> = connection
                .query_row(
                    "SELECT id, size, mtime FROM files WHERE filename = ?1 LIMIT 1",
                    params![filename],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            if let Some((id, row_size, row_mtime)) = existing {
                if row_size == size && row_mtime == mtime {
                    return Ok(());
                }

                // Cascades to parts and the collection tag
                connection.execute("DELETE FROM files WHERE id = ?1", params![id])?;
            }
        }

        self.hash_parts(ctx, path, &filename, size, mtime, bytes_hashed)
    }

    fn hash_parts(
        &self,
        ctx: &TaskContext,
        path: &Path,
        filename: &str,
        size: u64,
        mtime: i64,
        bytes_hashed: &mut u64,
    ) -> Result<(), StorageError> {
        info!(?path, "hashing file");

        let mut file = File::open(path)?;
        let mut whole_file_hasher = Sha1::new();
        let mut part_hashes = Vec::new();

        loop {
            if !ctx.is_running() {
                return Ok(());
            }

            let mut buffer = vec![0u8; PART_SIZE];
            let read = read_full(&mut file, &mut buffer)?;

            if read == 0 {
                break;
            }

            buffer.truncate(read);
            whole_file_hasher.update(&buffer);
            part_hashes.push(KeyBytes::new_hash(&buffer));

            *bytes_hashed += read as u64;
            ctx.set_progress(*bytes_hashed);
        }

        let mut file_hash = [0u8; 20];
        file_hash.copy_from_slice(&whole_file_hasher.finalize());
        let file_hash = KeyBytes::from_bytes(&file_hash)?;

        let mut file_info = FileInfo::new(file_hash, part_hashes.clone());
        file_info.size = Some(size);
        file_info.filename = path
            .file_name()
            .map(|name| vec![name.to_string_lossy().to_string()]);

        let info_bytes = file_info.to_bytes();
        let index = KeyBytes::new_hash(&info_bytes);

        let connection = self.connection.lock();

        connection.execute(
            "INSERT INTO files (key, `index`, size, mtime, part_size, filename, file_hash_info) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                file_hash.as_bytes(),
                index.as_bytes(),
                size,
                mtime,
                PART_SIZE as i64,
                filename,
                info_bytes,
            ],
        )?;

        let file_id = connection.last_insert_rowid();

        for (i, hash) in part_hashes.iter().enumerate() {
            let offset = (i * PART_SIZE) as i64;

            let inserted = connection.execute(
                "INSERT OR IGNORE INTO parts (hash_id, file_id, file_offset) VALUES (?1, ?2, ?3)",
                params![hash.as_bytes(), file_id, offset],
            )?;

            if inserted == 0 {
                debug!(part = %hash, "possible duplicate part");
            }
        }

        if let Some(collection_type) = collection_type_of(path)? {
            connection.execute(
                "INSERT INTO collections (file_id, type) VALUES (?1, ?2)",
                params![file_id, collection_type],
            )?;
        }

        Ok(())
    }

    /// Remove rows whose file no longer exists or is no longer shared
    fn prune(&self, directories: &[PathBuf]) -> Result<(), StorageError> {
        info!("cleaning shared files database");

        let rows: Vec<(i64, String)> = {
            let connection = self.connection.lock();
            let mut statement = connection.prepare("SELECT id, filename FROM files")?;

            let rows = statement
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;

            rows
        };

        let stale: Vec<i64> = rows
            .into_iter()
            .filter(|(_, filename)| {
                let path = Path::new(filename);
                !path.exists() || !directories.iter().any(|dir| path.starts_with(dir))
            })
            .map(|(id, _)| id)
            .collect();

        if stale.is_empty() {
            return Ok(());
        }

        let mut connection = self.connection.lock();
        let transaction = connection.transaction()?;

        for id in &stale {
            transaction.execute("DELETE FROM files WHERE id = ?1", params![id])?;
        }

        transaction.commit()?;
        debug!(removed = stale.len(), "pruned missing shared files");

        Ok(())
    }

    fn contains_part(&self, key: &KeyBytes) -> Result<bool, StorageError> {
        let found: Option<i64> = self
            .connection
            .lock()
            .query_row(
                "SELECT 1 FROM parts WHERE hash_id = ?1",
                params![key.as_bytes()],
                |row| row.get(0),
            )
            .optional()?;

        Ok(found.is_some())
    }

    fn contains_file_info(&self, kvpid: &KvpId) -> Result<bool, StorageError> {
        let found: Option<i64> = self
            .connection
            .lock()
            .query_row(
                "SELECT 1 FROM files WHERE key = ?1 AND `index` = ?2",
                params![kvpid.key.as_bytes(), kvpid.index.as_bytes()],
                |row| row.get(0),
            )
            .optional()?;

        Ok(found.is_some())
    }

    fn get_part(&self, key: &KeyBytes) -> Result<Option<Vec<u8>>, StorageError> {
        let row: Option<(String, i64, i64)> = self
            .connection
            .lock()
            .query_row(
                "SELECT files.filename, parts.file_offset, files.part_size \
                 FROM parts JOIN files ON parts.file_id = files.id \
                 WHERE hash_id = ?1",
                params![key.as_bytes()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let (filename, offset, part_size) = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        let mut file = File::open(filename)?;
        file.seek(SeekFrom::Start(offset as u64))?;

        let mut value = Vec::new();
        file.take(part_size as u64).read_to_end(&mut value)?;

        Ok(Some(value))
    }

    fn get_file_info_bytes(&self, kvpid: &KvpId) -> Result<Option<Vec<u8>>, StorageError> {
        let bytes = self
            .connection
            .lock()
            .query_row(
                "SELECT file_hash_info FROM files WHERE key = ?1 AND `index` = ?2 LIMIT 1",
                params![kvpid.key.as_bytes(), kvpid.index.as_bytes()],
                |row| row.get(0),
            )
            .optional()?;

        Ok(bytes)
    }

    /// The parsed file info document for a file-info pair
    pub fn file_info(&self, kvpid: &KvpId) -> Result<Option<FileInfo>, StorageError> {
        match self.get_file_info_bytes(kvpid)? {
            Some(bytes) => Ok(FileInfo::from_bytes(&bytes).ok()),
            None => Ok(None),
        }
    }

    fn part_record(&self, kvpid: &KvpId) -> Result<Option<KvpRecord>, StorageError> {
        let row: Option<(i64, i64, u64, u64)> = self
            .connection
            .lock()
            .query_row(
                "SELECT parts.file_offset, files.part_size, files.size, parts.last_update \
                 FROM parts JOIN files ON parts.file_id = files.id \
                 WHERE hash_id = ?1",
                params![kvpid.key.as_bytes()],
                |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                },
            )
            .optional()?;

        Ok(row.map(|(offset, part_size, file_size, last_update)| {
            let remaining = file_size.saturating_sub(offset as u64);

            KvpRecord {
                kvpid: *kvpid,
                size: u64::min(part_size as u64, remaining),
                timestamp: None,
                time_to_live: None,
                is_original: true,
                last_update,
            }
        }))
    }

    fn file_info_record(&self, kvpid: &KvpId) -> Result<Option<KvpRecord>, StorageError> {
        let row: Option<(u64, u64)> = self
            .connection
            .lock()
            .query_row(
                "SELECT length(file_hash_info), last_update FROM files \
                 WHERE key = ?1 AND `index` = ?2 LIMIT 1",
                params![kvpid.key.as_bytes(), kvpid.index.as_bytes()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        Ok(row.map(|(size, last_update)| KvpRecord {
            kvpid: *kvpid,
            size,
            timestamp: None,
            time_to_live: None,
            is_original: true,
            last_update,
        }))
    }
}

impl KvpTable for SharedFilesKvpTable {
    fn contains(&self, kvpid: &KvpId) -> Result<bool, StorageError> {
        if kvpid.key == kvpid.index {
            self.contains_part(&kvpid.key)
        } else {
            self.contains_file_info(kvpid)
        }
    }

    fn get(&self, kvpid: &KvpId) -> Result<Option<Vec<u8>>, StorageError> {
        if kvpid.key == kvpid.index {
            self.get_part(&kvpid.key)
        } else {
            self.get_file_info_bytes(kvpid)
        }
    }

    fn set_raw(&self, _kvpid: &KvpId, _value: &[u8]) -> Result<(), StorageError> {
        Err(StorageError::ReadOnly)
    }

    fn delete_raw(&self, _kvpid: &KvpId) -> Result<(), StorageError> {
        Err(StorageError::ReadOnly)
    }

    fn indices(&self, key: &KeyBytes) -> Result<Vec<KeyBytes>, StorageError> {
        let mut indices = Vec::new();

        if self.contains_part(key)? {
            indices.push(*key);
        }

        let connection = self.connection.lock();
        let mut statement = connection.prepare("SELECT `index` FROM files WHERE key = ?1")?;

        let rows = statement.query_map(params![key.as_bytes()], |row| {
            row.get::<_, Vec<u8>>(0)
        })?;

        for row in rows {
            indices.push(KeyBytes::from_bytes(&row?)?);
        }

        Ok(indices)
    }

    fn keys(&self) -> Result<Vec<KvpId>, StorageError> {
        let connection = self.connection.lock();
        let mut keys = Vec::new();

        {
            let mut statement = connection.prepare("SELECT hash_id FROM parts")?;
            let rows = statement.query_map([], |row| row.get::<_, Vec<u8>>(0))?;

            for row in rows {
                let hash = KeyBytes::from_bytes(&row?)?;
                keys.push(KvpId::new(hash, hash));
            }
        }

        {
            let mut statement = connection.prepare("SELECT key, `index` FROM files")?;
            let rows = statement.query_map([], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;

            for row in rows {
                let (key, index) = row?;
                keys.push(KvpId::new(
                    KeyBytes::from_bytes(&key)?,
                    KeyBytes::from_bytes(&index)?,
                ));
            }
        }

        Ok(keys)
    }

    fn record(&self, kvpid: &KvpId) -> Result<Option<KvpRecord>, StorageError> {
        if kvpid.key == kvpid.index {
            self.part_record(kvpid)
        } else {
            self.file_info_record(kvpid)
        }
    }

    fn is_acceptable(
        &self,
        _kvpid: &KvpId,
        _size: u64,
        _timestamp: u64,
    ) -> Result<bool, StorageError> {
        Ok(false)
    }

    fn value_changed(&self) -> &Observer<Option<KvpId>> {
        &self.value_changed
    }

    fn set_timestamp(&self, _kvpid: &KvpId, _seconds: u64) -> Result<(), StorageError> {
        Err(StorageError::ReadOnly)
    }

    fn set_time_to_live(&self, _kvpid: &KvpId, _seconds: u64) -> Result<(), StorageError> {
        Err(StorageError::ReadOnly)
    }

    fn set_is_original(&self, _kvpid: &KvpId, _is_original: bool) -> Result<(), StorageError> {
        Err(StorageError::ReadOnly)
    }

    fn set_last_update(&self, kvpid: &KvpId, seconds: u64) -> Result<(), StorageError> {
        let connection = self.connection.lock();

        if kvpid.key == kvpid.index {
            connection.execute(
                "UPDATE parts SET last_update = ?1 WHERE hash_id = ?2",
                params![seconds as i64, kvpid.key.as_bytes()],
            )?;
        } else {
            connection.execute(
                "UPDATE files SET last_update = ?1 WHERE key = ?2 AND `index` = ?3",
                params![seconds as i64, kvpid.key.as_bytes(), kvpid.index.as_bytes()],
            )?;
        }

        Ok(())
    }
}

/// Walk a directory in sorted order, following symlinks, yielding regular
/// files with their size and mtime
fn walk_dir(directory: &Path) -> Vec<(PathBuf, u64, i64)> {
    let mut found = Vec::new();

    let entries = match std::fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(%err, ?directory, "cannot read shared directory");
            return found;
        }
    };

    let mut files = Vec::new();
    let mut subdirs = Vec::new();

    for entry in entries.flatten() {
        let path = entry.path();

        match std::fs::metadata(&path) {
            Ok(metadata) if metadata.is_file() => {
                let mtime = metadata
                    .modified()
                    .ok()
                    .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|duration| duration.as_secs() as i64)
                    .unwrap_or(0);

                files.push((path, metadata.len(), mtime));
            }
            Ok(metadata) if metadata.is_dir() => subdirs.push(path),
            _ => {}
        }
    }

    files.sort();
    subdirs.sort();

    found.extend(files);

    for subdir in subdirs {
        found.extend(walk_dir(&subdir));
    }

    found
}

fn read_full(file: &mut File, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;

    while filled < buffer.len() {
        let read = file.read(&mut buffer[filled..])?;

        if read == 0 {
            break;
        }

        filled += read;
    }

    Ok(filled)
}

/// Detect collection files by their content
fn collection_type_of(path: &Path) -> Result<Option<i64>, StorageError> {
    let mut file = File::open(path)?;
    let mut prefix = vec![0u8; COLLECTION_COOKIE.len()];
    let read = read_full(&mut file, &mut prefix)?;

    if prefix[..read].starts_with(COLLECTION_COOKIE) {
        return Ok(Some(COLLECTION_TYPE_BYTESTAG));
    }

    if path.extension().is_some_and(|ext| ext == "torrent") {
        file.seek(SeekFrom::Start(0))?;
        let mut head = vec![0u8; 1024];
        let read = read_full(&mut file, &mut head)?;
        let head = &head[..read];

        if contains_subslice(head, b"info") && contains_subslice(head, b"pieces") {
            return Ok(Some(COLLECTION_TYPE_BITTORRENT));
        }
    }

    Ok(None)
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}
