//! Disk-spilled queues
//!
//! [`BigDiskQueue`] keeps a bounded in-memory head and spills its tail into
//! a temporary SQLite database, giving unbounded capacity with FIFO order
//! preserved across the memory/disk boundary.

use parking_lot::Mutex;
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Notify;
use tracing::debug;

/// Errors from the disk-spill path
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("queue item encoding error: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("queue spill directory error: {0}")]
    Io(#[from] std::io::Error),
}

struct DiskTail {
    // Holds the spill directory alive for the queue's lifetime
    _dir: TempDir,
    connection: Connection,
    len: u64,
}

impl DiskTail {
    fn create() -> Result<Self, QueueError> {
        let dir = tempfile::Builder::new().suffix("-queue").tempdir()?;
        let connection = Connection::open(dir.path().join("queue.db"))?;

        connection.pragma_update(None, "synchronous", "OFF")?;
        // journal_mode reports the new mode back as a row
        let _mode: String =
            connection.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        connection.execute(
            "CREATE TABLE IF NOT EXISTS queue \
             (id INTEGER PRIMARY KEY, item BLOB NOT NULL)",
            [],
        )?;

        debug!(path = ?dir.path(), "queue spilling to disk");

        Ok(DiskTail {
            _dir: dir,
            connection,
            len: 0,
        })
    }

    fn push(&mut self, item: &[u8]) -> Result<(), QueueError> {
        self.connection
            .execute("INSERT INTO queue (item) VALUES (?1)", [item])?;
        self.len += 1;
        Ok(())
    }

    fn pop(&mut self) -> Result<Option<Vec<u8>>, QueueError> {
        let row: Option<(i64, Vec<u8>)> = self
            .connection
            .query_row(
                "SELECT id, item FROM queue ORDER BY id LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        match row {
            Some((id, item)) => {
                self.connection
                    .execute("DELETE FROM queue WHERE id = ?1", [id])?;
                self.len -= 1;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

struct QueueState<T> {
    memory: VecDeque<T>,
    disk: Option<DiskTail>,
}

impl<T> QueueState<T> {
    fn disk_len(&self) -> u64 {
        self.disk.as_ref().map(|tail| tail.len).unwrap_or(0)
    }
}

/// A FIFO queue that spools onto disk when the in-memory head fills up
pub struct BigDiskQueue<T> {
    state: Arc<Mutex<QueueState<T>>>,
    notify: Arc<Notify>,
    memory_size: usize,
}

impl<T> BigDiskQueue<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    /// Create a queue with the default in-memory bound of 100 items
    pub fn new() -> Self {
        Self::with_memory_size(100)
    }

    pub fn with_memory_size(memory_size: usize) -> Self {
        BigDiskQueue {
            state: Arc::new(Mutex::new(QueueState {
                memory: VecDeque::new(),
                disk: None,
            })),
            notify: Arc::new(Notify::new()),
            memory_size,
        }
    }

    /// Put an item on the queue without blocking.
    ///
    /// Once any item has spilled to disk, later items follow it there until
    /// the disk tail drains, keeping FIFO order across the boundary.
    pub fn put(&self, item: T) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock();

            if state.disk_len() == 0 && state.memory.len() < self.memory_size {
                state.memory.push_back(item);
            } else {
                let encoded = bincode::serialize(&item)?;

                if state.disk.is_none() {
                    state.disk = Some(DiskTail::create()?);
                }

                state
                    .disk
                    .as_mut()
                    .expect("disk tail just created")
                    .push(&encoded)?;
            }
        }

        self.notify.notify_one();
        Ok(())
    }

    /// Take an item from the queue without waiting
    pub fn try_get(&self) -> Result<Option<T>, QueueError> {
        let mut state = self.state.lock();

        if let Some(item) = state.memory.pop_front() {
            return Ok(Some(item));
        }

        if let Some(tail) = state.disk.as_mut() {
            if let Some(encoded) = tail.pop()? {
                return Ok(Some(bincode::deserialize(&encoded)?));
            }
        }

        Ok(None)
    }

    /// Wait for an item and take it
    pub async fn get(&self) -> Result<T, QueueError> {
        loop {
            let notified = self.notify.notified();

            if let Some(item) = self.try_get()? {
                return Ok(item);
            }

            notified.await;
        }
    }

    /// Total number of queued items, in memory and on disk
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.memory.len() + state.disk_len() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for BigDiskQueue<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip_in_memory() {
        let queue: BigDiskQueue<u32> = BigDiskQueue::new();

        queue.put(1).unwrap();
        queue.put(2).unwrap();

        assert_eq!(queue.get().await.unwrap(), 1);
        assert_eq!(queue.get().await.unwrap(), 2);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_fifo_across_spill_boundary() {
        let queue: BigDiskQueue<u32> = BigDiskQueue::with_memory_size(4);

        for i in 0..16 {
            queue.put(i).unwrap();
        }

        assert_eq!(queue.len(), 16);

        for i in 0..16 {
            assert_eq!(queue.get().await.unwrap(), i);
        }

        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_spill_then_refill_keeps_order() {
        let queue: BigDiskQueue<u32> = BigDiskQueue::with_memory_size(2);

        for i in 0..5 {
            queue.put(i).unwrap();
        }

        assert_eq!(queue.get().await.unwrap(), 0);
        assert_eq!(queue.get().await.unwrap(), 1);

        // Disk tail still holds items, so new items must queue behind them
        queue.put(100).unwrap();

        for expected in [2, 3, 4, 100] {
            assert_eq!(queue.get().await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_get_waits_for_put() {
        let queue: Arc<BigDiskQueue<String>> = Arc::new(BigDiskQueue::new());

        let getter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await.unwrap() })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        queue.put("hello".to_string()).unwrap();

        assert_eq!(getter.await.unwrap(), "hello");
    }
}
