//! Bulk transfer tasks
//!
//! A download assembles chunks fed by the socket loop into a spooled buffer
//! that stays in memory up to a threshold and spills into an anonymous temp
//! file past it. The per-transfer inactivity timer lives in the network
//! layer; it terminates a stalled download by feeding it an absent chunk.

use crate::SPOOL_THRESHOLD;
use lib_events::{Task, TaskContext};
use parking_lot::Mutex;
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::debug;

/// A byte buffer that spills to a temp file past a threshold
pub struct SpooledBuffer {
    memory: Vec<u8>,
    file: Option<std::fs::File>,
    len: u64,
    threshold: usize,
}

impl SpooledBuffer {
    pub fn new(threshold: usize) -> Self {
        SpooledBuffer {
            memory: Vec::new(),
            file: None,
            len: 0,
            threshold,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        if self.file.is_none() && self.memory.len() + data.len() > self.threshold {
            let mut file = tempfile::tempfile()?;
            file.write_all(&self.memory)?;
            self.memory = Vec::new();
            self.file = Some(file);
        }

        match &mut self.file {
            Some(file) => file.write_all(data)?,
            None => self.memory.extend_from_slice(data),
        }

        self.len += data.len() as u64;
        Ok(())
    }

    /// Consume the buffer, returning its full contents
    pub fn into_bytes(self) -> std::io::Result<Vec<u8>> {
        match self.file {
            Some(mut file) => {
                let mut bytes = Vec::with_capacity(self.len as usize);
                file.seek(SeekFrom::Start(0))?;
                file.read_to_end(&mut bytes)?;
                Ok(bytes)
            }
            None => Ok(self.memory),
        }
    }
}

/// Downloads chunked data fed by the socket loop.
///
/// The task result is the assembled bytes, which may be partial if the
/// transfer was interrupted.
pub struct DownloadTask {
    task: Task<Vec<u8>>,
    chunk_tx: mpsc::UnboundedSender<Option<Vec<u8>>>,
    last_modified: Mutex<Instant>,
    timeout: Duration,
    address: Mutex<Option<SocketAddr>>,
}

impl DownloadTask {
    /// Start a download task.
    ///
    /// `max_size` stops the transfer once that many bytes have arrived.
    pub fn start(timeout: Duration, max_size: Option<u64>) -> Arc<Self> {
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();

        let task = Task::spawn(move |ctx| Self::run(ctx, chunk_rx, max_size));

        Arc::new(DownloadTask {
            task,
            chunk_tx,
            last_modified: Mutex::new(Instant::now()),
            timeout,
            address: Mutex::new(None),
        })
    }

    async fn run(
        ctx: TaskContext,
        mut chunk_rx: mpsc::UnboundedReceiver<Option<Vec<u8>>>,
        max_size: Option<u64>,
    ) -> Vec<u8> {
        let mut buffer = SpooledBuffer::new(SPOOL_THRESHOLD);

        loop {
            if !ctx.is_running() {
                break;
            }

            let chunk = tokio::time::timeout(Duration::from_secs(2), chunk_rx.recv()).await;

            match chunk {
                Ok(Some(Some(data))) => {
                    if let Err(err) = buffer.write(&data) {
                        debug!(%err, "download spool write failed");
                        break;
                    }

                    ctx.set_progress(buffer.len());

                    if max_size.is_some_and(|max| buffer.len() >= max) {
                        break;
                    }
                }
                // Null terminator or all feeders gone
                Ok(Some(None)) | Ok(None) => break,
                // Idle; poll the stop flag again
                Err(_) => continue,
            }
        }

        buffer.into_bytes().unwrap_or_else(|err| {
            debug!(%err, "download spool read failed");
            Vec::new()
        })
    }

    /// Feed a chunk into the download. `None` terminates it.
    pub fn feed(&self, chunk: Option<Vec<u8>>) {
        *self.last_modified.lock() = Instant::now();
        let _ = self.chunk_tx.send(chunk);
    }

    /// The underlying task; its result is the assembled bytes
    pub fn task(&self) -> &Task<Vec<u8>> {
        &self.task
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    /// When the download last received a chunk
    pub fn last_modified(&self) -> Instant {
        *self.last_modified.lock()
    }

    /// The inactivity timeout for this transfer
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The address of the sending peer, once known
    pub fn address(&self) -> Option<SocketAddr> {
        *self.address.lock()
    }

    pub fn set_address(&self, address: SocketAddr) {
        *self.address.lock() = Some(address);
    }
}
