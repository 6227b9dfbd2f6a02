//! Bytestag Storage System
//!
//! Key-value tables keyed by `(key, index)` pairs where the index is always
//! the SHA-1 of the stored bytes. Three concrete backends cover the node's
//! needs: an in-memory table, a capacity-bounded persistent cache, and a
//! read-only view over shared directories split into 256 KiB parts. An
//! aggregating table composes them behind one interface.

pub mod aggregate;
pub mod database;
pub mod files;
pub mod memory;
pub mod models;
pub mod shared_files;
pub mod table;

pub use aggregate::AggregatedKvpTable;
pub use database::DatabaseKvpTable;
pub use files::safe_filename;
pub use memory::MemoryKvpTable;
pub use models::{CollectionInfo, FileInfo, COLLECTION_COOKIE};
pub use shared_files::{SharedFilesKvpTable, PART_SIZE};
pub use table::{KvpRecord, KvpTable, StorageError};

/// Default capacity of the persistent cache: 64 GiB
pub const DEFAULT_CACHE_SIZE: u64 = 1 << 36;
