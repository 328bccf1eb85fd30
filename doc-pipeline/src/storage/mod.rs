//! Durable storage for document snapshots and raw update logs.
//!
//! Architecture:
//! ```text
//! ┌──────────────────┐   push (slow path)   ┌──────────────────────────────┐
//! │ DurableDocManager│ ───────────────────► │ DocStore                     │
//! └──────────────────┘                      │  snapshots — one per doc     │
//!                                           │  updates   — (doc, seq) log  │
//!                                           │  metadata  — sizes, counts   │
//!                                           └──────────────────────────────┘
//! ```
//!
//! Backends:
//! - [`RocksStore`] — RocksDB column families, LZ4-compressed snapshots
//! - [`MemoryStore`] — in-process maps, for tests and ephemeral setups

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, SnapshotMetadata, StoreConfig};

use thiserror::Error;

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// A raw update as logged by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUpdate {
    /// Per-store monotonically increasing sequence number
    pub seq: u64,
    pub blob: Vec<u8>,
}

/// A document that has raw updates waiting in the log.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoggedDoc {
    pub workspace: String,
    pub guid: String,
}

/// Durable source of truth for snapshots and raw updates.
///
/// Implementations must make `append_update` durable before returning.
pub trait DocStore: Send + Sync {
    /// Latest merged snapshot, if the document was ever consolidated.
    fn fetch_snapshot(&self, workspace: &str, guid: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// All logged raw updates for a document, in sequence order.
    fn fetch_updates(&self, workspace: &str, guid: &str) -> Result<Vec<StoredUpdate>, StoreError>;

    /// Append a raw update. Returns its sequence number.
    fn append_update(&self, workspace: &str, guid: &str, update: &[u8]) -> Result<u64, StoreError>;

    /// Overwrite the document's snapshot.
    fn write_snapshot(&self, workspace: &str, guid: &str, snapshot: &[u8]) -> Result<(), StoreError>;

    /// Delete exactly the logged updates with the given sequence numbers.
    /// Returns how many were removed.
    fn delete_updates(&self, workspace: &str, guid: &str, seqs: &[u64]) -> Result<u64, StoreError>;

    /// Documents that currently have logged raw updates.
    fn logged_docs(&self) -> Result<Vec<LoggedDoc>, StoreError>;
}

/// Buffer/store key of a document: `workspace:guid`.
pub fn doc_key(workspace: &str, guid: &str) -> String {
    format!("{workspace}:{guid}")
}
