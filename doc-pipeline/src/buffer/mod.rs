//! Fast, shared update buffer in front of the durable store.
//!
//! The buffer is a key-value server shared by every process running the
//! pipeline. The core only needs a handful of commands from it:
//!
//! ```text
//! um_pending:          SET   of doc keys with unmerged updates
//! um_u:<ws>:<guid>     LIST  of buffered update fragments (append-only)
//! um_l:<ws>:<guid>     VALUE consolidation lock, set-if-absent with TTL
//! ```
//!
//! Every command may fail (connection loss, command error); callers decide
//! how to degrade.

pub mod memory;

pub use memory::MemoryBuffer;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Buffer-layer failures. Never surfaced to pipeline callers.
#[derive(Debug, Clone, Error)]
pub enum BufferError {
    #[error("Buffer unavailable: {0}")]
    Unavailable(String),
    #[error("Buffer command failed: {0}")]
    Command(String),
}

/// Command set the buffered manager issues against the buffer.
#[async_trait]
pub trait UpdateBuffer: Send + Sync {
    /// Append `update` to `list_key` and add `member` to `set_key` as one
    /// atomic operation: both effects become visible together or not at all.
    async fn push_update(
        &self,
        set_key: &str,
        list_key: &str,
        member: &str,
        update: &[u8],
    ) -> Result<(), BufferError>;

    /// All items of a list, head first. Missing list reads as empty.
    async fn list_range(&self, key: &str) -> Result<Vec<Vec<u8>>, BufferError>;

    /// Drop the first `count` items of a list; items appended later survive.
    async fn list_trim_front(&self, key: &str, count: usize) -> Result<(), BufferError>;

    /// Add a member to a set.
    async fn set_add(&self, key: &str, member: &str) -> Result<(), BufferError>;

    /// Remove and return an arbitrary member of a set.
    async fn set_pop(&self, key: &str) -> Result<Option<String>, BufferError>;

    /// Store `value` under `key` only if absent, expiring after `ttl`.
    /// Returns whether the value was stored.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, BufferError>;

    /// Delete a key of any kind.
    async fn delete(&self, key: &str) -> Result<(), BufferError>;
}

/// Key layout of the pipeline inside the buffer.
#[derive(Debug, Clone)]
pub struct BufferKeys {
    pending: String,
    updates_prefix: String,
    lock_prefix: String,
}

impl BufferKeys {
    pub fn new(
        pending: impl Into<String>,
        updates_prefix: impl Into<String>,
        lock_prefix: impl Into<String>,
    ) -> Self {
        Self {
            pending: pending.into(),
            updates_prefix: updates_prefix.into(),
            lock_prefix: lock_prefix.into(),
        }
    }

    /// The pending set.
    pub fn pending(&self) -> &str {
        &self.pending
    }

    /// Update list of a document.
    pub fn updates(&self, doc_key: &str) -> String {
        format!("{}{doc_key}", self.updates_prefix)
    }

    /// Consolidation lock of a document.
    pub fn lock(&self, doc_key: &str) -> String {
        format!("{}{doc_key}", self.lock_prefix)
    }
}

impl Default for BufferKeys {
    fn default() -> Self {
        Self::new("um_pending:", "um_u:", "um_l:")
    }
}
