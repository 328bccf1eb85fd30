//! Pipeline configuration.

use serde::Deserialize;
use std::time::Duration;

use crate::buffer::BufferKeys;

/// Configuration of the buffered manager and its consolidation worker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Pending-set key (default: `um_pending:`)
    pub pending_key: String,
    /// Prefix of per-document update lists (default: `um_u:`)
    pub updates_prefix: String,
    /// Prefix of per-document consolidation locks (default: `um_l:`)
    pub lock_prefix: String,
    /// Lock expiry in seconds (default: 600). Bounds how long a crashed
    /// consolidation pass can block a document.
    pub lock_ttl_secs: u64,
    /// Consolidation interval in milliseconds (default: 1000)
    pub apply_interval_ms: u64,
    /// Run the consolidation worker at all (default: true)
    pub automation: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pending_key: "um_pending:".to_string(),
            updates_prefix: "um_u:".to_string(),
            lock_prefix: "um_l:".to_string(),
            lock_ttl_secs: 600,
            apply_interval_ms: 1000,
            automation: true,
        }
    }
}

impl PipelineConfig {
    /// Config for testing: fast cadence, isolated key namespace.
    pub fn for_testing() -> Self {
        Self {
            pending_key: "test_pending:".to_string(),
            updates_prefix: "test_u:".to_string(),
            lock_prefix: "test_l:".to_string(),
            apply_interval_ms: 10,
            ..Self::default()
        }
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn apply_interval(&self) -> Duration {
        Duration::from_millis(self.apply_interval_ms)
    }

    pub fn buffer_keys(&self) -> BufferKeys {
        BufferKeys::new(&self.pending_key, &self.updates_prefix, &self.lock_prefix)
    }
}
