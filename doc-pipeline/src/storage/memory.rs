//! In-memory document store.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;

use super::{DocStore, LoggedDoc, StoreError, StoredUpdate};

type DocKey = (String, String);

/// A [`DocStore`] kept entirely in memory.
///
/// Suitable for tests and ephemeral deployments. `set_available(false)`
/// makes every call fail with [`StoreError::Unavailable`], which lets tests
/// exercise the error paths of the managers.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshots: RwLock<HashMap<DocKey, Vec<u8>>>,
    updates: RwLock<HashMap<DocKey, BTreeMap<u64, Vec<u8>>>>,
    sequence: AtomicU64,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle simulated outages.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of raw updates currently logged across all documents.
    pub fn logged_update_count(&self) -> usize {
        self.updates.read().values().map(BTreeMap::len).sum()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store disabled".into()));
        }
        Ok(())
    }

    fn key(workspace: &str, guid: &str) -> DocKey {
        (workspace.to_string(), guid.to_string())
    }
}

impl DocStore for MemoryStore {
    fn fetch_snapshot(&self, workspace: &str, guid: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check()?;
        let snapshots = self.snapshots.read();
        Ok(snapshots.get(&Self::key(workspace, guid)).cloned())
    }

    fn fetch_updates(&self, workspace: &str, guid: &str) -> Result<Vec<StoredUpdate>, StoreError> {
        self.check()?;
        let updates = self.updates.read();
        Ok(updates
            .get(&Self::key(workspace, guid))
            .map(|log| {
                log.iter()
                    .map(|(seq, blob)| StoredUpdate {
                        seq: *seq,
                        blob: blob.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn append_update(&self, workspace: &str, guid: &str, update: &[u8]) -> Result<u64, StoreError> {
        self.check()?;
        let mut updates = self.updates.write();
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        updates
            .entry(Self::key(workspace, guid))
            .or_default()
            .insert(seq, update.to_vec());
        Ok(seq)
    }

    fn write_snapshot(&self, workspace: &str, guid: &str, snapshot: &[u8]) -> Result<(), StoreError> {
        self.check()?;
        let mut snapshots = self.snapshots.write();
        snapshots.insert(Self::key(workspace, guid), snapshot.to_vec());
        Ok(())
    }

    fn delete_updates(&self, workspace: &str, guid: &str, seqs: &[u64]) -> Result<u64, StoreError> {
        self.check()?;
        let mut updates = self.updates.write();
        let key = Self::key(workspace, guid);
        let Some(log) = updates.get_mut(&key) else {
            return Ok(0);
        };

        let removed = seqs.iter().filter(|seq| log.remove(*seq).is_some()).count() as u64;
        if log.is_empty() {
            updates.remove(&key);
        }
        Ok(removed)
    }

    fn logged_docs(&self) -> Result<Vec<LoggedDoc>, StoreError> {
        self.check()?;
        let updates = self.updates.read();
        Ok(updates
            .iter()
            .filter(|(_, log)| !log.is_empty())
            .map(|((workspace, guid), _)| LoggedDoc {
                workspace: workspace.clone(),
                guid: guid.clone(),
            })
            .collect())
    }
}
