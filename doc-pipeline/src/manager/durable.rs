//! Store-backed document manager.
//!
//! Every push is a synchronous durable write; every `apply` pass scans the
//! raw update log and folds it into snapshots. Always correct, never fast.
//! The buffered manager falls back to it whenever the buffer misbehaves.

use std::sync::Arc;
use std::time::Instant;

use super::{check_workspace, ManagerError};
use crate::merge::{UpdateMerger, YrsMerger};
use crate::storage::{DocStore, LoggedDoc};

/// Durable push/fetch/merge over a [`DocStore`].
pub struct DurableDocManager {
    store: Arc<dyn DocStore>,
    merger: Arc<dyn UpdateMerger>,
}

impl DurableDocManager {
    /// Manager using the Yrs merge primitive.
    pub fn new(store: Arc<dyn DocStore>) -> Self {
        Self::with_merger(store, Arc::new(YrsMerger))
    }

    pub fn with_merger(store: Arc<dyn DocStore>, merger: Arc<dyn UpdateMerger>) -> Self {
        Self { store, merger }
    }

    pub fn store(&self) -> &Arc<dyn DocStore> {
        &self.store
    }

    /// Durably log a raw update. Returns its sequence number.
    pub fn push(&self, workspace: &str, guid: &str, update: &[u8]) -> Result<u64, ManagerError> {
        check_workspace(workspace)?;
        let seq = self.store.append_update(workspace, guid, update)?;
        log::trace!("logged update #{seq} for workspace: {workspace}, guid: {guid}");
        Ok(seq)
    }

    /// All raw updates currently logged for a document.
    pub fn get_updates(&self, workspace: &str, guid: &str) -> Result<Vec<Vec<u8>>, ManagerError> {
        Ok(self
            .store
            .fetch_updates(workspace, guid)?
            .into_iter()
            .map(|u| u.blob)
            .collect())
    }

    pub fn get_snapshot(&self, workspace: &str, guid: &str) -> Result<Option<Vec<u8>>, ManagerError> {
        Ok(self.store.fetch_snapshot(workspace, guid)?)
    }

    /// Overwrite the snapshot of a document.
    pub fn upsert(&self, workspace: &str, guid: &str, snapshot: &[u8]) -> Result<(), ManagerError> {
        Ok(self.store.write_snapshot(workspace, guid, snapshot)?)
    }

    pub fn merge_updates(&self, guid: &str, updates: &[&[u8]]) -> Result<Vec<u8>, ManagerError> {
        Ok(self.merger.merge(guid, updates)?)
    }

    /// Current state of a document: snapshot and logged updates merged,
    /// without writing anything. `None` for a document never seen.
    pub fn get_latest(&self, workspace: &str, guid: &str) -> Result<Option<Vec<u8>>, ManagerError> {
        let updates = self.get_updates(workspace, guid)?;
        let snapshot = self.get_snapshot(workspace, guid)?;
        merge_with_snapshot(self, guid, snapshot, &updates)
    }

    /// Documents with logged updates waiting to be merged.
    pub fn logged_docs(&self) -> Result<Vec<LoggedDoc>, ManagerError> {
        Ok(self.store.logged_docs()?)
    }

    /// Fold every document's logged updates into its snapshot.
    ///
    /// Only the consumed log entries are deleted, so updates logged while a
    /// document is being merged wait for the next pass. A failing document
    /// does not stop the others; the last failure is returned once all
    /// documents were attempted. Returns the number of documents merged.
    ///
    /// Takes no lock. When a [`BufferedDocManager`](super::BufferedDocManager)
    /// writes the same snapshots, use its `apply`, which runs
    /// [`apply_doc`](Self::apply_doc) under each document's buffer lock.
    pub fn apply(&self) -> Result<usize, ManagerError> {
        let docs = self.store.logged_docs()?;
        let mut merged = 0;
        let mut failure = None;

        for doc in &docs {
            match self.apply_doc(&doc.workspace, &doc.guid) {
                Ok(true) => merged += 1,
                Ok(false) => {}
                Err(e) => {
                    log::error!(
                        "Failed to merge logged updates for workspace: {}, guid: {}: {e}",
                        doc.workspace,
                        doc.guid
                    );
                    failure = Some(e);
                }
            }
        }

        if merged > 0 {
            log::debug!("durable pass merged {merged}/{} documents", docs.len());
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(merged),
        }
    }

    /// Fold one document's logged updates into its snapshot. Returns
    /// whether anything was logged.
    pub fn apply_doc(&self, workspace: &str, guid: &str) -> Result<bool, ManagerError> {
        let logged = self.store.fetch_updates(workspace, guid)?;
        if logged.is_empty() {
            return Ok(false);
        }

        let started = Instant::now();
        let snapshot = self.store.fetch_snapshot(workspace, guid)?;
        let blobs: Vec<&[u8]> = snapshot
            .iter()
            .map(Vec::as_slice)
            .chain(logged.iter().map(|u| u.blob.as_slice()))
            .collect();
        let merged = self.merger.merge(guid, &blobs)?;
        self.store.write_snapshot(workspace, guid, &merged)?;

        let seqs: Vec<u64> = logged.iter().map(|u| u.seq).collect();
        self.store.delete_updates(workspace, guid, &seqs)?;

        log::trace!(
            "merged {} logged updates for workspace: {workspace}, guid: {guid} in {:?}",
            logged.len(),
            started.elapsed()
        );
        Ok(true)
    }
}

/// Merge an optional snapshot with `updates`; `None` when both are empty.
pub(crate) fn merge_with_snapshot(
    manager: &DurableDocManager,
    guid: &str,
    snapshot: Option<Vec<u8>>,
    updates: &[Vec<u8>],
) -> Result<Option<Vec<u8>>, ManagerError> {
    if updates.is_empty() {
        return Ok(snapshot);
    }
    let blobs: Vec<&[u8]> = snapshot
        .iter()
        .map(Vec::as_slice)
        .chain(updates.iter().map(Vec::as_slice))
        .collect();
    manager.merge_updates(guid, &blobs).map(Some)
}
