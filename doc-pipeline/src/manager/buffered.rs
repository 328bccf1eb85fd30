//! Buffer-backed document manager.
//!
//! Pushes land in the shared buffer (one atomic append + pending mark) and
//! are folded into durable snapshots one document per `apply` pass:
//!
//! ```text
//! apply():
//!   1. durable safety net, each logged doc under its lock
//!   2. SPOP pending            ── empty ──► Idle
//!   3. SET lock NX EX ttl      ── held ───► SADD pending, Contended
//!   4. LRANGE updates          ── empty ──► Empty
//!      snapshot + updates ──► merge ──► upsert
//!   5. LTRIM drained count
//!   6. failure in 4-5          ──────────► SADD pending, Failed
//!   7. DEL lock (always)
//! ```
//!
//! Buffer errors never leave this module: pushes fall back to the durable
//! manager, reads degrade to partial results, and consolidation re-queues.

use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use super::durable::{merge_with_snapshot, DurableDocManager};
use super::{check_workspace, ManagerError};
use crate::buffer::{BufferKeys, UpdateBuffer};
use crate::config::PipelineConfig;
use crate::stats::ManagerStats;
use crate::storage::doc_key;

/// Lock value; only its presence matters.
const LOCK_SENTINEL: &[u8] = b"1";

/// What the buffered step of an `apply` pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Nothing pending.
    Idle,
    /// Another pass holds the document's lock; the key was re-queued.
    Contended(String),
    /// Lock acquired but no buffered updates were found.
    Empty(String),
    /// A new snapshot was written from `updates` buffered fragments.
    Consolidated { key: String, updates: usize },
    /// Drain, merge or snapshot write failed; the key was re-queued.
    Failed(String),
    /// Pending member is not a `workspace:guid` key and was dropped.
    Malformed(String),
}

/// Result of one [`BufferedDocManager::apply`] pass.
#[derive(Debug)]
pub struct ApplyReport {
    /// The durable manager's own pass: documents merged, or its error.
    pub safety_net: Result<usize, ManagerError>,
    pub outcome: ApplyOutcome,
}

/// Document manager with a shared buffer in front of the durable store.
pub struct BufferedDocManager {
    durable: Arc<DurableDocManager>,
    buffer: Arc<dyn UpdateBuffer>,
    keys: BufferKeys,
    config: PipelineConfig,
    stats: Arc<ManagerStats>,
}

impl BufferedDocManager {
    pub fn new(
        durable: Arc<DurableDocManager>,
        buffer: Arc<dyn UpdateBuffer>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            durable,
            buffer,
            keys: config.buffer_keys(),
            config,
            stats: Arc::new(ManagerStats::new()),
        }
    }

    pub fn durable(&self) -> &Arc<DurableDocManager> {
        &self.durable
    }

    pub fn keys(&self) -> &BufferKeys {
        &self.keys
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<ManagerStats> {
        &self.stats
    }

    /// Buffer an update, or log it durably if the buffer fails.
    ///
    /// Only an invalid workspace id or a durable-store failure on the
    /// fallback path is an error.
    pub async fn push(&self, workspace: &str, guid: &str, update: &[u8]) -> Result<(), ManagerError> {
        check_workspace(workspace)?;
        let key = doc_key(workspace, guid);

        match self
            .buffer
            .push_update(self.keys.pending(), &self.keys.updates(&key), &key, update)
            .await
        {
            Ok(()) => {
                self.stats.record_buffered_push();
                log::trace!("pushed update for workspace: {workspace}, guid: {guid}");
                Ok(())
            }
            Err(e) => {
                log::warn!(
                    "Buffer push failed for workspace: {workspace}, guid: {guid}, falling back to store: {e}"
                );
                let (ws, id, update) = (workspace.to_string(), guid.to_string(), update.to_vec());
                self.blocking(move |durable| durable.push(&ws, &id, &update))
                    .await?;
                self.stats.record_fallback_push();
                Ok(())
            }
        }
    }

    /// Raw updates of a document not yet merged into its snapshot.
    ///
    /// Best effort: store-logged updates followed by buffered ones, with
    /// either source silently missing if it could not be read. An empty
    /// result does not prove the document has no pending updates.
    pub async fn get_updates(&self, workspace: &str, guid: &str) -> Vec<Vec<u8>> {
        let key = doc_key(workspace, guid);

        let (ws, id) = (workspace.to_string(), guid.to_string());
        let mut updates = match self.blocking(move |durable| durable.get_updates(&ws, &id)).await {
            Ok(updates) => updates,
            Err(e) => {
                log::warn!("Failed to read logged updates for {key}: {e}");
                Vec::new()
            }
        };

        match self.buffer.list_range(&self.keys.updates(&key)).await {
            Ok(buffered) => updates.extend(buffered),
            Err(e) => log::warn!("Failed to read buffered updates for {key}: {e}"),
        }

        updates
    }

    /// Current document state: snapshot merged with every reachable update.
    /// Read-only; `None` for a document with no snapshot and no updates.
    pub async fn get_latest(&self, workspace: &str, guid: &str) -> Result<Option<Vec<u8>>, ManagerError> {
        let updates = self.get_updates(workspace, guid).await;
        let (ws, id) = (workspace.to_string(), guid.to_string());
        self.blocking(move |durable| {
            let snapshot = durable.get_snapshot(&ws, &id)?;
            merge_with_snapshot(durable, &id, snapshot, &updates)
        })
        .await
    }

    /// One consolidation pass: the durable safety net, then at most one
    /// pending document. Safe to run concurrently from several processes
    /// sharing the buffer and the store.
    pub async fn apply(&self) -> ApplyReport {
        let safety_net = self.safety_net().await;
        if let Err(e) = &safety_net {
            self.stats.record_safety_net_failure();
            log::error!("Durable consolidation pass failed: {e}");
        }

        let outcome = self.apply_pending().await;
        ApplyReport { safety_net, outcome }
    }

    /// Merge updates that took the slow path, one document at a time under
    /// the same lock buffered consolidation takes, so the two never write
    /// one snapshot concurrently. Documents locked elsewhere wait for a later
    /// pass. While the buffer is unreachable no lock can be taken and
    /// documents are merged without one.
    async fn safety_net(&self) -> Result<usize, ManagerError> {
        let docs = self.blocking(|durable| durable.logged_docs()).await?;
        let mut merged = 0;
        let mut failure = None;

        for doc in docs {
            let key = doc_key(&doc.workspace, &doc.guid);
            let lock_key = self.keys.lock(&key);

            let locked = match self
                .buffer
                .set_if_absent(&lock_key, LOCK_SENTINEL, self.config.lock_ttl())
                .await
            {
                Ok(true) => true,
                Ok(false) => {
                    log::trace!("logged updates of {key} wait, doc is being consolidated");
                    continue;
                }
                Err(e) => {
                    log::debug!("Merging logged updates of {key} without lock: {e}");
                    false
                }
            };

            let result = self
                .blocking(move |durable| durable.apply_doc(&doc.workspace, &doc.guid))
                .await;
            if locked {
                self.release(&lock_key).await;
            }

            match result {
                Ok(true) => merged += 1,
                Ok(false) => {}
                Err(e) => {
                    log::error!("Failed to merge logged updates for {key}: {e}");
                    failure = Some(e);
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(merged),
        }
    }

    async fn apply_pending(&self) -> ApplyOutcome {
        let pending = match self.buffer.set_pop(self.keys.pending()).await {
            Ok(Some(key)) => key,
            Ok(None) => return ApplyOutcome::Idle,
            Err(e) => {
                log::debug!("Failed to pop pending doc: {e}");
                return ApplyOutcome::Idle;
            }
        };

        let Some((workspace, guid)) = pending.split_once(':') else {
            log::warn!("Dropping malformed pending doc key: {pending}");
            return ApplyOutcome::Malformed(pending);
        };

        let lock_key = self.keys.lock(&pending);
        let acquired = self
            .buffer
            .set_if_absent(&lock_key, LOCK_SENTINEL, self.config.lock_ttl())
            .await
            .unwrap_or_else(|e| {
                log::debug!("Failed to acquire lock for {pending}: {e}");
                false
            });

        if !acquired {
            self.stats.record_lock_contention();
            self.requeue(&pending).await;
            return ApplyOutcome::Contended(pending);
        }

        let outcome = match self.consolidate(workspace, guid, &pending).await {
            Ok(0) => {
                self.stats.record_empty_drain();
                ApplyOutcome::Empty(pending.clone())
            }
            Ok(updates) => ApplyOutcome::Consolidated {
                key: pending.clone(),
                updates,
            },
            Err(e) => {
                self.stats.record_consolidation_failure();
                log::error!("Failed to merge updates with snapshot for {pending}: {e}");
                self.requeue(&pending).await;
                ApplyOutcome::Failed(pending.clone())
            }
        };

        self.release(&lock_key).await;
        outcome
    }

    /// Steps 4-5 under the lock. Returns the number of drained fragments.
    async fn consolidate(&self, workspace: &str, guid: &str, key: &str) -> Result<usize, ConsolidateError> {
        let updates_key = self.keys.updates(key);
        let updates = self
            .buffer
            .list_range(&updates_key)
            .await
            .map_err(|e| ConsolidateError::Drain(e.to_string()))?;

        if updates.is_empty() {
            return Ok(0);
        }

        let drained = updates.len();
        log::debug!("applying {drained} updates for workspace: {workspace}, guid: {guid}");

        let started = Instant::now();
        let (ws, id) = (workspace.to_string(), guid.to_string());
        self.blocking(move |durable| {
            let snapshot = durable.get_snapshot(&ws, &id)?;
            let blobs: Vec<&[u8]> = snapshot
                .iter()
                .map(Vec::as_slice)
                .chain(updates.iter().map(Vec::as_slice))
                .collect();
            let merged = durable.merge_updates(&id, &blobs)?;
            durable.upsert(&ws, &id, &merged)
        })
        .await?;
        self.stats.record_consolidation(drained, started.elapsed());

        // The snapshot already holds these fragments; a failed trim only
        // means they get merged again, which is harmless.
        if let Err(e) = self.buffer.list_trim_front(&updates_key, drained).await {
            log::error!("Failed to remove merged updates from buffer for {key}: {e}");
        }

        Ok(drained)
    }

    /// Store I/O and merging run on the blocking pool, off the async workers.
    async fn blocking<T, F>(&self, work: F) -> Result<T, ManagerError>
    where
        F: FnOnce(&DurableDocManager) -> Result<T, ManagerError> + Send + 'static,
        T: Send + 'static,
    {
        let durable = self.durable.clone();
        tokio::task::spawn_blocking(move || work(&durable))
            .await
            .map_err(|e| ManagerError::Task(e.to_string()))?
    }

    async fn release(&self, lock_key: &str) {
        if let Err(e) = self.buffer.delete(lock_key).await {
            log::warn!("Failed to release lock {lock_key}, it expires on its own: {e}");
        }
    }

    async fn requeue(&self, key: &str) {
        if let Err(e) = self.buffer.set_add(self.keys.pending(), key).await {
            log::warn!("Failed to re-queue pending doc {key}: {e}");
        }
    }
}

#[derive(Debug, Error)]
enum ConsolidateError {
    #[error("failed to drain buffered updates: {0}")]
    Drain(String),
    #[error(transparent)]
    Manager(#[from] ManagerError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MemoryBuffer;
    use crate::merge::{ConcatMerger, MergeError, UpdateMerger};
    use crate::storage::{DocStore, MemoryStore};
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        buffer: Arc<MemoryBuffer>,
        manager: BufferedDocManager,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let buffer = Arc::new(MemoryBuffer::new());
        let durable = Arc::new(DurableDocManager::with_merger(
            store.clone(),
            Arc::new(ConcatMerger),
        ));
        let manager =
            BufferedDocManager::new(durable, buffer.clone(), PipelineConfig::for_testing());
        Fixture {
            store,
            buffer,
            manager,
        }
    }

    #[tokio::test]
    async fn test_push_buffers_and_marks_pending() {
        let f = fixture();
        f.manager.push("ws", "a", b"1").await.unwrap();
        f.manager.push("ws", "a", b"2").await.unwrap();

        assert_eq!(f.buffer.set_members("test_pending:").await, vec!["ws:a".to_string()]);
        assert_eq!(
            f.buffer.list_range("test_u:ws:a").await.unwrap(),
            vec![b"1".to_vec(), b"2".to_vec()]
        );
        assert_eq!(f.store.logged_update_count(), 0);
        assert_eq!(f.manager.stats().snapshot().buffered_pushes, 2);
    }

    #[tokio::test]
    async fn test_push_falls_back_to_store() {
        let f = fixture();
        f.buffer.set_available(false);
        f.manager.push("ws", "a", b"1").await.unwrap();

        assert_eq!(f.store.logged_update_count(), 1);
        assert_eq!(f.manager.stats().snapshot().fallback_pushes, 1);
    }

    #[tokio::test]
    async fn test_push_fails_only_when_both_fail() {
        let f = fixture();
        f.buffer.set_available(false);
        f.store.set_available(false);
        assert!(f.manager.push("ws", "a", b"1").await.is_err());
    }

    #[tokio::test]
    async fn test_get_updates_union() {
        let f = fixture();
        f.buffer.set_available(false);
        f.manager.push("ws", "a", b"d").await.unwrap();
        f.buffer.set_available(true);
        f.manager.push("ws", "a", b"b").await.unwrap();

        assert_eq!(
            f.manager.get_updates("ws", "a").await,
            vec![b"d".to_vec(), b"b".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_get_updates_tolerates_failures() {
        let f = fixture();
        f.manager.push("ws", "a", b"b").await.unwrap();

        f.store.set_available(false);
        assert_eq!(f.manager.get_updates("ws", "a").await, vec![b"b".to_vec()]);

        f.buffer.set_available(false);
        assert!(f.manager.get_updates("ws", "a").await.is_empty());
    }

    #[tokio::test]
    async fn test_apply_consolidates_one_doc() {
        let f = fixture();
        f.manager.durable().upsert("ws", "a", b"S").unwrap();
        f.manager.push("ws", "a", b"1").await.unwrap();
        f.manager.push("ws", "a", b"2").await.unwrap();

        let report = f.manager.apply().await;
        assert_eq!(report.safety_net.unwrap(), 0);
        assert_eq!(
            report.outcome,
            ApplyOutcome::Consolidated {
                key: "ws:a".into(),
                updates: 2
            }
        );

        assert_eq!(f.store.fetch_snapshot("ws", "a").unwrap().unwrap(), b"S12");
        assert!(f.buffer.list_range("test_u:ws:a").await.unwrap().is_empty());
        assert!(f.buffer.set_members("test_pending:").await.is_empty());
        assert!(!f.buffer.exists("test_l:ws:a").await);

        assert_eq!(f.manager.apply().await.outcome, ApplyOutcome::Idle);
    }

    #[tokio::test]
    async fn test_apply_contended_requeues() {
        let f = fixture();
        f.manager.push("ws", "a", b"1").await.unwrap();
        f.buffer
            .set_if_absent("test_l:ws:a", b"1", Duration::from_secs(600))
            .await
            .unwrap();

        let report = f.manager.apply().await;
        assert_eq!(report.outcome, ApplyOutcome::Contended("ws:a".into()));
        assert_eq!(f.buffer.set_members("test_pending:").await, vec!["ws:a".to_string()]);
        assert_eq!(f.buffer.list_range("test_u:ws:a").await.unwrap().len(), 1);
        // the other holder's lock is untouched
        assert!(f.buffer.exists("test_l:ws:a").await);
        assert_eq!(f.manager.stats().snapshot().lock_contentions, 1);
    }

    #[tokio::test]
    async fn test_apply_empty_drain_releases_lock() {
        let f = fixture();
        f.buffer.set_add("test_pending:", "ws:a").await.unwrap();

        assert_eq!(f.manager.apply().await.outcome, ApplyOutcome::Empty("ws:a".into()));
        assert!(!f.buffer.exists("test_l:ws:a").await);
        assert!(f.buffer.set_members("test_pending:").await.is_empty());
    }

    #[tokio::test]
    async fn test_apply_failure_keeps_fragments() {
        let f = fixture();
        f.manager.push("ws", "a", b"1").await.unwrap();

        f.store.set_available(false);
        let report = f.manager.apply().await;
        assert!(report.safety_net.is_err());
        assert_eq!(report.outcome, ApplyOutcome::Failed("ws:a".into()));
        assert_eq!(f.buffer.list_range("test_u:ws:a").await.unwrap().len(), 1);
        assert_eq!(f.buffer.set_members("test_pending:").await, vec!["ws:a".to_string()]);
        assert!(!f.buffer.exists("test_l:ws:a").await);

        f.store.set_available(true);
        let report = f.manager.apply().await;
        assert!(matches!(report.outcome, ApplyOutcome::Consolidated { updates: 1, .. }));
        assert_eq!(f.store.fetch_snapshot("ws", "a").unwrap().unwrap(), b"1");
    }

    #[tokio::test]
    async fn test_apply_drops_malformed_key() {
        let f = fixture();
        f.buffer.set_add("test_pending:", "no-separator").await.unwrap();
        assert_eq!(
            f.manager.apply().await.outcome,
            ApplyOutcome::Malformed("no-separator".into())
        );
        assert!(f.buffer.set_members("test_pending:").await.is_empty());
    }

    #[tokio::test]
    async fn test_apply_runs_safety_net_first() {
        let f = fixture();
        f.buffer.set_available(false);
        f.manager.push("ws", "a", b"1").await.unwrap();

        let report = f.manager.apply().await;
        assert_eq!(report.safety_net.unwrap(), 1);
        // buffer still down: nothing to pop
        assert_eq!(report.outcome, ApplyOutcome::Idle);
        assert_eq!(f.store.fetch_snapshot("ws", "a").unwrap().unwrap(), b"1");
    }

    #[tokio::test]
    async fn test_get_latest() {
        let f = fixture();
        assert!(f.manager.get_latest("ws", "a").await.unwrap().is_none());

        f.manager.push("ws", "a", b"1").await.unwrap();
        f.manager.apply().await;
        f.manager.push("ws", "a", b"2").await.unwrap();

        assert_eq!(f.manager.get_latest("ws", "a").await.unwrap().unwrap(), b"12");
    }

    #[tokio::test]
    async fn test_push_rejects_ambiguous_workspace() {
        let f = fixture();
        assert!(matches!(
            f.manager.push("a:b", "c", b"1").await,
            Err(ManagerError::InvalidWorkspace(_))
        ));
        assert!(f.manager.push("", "c", b"1").await.is_err());

        assert!(f.buffer.set_members("test_pending:").await.is_empty());
        assert_eq!(f.store.logged_update_count(), 0);
        assert_eq!(f.manager.stats().snapshot().buffered_pushes, 0);
    }

    #[tokio::test]
    async fn test_safety_net_skips_locked_doc() {
        let f = fixture();
        f.manager.durable().push("ws", "a", b"1").unwrap();
        f.manager.durable().push("ws", "b", b"2").unwrap();
        // a buffered pass elsewhere is consolidating ws:a
        f.buffer
            .set_if_absent("test_l:ws:a", b"1", Duration::from_secs(600))
            .await
            .unwrap();

        let report = f.manager.apply().await;
        assert_eq!(report.safety_net.unwrap(), 1);
        assert!(f.store.fetch_snapshot("ws", "a").unwrap().is_none());
        assert_eq!(f.store.fetch_snapshot("ws", "b").unwrap().unwrap(), b"2");
        // the other holder's lock is untouched, ours released
        assert!(f.buffer.exists("test_l:ws:a").await);
        assert!(!f.buffer.exists("test_l:ws:b").await);

        f.buffer.delete("test_l:ws:a").await.unwrap();
        assert_eq!(f.manager.apply().await.safety_net.unwrap(), 1);
        assert_eq!(f.store.fetch_snapshot("ws", "a").unwrap().unwrap(), b"1");
        assert_eq!(f.store.logged_update_count(), 0);
    }

    /// Records the thread every merge runs on.
    #[derive(Default)]
    struct ThreadRecorder(parking_lot::Mutex<Vec<std::thread::ThreadId>>);

    impl UpdateMerger for ThreadRecorder {
        fn merge(&self, guid: &str, updates: &[&[u8]]) -> Result<Vec<u8>, MergeError> {
            self.0.lock().push(std::thread::current().id());
            ConcatMerger.merge(guid, updates)
        }
    }

    #[tokio::test]
    async fn test_merges_run_off_the_async_thread() {
        let recorder = Arc::new(ThreadRecorder::default());
        let durable = Arc::new(DurableDocManager::with_merger(
            Arc::new(MemoryStore::new()),
            recorder.clone(),
        ));
        let buffer = Arc::new(MemoryBuffer::new());
        let manager = BufferedDocManager::new(durable, buffer.clone(), PipelineConfig::for_testing());

        manager.push("ws", "a", b"1").await.unwrap();
        buffer.set_available(false);
        manager.push("ws", "b", b"2").await.unwrap();
        buffer.set_available(true);

        manager.apply().await;
        manager.get_latest("ws", "a").await.unwrap();

        let threads = recorder.0.lock().clone();
        assert_eq!(threads.len(), 2);
        let runtime_thread = std::thread::current().id();
        assert!(threads.iter().all(|id| *id != runtime_thread));
    }
}
