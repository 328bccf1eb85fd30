//! RocksDB-backed durable document store.
//!
//! Column families:
//! - `snapshots` — merged document snapshots (LZ4 compressed), keyed by doc key
//! - `updates`   — raw update log, keyed by `<doc key prefix><seq:8 bytes BE>`
//! - `metadata`  — per-document [`SnapshotMetadata`] (bincode)
//!
//! The doc key prefix is `<len:2 bytes BE><workspace:guid>`, so one
//! document's updates never share a prefix with another's.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use super::{doc_key, DocStore, LoggedDoc, StoreError, StoredUpdate};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_UPDATES: &str = "updates";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_UPDATES, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("doc_pipeline_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Metadata stored alongside each snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Number of times the snapshot was rewritten
    pub snapshot_writes: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last snapshot write (seconds since epoch)
    pub updated_at: u64,
}

impl SnapshotMetadata {
    fn new() -> Self {
        let now = now_secs();
        Self {
            snapshot_size: 0,
            compressed_size: 0,
            snapshot_writes: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

/// RocksDB-backed [`DocStore`].
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Next update sequence number
    sequence: AtomicU64,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let sequence = Self::recover_sequence(&db)?;
        log::debug!(
            "Opened document store at {} (next update seq {sequence})",
            config.path.display()
        );

        Ok(Self {
            db,
            config,
            sequence: AtomicU64::new(sequence),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SNAPSHOTS => {
                // already LZ4-compressed by us
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_UPDATES => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(4);
            }
            CF_METADATA => {
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Highest sequence in the update log + 1.
    ///
    /// Update keys are ordered by document first, so the whole log is scanned.
    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> Result<u64, StoreError> {
        let Some(cf) = db.cf_handle(CF_UPDATES) else {
            return Ok(0);
        };

        let mut next = 0u64;
        for item in db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            if let Some((_, seq)) = split_update_key(&key) {
                next = next.max(seq + 1);
            }
        }
        Ok(next)
    }

    /// Load snapshot metadata, if the document has a snapshot.
    pub fn load_metadata(
        &self,
        workspace: &str,
        guid: &str,
    ) -> Result<Option<SnapshotMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, doc_key(workspace, guid).as_bytes())? {
            Some(bytes) => Ok(Some(SnapshotMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn write_opts(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    /// Visit the raw log entries of one document in sequence order.
    fn scan_updates(
        &self,
        workspace: &str,
        guid: &str,
        mut visit: impl FnMut(u64, Box<[u8]>),
    ) -> Result<(), StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let prefix = update_prefix(workspace, guid);
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));

        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) || key.len() != prefix.len() + 8 {
                break;
            }
            let Some((_, seq)) = split_update_key(&key) else {
                break;
            };
            visit(seq, value);
        }
        Ok(())
    }
}

impl DocStore for RocksStore {
    fn fetch_snapshot(&self, workspace: &str, guid: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(cf, doc_key(workspace, guid).as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    fn fetch_updates(&self, workspace: &str, guid: &str) -> Result<Vec<StoredUpdate>, StoreError> {
        let mut updates = Vec::new();
        self.scan_updates(workspace, guid, |seq, value| {
            updates.push(StoredUpdate {
                seq,
                blob: value.into_vec(),
            });
        })?;
        Ok(updates)
    }

    fn append_update(&self, workspace: &str, guid: &str, update: &[u8]) -> Result<u64, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.db
            .put_cf_opt(cf, update_key(workspace, guid, seq), update, &self.write_opts())?;
        Ok(seq)
    }

    fn write_snapshot(&self, workspace: &str, guid: &str, snapshot: &[u8]) -> Result<(), StoreError> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut meta = self
            .load_metadata(workspace, guid)?
            .unwrap_or_else(SnapshotMetadata::new);
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.snapshot_writes += 1;
        meta.updated_at = now_secs();

        // snapshot + metadata land together
        let key = doc_key(workspace, guid);
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_snapshots, key.as_bytes(), &compressed);
        batch.put_cf(cf_meta, key.as_bytes(), meta.encode()?);
        self.db.write_opt(batch, &self.write_opts())?;

        Ok(())
    }

    fn delete_updates(&self, workspace: &str, guid: &str, seqs: &[u64]) -> Result<u64, StoreError> {
        let cf = self.cf(CF_UPDATES)?;

        let mut batch = WriteBatch::default();
        let mut count = 0u64;
        for seq in seqs {
            let key = update_key(workspace, guid, *seq);
            if self.db.get_pinned_cf(cf, &key)?.is_some() {
                batch.delete_cf(cf, key);
                count += 1;
            }
        }

        if count > 0 {
            self.db.write_opt(batch, &self.write_opts())?;
        }
        Ok(count)
    }

    fn logged_docs(&self) -> Result<Vec<LoggedDoc>, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let mut docs: Vec<LoggedDoc> = Vec::new();

        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let Some((doc, _)) = split_update_key(&key) else {
                continue;
            };
            let Some((workspace, guid)) = doc.split_once(':') else {
                continue;
            };
            let already = docs
                .last()
                .is_some_and(|last| last.workspace == workspace && last.guid == guid);
            if !already {
                docs.push(LoggedDoc {
                    workspace: workspace.to_string(),
                    guid: guid.to_string(),
                });
            }
        }

        Ok(docs)
    }
}

/// `<len:2 BE><workspace:guid>`
fn update_prefix(workspace: &str, guid: &str) -> Vec<u8> {
    let doc = doc_key(workspace, guid);
    let mut prefix = Vec::with_capacity(2 + doc.len() + 8);
    prefix.extend_from_slice(&(doc.len() as u16).to_be_bytes());
    prefix.extend_from_slice(doc.as_bytes());
    prefix
}

fn update_key(workspace: &str, guid: &str, seq: u64) -> Vec<u8> {
    let mut key = update_prefix(workspace, guid);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

/// Inverse of [`update_key`]: `(doc key, seq)`.
fn split_update_key(key: &[u8]) -> Option<(&str, u64)> {
    let len = u16::from_be_bytes(key.get(..2)?.try_into().ok()?) as usize;
    let doc = std::str::from_utf8(key.get(2..2 + len)?).ok()?;
    let seq_bytes: [u8; 8] = key.get(2 + len..)?.try_into().ok()?;
    Some((doc, u64::from_be_bytes(seq_bytes)))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, RocksStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    #[test]
    fn test_store_open() {
        let (_dir, store) = open_temp();
        assert!(store.path().exists());
        assert!(store.logged_docs().unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_roundtrip_and_metadata() {
        let (_dir, store) = open_temp();
        assert!(store.fetch_snapshot("ws", "page").unwrap().is_none());
        assert!(store.load_metadata("ws", "page").unwrap().is_none());

        let data = vec![7u8; 10_000];
        store.write_snapshot("ws", "page", &data).unwrap();
        store.write_snapshot("ws", "page", &data).unwrap();

        assert_eq!(store.fetch_snapshot("ws", "page").unwrap().unwrap(), data);
        let meta = store.load_metadata("ws", "page").unwrap().unwrap();
        assert_eq!(meta.snapshot_size, 10_000);
        assert!(meta.compressed_size < meta.snapshot_size);
        assert_eq!(meta.snapshot_writes, 2);
        assert!(meta.updated_at >= meta.created_at);
    }

    #[test]
    fn test_update_log_isolated_per_doc() {
        let (_dir, store) = open_temp();
        store.append_update("ws", "a", b"a1").unwrap();
        store.append_update("ws", "ab", b"ab1").unwrap();
        store.append_update("ws", "a", b"a2").unwrap();

        let a = store.fetch_updates("ws", "a").unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(a[0].blob, b"a1");
        assert_eq!(a[1].blob, b"a2");
        assert!(a[0].seq < a[1].seq);

        let ab = store.fetch_updates("ws", "ab").unwrap();
        assert_eq!(ab.len(), 1);

        let docs = store.logged_docs().unwrap();
        assert_eq!(docs.len(), 2);
    }

    #[test]
    fn test_delete_exact_updates() {
        let (_dir, store) = open_temp();
        let s1 = store.append_update("ws", "a", b"1").unwrap();
        let s2 = store.append_update("ws", "a", b"2").unwrap();
        let s3 = store.append_update("ws", "a", b"3").unwrap();

        assert_eq!(store.delete_updates("ws", "a", &[s1, s3]).unwrap(), 2);
        let rest = store.fetch_updates("ws", "a").unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].seq, s2);

        // already gone
        assert_eq!(store.delete_updates("ws", "a", &[s1]).unwrap(), 0);
    }

    #[test]
    fn test_sequence_recovery_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path().join("db"));

        let last = {
            let store = RocksStore::open(config.clone()).unwrap();
            store.append_update("ws", "b", b"x").unwrap();
            store.append_update("ws", "a", b"y").unwrap()
        };

        let store = RocksStore::open(config).unwrap();
        let next = store.append_update("ws", "a", b"z").unwrap();
        assert_eq!(next, last + 1);
        assert_eq!(store.fetch_updates("ws", "a").unwrap().len(), 2);
    }

    #[test]
    fn test_split_update_key() {
        let key = update_key("ws", "page", 42);
        assert_eq!(split_update_key(&key), Some(("ws:page", 42)));
        assert_eq!(split_update_key(&[0, 9, b'x']), None);
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Database("boom".into());
        assert!(err.to_string().contains("Database error"));
    }
}
