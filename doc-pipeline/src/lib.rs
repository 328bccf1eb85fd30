//! # doc-pipeline — Buffered CRDT update pipeline
//!
//! Ingests binary CRDT updates for collaborative documents through a fast
//! shared buffer and folds them into durable per-document snapshots.
//!
//! ## Architecture
//!
//! ```text
//!  push(ws, guid, update)
//!         │
//!         ▼
//! ┌────────────────────┐  atomic SADD+RPUSH  ┌──────────────────┐
//! │ BufferedDocManager │ ──────────────────► │ UpdateBuffer     │
//! │                    │ ◄── SPOP / LRANGE ─ │ (shared, fast)   │
//! └─────────┬──────────┘                     └──────────────────┘
//!           │ fallback + safety net
//!           ▼
//! ┌────────────────────┐                     ┌──────────────────┐
//! │ DurableDocManager  │ ──────────────────► │ DocStore         │
//! │ (UpdateMerger)     │                     │ (RocksDB)        │
//! └────────────────────┘                     └──────────────────┘
//!           ▲
//!           │ apply() every interval
//! ┌─────────┴──────────┐
//! │ConsolidationWorker │
//! └────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`doc_id`] — Document address parsing (`workspace[:variant:guid]`)
//! - [`buffer`] — Buffer command set and in-memory backend
//! - [`storage`] — Snapshot/update-log stores (RocksDB, in-memory)
//! - [`merge`] — CRDT merge primitive over Yrs
//! - [`manager`] — Durable and buffered document managers
//! - [`worker`] — Periodic consolidation task

pub mod buffer;
pub mod config;
pub mod doc_id;
pub mod manager;
pub mod merge;
pub mod stats;
pub mod storage;
pub mod worker;

// Re-exports for convenience
pub use buffer::{BufferError, BufferKeys, MemoryBuffer, UpdateBuffer};
pub use config::PipelineConfig;
pub use doc_id::{DocId, DocIdError, DocVariant};
pub use manager::{
    ApplyOutcome, ApplyReport, BufferedDocManager, DurableDocManager, ManagerError,
};
pub use merge::{MergeError, UpdateMerger, YrsMerger};
pub use stats::{ManagerStats, StatsSnapshot};
pub use storage::{
    doc_key, DocStore, LoggedDoc, MemoryStore, RocksStore, SnapshotMetadata, StoreConfig,
    StoreError, StoredUpdate,
};
pub use worker::{ConsolidationWorker, WorkerHandle};
