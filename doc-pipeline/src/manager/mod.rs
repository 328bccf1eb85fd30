//! Document update managers.
//!
//! ```text
//!   push / get_updates / apply
//!              │
//!              ▼
//!   ┌─────────────────────┐  buffer failure   ┌────────────────────┐
//!   │ BufferedDocManager  │ ────────────────► │ DurableDocManager  │
//!   │ (UpdateBuffer)      │ ── safety net ──► │ (DocStore)         │
//!   └─────────────────────┘                   └────────────────────┘
//! ```
//!
//! The buffered manager composes the durable one and calls through to it
//! on every fallback path.

pub mod buffered;
pub mod durable;

pub use buffered::{ApplyOutcome, ApplyReport, BufferedDocManager};
pub use durable::DurableDocManager;

use thiserror::Error;

use crate::merge::MergeError;
use crate::storage::StoreError;

/// Errors surfaced by the managers. Buffer errors never appear here.
#[derive(Debug, Clone, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error("Invalid workspace id: {0:?}")]
    InvalidWorkspace(String),
    #[error("Blocking store task failed: {0}")]
    Task(String),
}

/// Doc keys are `workspace:guid` split on the first `:`, so a workspace id
/// must be non-empty and free of `:`.
pub(crate) fn check_workspace(workspace: &str) -> Result<(), ManagerError> {
    if workspace.is_empty() || workspace.contains(':') {
        return Err(ManagerError::InvalidWorkspace(workspace.to_string()));
    }
    Ok(())
}
