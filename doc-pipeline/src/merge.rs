//! CRDT merge primitive.
//!
//! Consolidation treats updates as opaque bytes; only the merger interprets
//! them. [`YrsMerger`] applies every fragment into a fresh Yrs document and
//! re-encodes the full state, so the result is independent of input order.

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::{Doc, Options, ReadTxn, StateVector, Transact, Update};

/// Merge failures.
#[derive(Debug, Clone, Error)]
pub enum MergeError {
    #[error("Nothing to merge for doc {0}")]
    Empty(String),
    #[error("Failed to decode update #{index} for doc {guid}: {reason}")]
    Decode {
        guid: String,
        index: usize,
        reason: String,
    },
    #[error("Failed to apply update #{index} for doc {guid}: {reason}")]
    Apply {
        guid: String,
        index: usize,
        reason: String,
    },
}

/// Combines update fragments (optionally led by a snapshot) into one update.
pub trait UpdateMerger: Send + Sync {
    fn merge(&self, guid: &str, updates: &[&[u8]]) -> Result<Vec<u8>, MergeError>;
}

/// Yrs-backed merger (v1 update encoding).
#[derive(Debug, Clone, Copy, Default)]
pub struct YrsMerger;

impl UpdateMerger for YrsMerger {
    fn merge(&self, guid: &str, updates: &[&[u8]]) -> Result<Vec<u8>, MergeError> {
        if updates.is_empty() {
            return Err(MergeError::Empty(guid.to_string()));
        }

        let doc = Doc::with_options(Options {
            guid: guid.into(),
            ..Options::default()
        });

        {
            let mut txn = doc.transact_mut();
            for (index, bytes) in updates.iter().enumerate() {
                let update = Update::decode_v1(bytes).map_err(|e| MergeError::Decode {
                    guid: guid.to_string(),
                    index,
                    reason: e.to_string(),
                })?;
                txn.apply_update(update).map_err(|e| MergeError::Apply {
                    guid: guid.to_string(),
                    index,
                    reason: e.to_string(),
                })?;
            }
        }

        let txn = doc.transact();
        Ok(txn.encode_state_as_update_v1(&StateVector::default()))
    }
}

/// Byte-concatenating merger, so unit tests can assert on merge inputs.
#[cfg(test)]
pub(crate) struct ConcatMerger;

#[cfg(test)]
impl UpdateMerger for ConcatMerger {
    fn merge(&self, guid: &str, updates: &[&[u8]]) -> Result<Vec<u8>, MergeError> {
        if updates.is_empty() {
            return Err(MergeError::Empty(guid.to_string()));
        }
        Ok(updates.concat())
    }
}
