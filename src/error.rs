//! # Error Taxonomy
//!
//! pmkv follows a two-layer error model:
//!
//! | Layer | Type | Purpose |
//! |-------|------|---------|
//! | Transport | `eyre::Report` | Every fallible function returns `eyre::Result`, with `wrap_err` context on I/O paths |
//! | Typed | [`PmemError`] | Conditions a caller is expected to branch on |
//!
//! Typed errors are raised with `bail!(PmemError::...)` and travel inside the
//! report. Callers that need to react (for example, evict and retry after an
//! allocation failure) recover them with [`PmemError::of`]:
//!
//! ```ignore
//! match store.insert(key, value) {
//!     Err(e) if matches!(PmemError::of(&e), Some(PmemError::Allocation { .. })) => {
//!         store.evict()?;
//!     }
//!     other => other?,
//! }
//! ```
//!
//! ## Recoverability
//!
//! | Variant | Meaning | Caller response |
//! |---------|---------|-----------------|
//! | `Allocation` | Persistent capacity exhausted | Reject the write or evict first |
//! | `NoVictimAvailable` | Eviction on an empty resident list | Treat as "nothing to evict" |
//! | `InvalidReference` | Null, foreign or out-of-range reference | Caller bug |
//! | `PoolNotMapped` | Resolve against an unbound base | Caller bug |
//! | `UndoLogFull` | One transaction outgrew the undo log | Split the operation |
//! | `Corruption` | A persistent invariant does not hold | Stop serving; repair offline |
//!
//! No operation retries on its own. Whatever transaction was open when the
//! error surfaced has already been rolled back by the time the caller sees it.

use thiserror::Error;

use crate::storage::PmemOid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PmemError {
    #[error("persistent allocation of {requested} bytes failed: {available} bytes available")]
    Allocation { requested: usize, available: u64 },

    #[error("no victim available: resident list is empty")]
    NoVictimAvailable,

    #[error("invalid persistent reference {oid:?}: {reason}")]
    InvalidReference { oid: PmemOid, reason: &'static str },

    #[error("persistent pool is not mapped")]
    PoolNotMapped,

    #[error("undo log full: transaction needs {requested} bytes, capacity is {capacity}")]
    UndoLogFull { requested: usize, capacity: usize },

    #[error("pool corruption: {detail}")]
    Corruption { detail: String },
}

impl PmemError {
    /// Extracts a typed error from a report, if one is inside it.
    pub fn of(report: &eyre::Report) -> Option<&PmemError> {
        report.downcast_ref::<PmemError>()
    }

    pub(crate) fn invalid(oid: PmemOid, reason: &'static str) -> Self {
        PmemError::InvalidReference { oid, reason }
    }

    pub(crate) fn corruption(detail: impl Into<String>) -> Self {
        PmemError::Corruption {
            detail: detail.into(),
        }
    }
}
