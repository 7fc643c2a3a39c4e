//! # Resident Tier
//!
//! The PMEM resident tier: a crash-consistent doubly linked list of key/value
//! nodes, a write-back staging list for evicted nodes, the controller that
//! moves nodes between them, and the startup protocol that rebuilds the
//! volatile index from both.
//!
//! ## Component Stack
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ PmemStore (owned handle, one per process)                │
//! ├──────────────────┬───────────────────┬───────────────────┤
//! │ EvictionController│ Reconstruction   │ integrity::verify │
//! ├──────────────────┴─────────┬─────────┴───────────────────┤
//! │ ResidentList               │ VictimList                  │
//! ├────────────────────────────┴─────────────────────────────┤
//! │ NodeStore                                                │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ownership Invariant
//!
//! Every allocated node is in exactly one of: the resident list, the victim
//! list, or (only inside a transaction) neither. Nodes move from resident to
//! victim by `unlink` + `stage` in one transaction, and leave the victim list
//! only by being freed.
//!
//! ## Root Metadata
//!
//! ```text
//! resident_head ──> [c] <──> [b] <──> [a] <── resident_tail
//! victim_head   ──> [x] <──> [y]
//! resident_count = 3, victim_count = 2
//! ```
//!
//! `resident_head` is null iff `resident_tail` is null iff
//! `resident_count == 0`. The victim list tracks no tail.

pub mod builder;
pub mod eviction;
pub mod integrity;
pub mod node_store;
pub mod reconstruct;
pub mod resident;
pub mod store;
pub mod victim;

pub use builder::{StoreBuilder, StoreConfig};
pub use eviction::{Eviction, EvictionController, EvictionPolicy};
pub use integrity::IntegrityReport;
pub use node_store::NodeStore;
pub use reconstruct::ReconstructionReport;
pub use resident::{Position, ResidentList};
pub use store::{PmemStore, TierStatus};
pub use victim::VictimList;

use eyre::Result;

use crate::config::ROOT_OFFSET;
use crate::storage::{KvNode, PmemOid, PmemPool, RootMetadata, Transaction};

pub(crate) fn update_root<F>(tx: &mut Transaction<'_>, f: F) -> Result<()>
where
    F: FnOnce(&mut RootMetadata),
{
    tx.update_at::<RootMetadata, _>(ROOT_OFFSET, f)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

/// Walks a list through `next` (or `prev`) links, yielding at most `limit`
/// nodes even if the links form a longer chain or a cycle.
pub struct ListIter<'p> {
    pool: &'p PmemPool,
    cursor: PmemOid,
    remaining: u64,
    direction: Direction,
}

impl<'p> ListIter<'p> {
    pub(crate) fn forward(pool: &'p PmemPool, start: PmemOid, limit: u64) -> Self {
        Self {
            pool,
            cursor: start,
            remaining: limit,
            direction: Direction::Forward,
        }
    }

    pub(crate) fn backward(pool: &'p PmemPool, start: PmemOid, limit: u64) -> Self {
        Self {
            pool,
            cursor: start,
            remaining: limit,
            direction: Direction::Backward,
        }
    }
}

impl<'p> Iterator for ListIter<'p> {
    type Item = Result<(PmemOid, KvNode)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor.is_null() || self.remaining == 0 {
            return None;
        }

        let oid = self.cursor;
        match NodeStore::load(self.pool, oid) {
            Ok(node) => {
                self.cursor = match self.direction {
                    Direction::Forward => node.next(),
                    Direction::Backward => node.prev(),
                };
                self.remaining -= 1;
                Some(Ok((oid, node)))
            }
            Err(e) => {
                self.cursor = PmemOid::NULL;
                Some(Err(e))
            }
        }
    }
}
