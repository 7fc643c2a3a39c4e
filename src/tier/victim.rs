//! # Victim List
//!
//! A write-back staging list for nodes evicted from the resident list. An
//! evicted value is in an in-between state: it is no longer resident, and the
//! durable log may not yet have it on stable storage. The victim list keeps
//! the node alive across that gap.
//!
//! ```text
//! evict:   resident ──unlink──> (detached) ──stage──> victim head
//! confirm: force_flush(log) ──> drain_and_free(victims)
//! ```
//!
//! The list is prepend-only and tracks no tail; it is only ever drained in
//! full, never searched by position.
//!
//! ## Draining
//!
//! [`VictimList::drain_and_free`] pops one node per transaction. A drain that
//! is interrupted, by an error from the callback or by a crash, leaves a
//! shorter but structurally valid list, and calling it again resumes where it
//! stopped.

use eyre::{bail, Result};
use tracing::debug;

use super::{update_root, ListIter, NodeStore};
use crate::error::PmemError;
use crate::storage::{KvNode, PmemOid, PmemPool, Transaction};

pub struct VictimList;

impl VictimList {
    /// Links an unowned node as the new victim head.
    pub fn stage(tx: &mut Transaction<'_>, node: PmemOid) -> Result<()> {
        let current = NodeStore::load(tx.pool(), node)?;
        if !NodeStore::is_unowned(tx.pool(), node, &current)? {
            bail!(PmemError::invalid(
                node,
                "node must be unlinked before it is staged"
            ));
        }

        let old_head = tx.pool().root()?.victim_head();

        NodeStore::set_next(tx, node, old_head)?;
        if !old_head.is_null() {
            NodeStore::set_prev(tx, old_head, node)?;
        }
        update_root(tx, |r| {
            r.set_victim_head(node);
            r.set_victim_count(r.victim_count() + 1);
        })?;

        debug!(node = ?node, "staged victim");
        Ok(())
    }

    /// Frees every victim, head first. `on_each` runs inside the node's
    /// transaction before the node is freed and is where its key and value
    /// buffers are released. Returns the number of nodes freed.
    pub fn drain_and_free<F>(pool: &mut PmemPool, mut on_each: F) -> Result<u64>
    where
        F: FnMut(&mut Transaction<'_>, &KvNode) -> Result<()>,
    {
        let mut freed = 0u64;

        loop {
            let root = *pool.root()?;
            let head = root.victim_head();

            if head.is_null() {
                if root.victim_count() != 0 {
                    let mut tx = pool.begin()?;
                    update_root(&mut tx, |r| r.set_victim_count(0))?;
                    tx.commit()?;
                }
                break;
            }

            let mut tx = pool.begin()?;
            let node = NodeStore::load(tx.pool(), head)?;

            on_each(&mut tx, &node)?;

            let next = node.next();
            if !next.is_null() {
                NodeStore::set_prev(&mut tx, next, PmemOid::NULL)?;
            }
            NodeStore::set_next(&mut tx, head, PmemOid::NULL)?;
            update_root(&mut tx, |r| {
                r.set_victim_head(next);
                r.set_victim_count(r.victim_count().saturating_sub(1));
            })?;
            NodeStore::free(&mut tx, head)?;
            tx.commit()?;

            freed += 1;
        }

        if freed > 0 {
            debug!(freed, "drained victim list");
        }
        Ok(freed)
    }

    pub fn iter(pool: &PmemPool) -> Result<ListIter<'_>> {
        let root = pool.root()?;
        Ok(ListIter::forward(pool, root.victim_head(), root.victim_count()))
    }

    pub fn len(pool: &PmemPool) -> Result<u64> {
        Ok(pool.root()?.victim_count())
    }
}
