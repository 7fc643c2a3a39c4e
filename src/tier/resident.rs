//! # Resident List
//!
//! The steady-state list of nodes materialized in the PMEM tier, ordered by
//! recency of insertion: every new or relocated key is prepended at the
//! head, so the tail is always the node that has gone longest without being
//! written.
//!
//! ## Unlink Cases
//!
//! The list has no sentinel nodes, so removal is an explicit match over
//! where the node sits (node N, prev P, next X):
//!
//! | Position | Condition | Fields written |
//! |----------|-----------|----------------|
//! | Sole | N is head and tail | root.head = root.tail = null |
//! | Head | N is head, has X | X.prev = null; root.head = X |
//! | Tail | N is tail, has P | P.next = null; root.tail = P |
//! | Interior | otherwise | P.next = X; X.prev = P |
//!
//! Every case also decrements `resident_count` and clears N's own links, and
//! all of it happens inside the caller's transaction. Neighbour links are
//! checked to point back at N before anything is written; a node that is not
//! linked where its position says it should be is rejected with
//! `InvalidReference` and the transaction is left untouched.

use eyre::{bail, Result};
use tracing::debug;

use super::{update_root, ListIter, NodeStore};
use crate::error::PmemError;
use crate::storage::{KvNode, PmemOid, PmemPool, Transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Sole,
    Head,
    Tail,
    Interior,
}

impl Position {
    pub fn classify(is_head: bool, is_tail: bool) -> Self {
        match (is_head, is_tail) {
            (true, true) => Position::Sole,
            (true, false) => Position::Head,
            (false, true) => Position::Tail,
            (false, false) => Position::Interior,
        }
    }
}

pub struct ResidentList;

impl ResidentList {
    /// Allocates a node for `key`/`val` and links it as the new head.
    pub fn insert(tx: &mut Transaction<'_>, key: PmemOid, val: PmemOid) -> Result<PmemOid> {
        let node = NodeStore::allocate(tx, key, val)?;
        Self::link_head(tx, node)?;
        Ok(node)
    }

    /// Links an unowned node as the new head.
    pub fn link_head(tx: &mut Transaction<'_>, node: PmemOid) -> Result<()> {
        let current = NodeStore::load(tx.pool(), node)?;
        if !NodeStore::is_unowned(tx.pool(), node, &current)? {
            bail!(PmemError::invalid(node, "node is already linked into a list"));
        }

        let old_head = tx.pool().root()?.resident_head();

        NodeStore::set_next(tx, node, old_head)?;
        if !old_head.is_null() {
            NodeStore::set_prev(tx, old_head, node)?;
        }
        update_root(tx, |r| {
            r.set_resident_head(node);
            if old_head.is_null() {
                r.set_resident_tail(node);
            }
            r.set_resident_count(r.resident_count() + 1);
        })?;

        debug!(node = ?node, "linked resident head");
        Ok(())
    }

    /// Points `node` at a new value buffer. Returns the previous one.
    pub fn update_value(tx: &mut Transaction<'_>, node: PmemOid, val: PmemOid) -> Result<PmemOid> {
        let current = NodeStore::load(tx.pool(), node)?;
        Self::ensure_member(tx.pool(), node, &current)?;
        NodeStore::set_val(tx, node, val)?;
        Ok(current.val())
    }

    /// Unlinks and frees `node`. Returns its last contents so the caller can
    /// release the key and value buffers in the same transaction.
    pub fn remove(tx: &mut Transaction<'_>, node: PmemOid) -> Result<KvNode> {
        let removed = Self::unlink(tx, node)?;
        NodeStore::free(tx, node)?;
        Ok(removed)
    }

    /// Unlinks `node` without freeing it, leaving it detached.
    pub fn unlink(tx: &mut Transaction<'_>, node: PmemOid) -> Result<KvNode> {
        let current = NodeStore::load(tx.pool(), node)?;
        let root = *tx.pool().root()?;
        let (prev, next) = (current.prev(), current.next());

        if root.resident_count() == 0 {
            bail!(PmemError::invalid(node, "resident list is empty"));
        }

        let position = Position::classify(
            root.resident_head() == node,
            root.resident_tail() == node,
        );

        match position {
            Position::Sole => {
                if !prev.is_null() || !next.is_null() {
                    bail!(PmemError::corruption(format!(
                        "sole resident node {:?} has neighbours",
                        node
                    )));
                }
                update_root(tx, |r| {
                    r.set_resident_head(PmemOid::NULL);
                    r.set_resident_tail(PmemOid::NULL);
                    r.set_resident_count(r.resident_count() - 1);
                })?;
            }
            Position::Head => {
                if next.is_null() || !prev.is_null() {
                    bail!(PmemError::corruption(format!(
                        "resident head {:?} is not the tail but has a predecessor or no successor",
                        node
                    )));
                }
                Self::expect_link(tx.pool(), next, |x| x.prev(), node)?;
                NodeStore::set_prev(tx, next, PmemOid::NULL)?;
                update_root(tx, |r| {
                    r.set_resident_head(next);
                    r.set_resident_count(r.resident_count() - 1);
                })?;
            }
            Position::Tail => {
                if prev.is_null() || !next.is_null() {
                    bail!(PmemError::corruption(format!(
                        "resident tail {:?} is not the head but has a successor or no predecessor",
                        node
                    )));
                }
                Self::expect_link(tx.pool(), prev, |p| p.next(), node)?;
                NodeStore::set_next(tx, prev, PmemOid::NULL)?;
                update_root(tx, |r| {
                    r.set_resident_tail(prev);
                    r.set_resident_count(r.resident_count() - 1);
                })?;
            }
            Position::Interior => {
                if prev.is_null() || next.is_null() {
                    bail!(PmemError::invalid(node, "node is not linked into the resident list"));
                }
                Self::ensure_member(tx.pool(), node, &current)?;
                Self::expect_link(tx.pool(), prev, |p| p.next(), node)?;
                Self::expect_link(tx.pool(), next, |x| x.prev(), node)?;
                NodeStore::set_next(tx, prev, next)?;
                NodeStore::set_prev(tx, next, prev)?;
                update_root(tx, |r| r.set_resident_count(r.resident_count() - 1))?;
            }
        }

        NodeStore::detach(tx, node)?;
        debug!(node = ?node, ?position, "unlinked resident node");

        let mut detached = current;
        detached.set_next(PmemOid::NULL);
        detached.set_prev(PmemOid::NULL);
        Ok(detached)
    }

    /// The node at `index` counting from the head, `None` past the end.
    pub fn get(pool: &PmemPool, index: u64) -> Result<Option<PmemOid>> {
        let root = pool.root()?;
        if index >= root.resident_count() {
            return Ok(None);
        }
        match Self::iter(pool)?.nth(index as usize) {
            Some(item) => Ok(Some(item?.0)),
            None => bail!(PmemError::corruption(format!(
                "resident list ended before index {} of {}",
                index,
                root.resident_count()
            ))),
        }
    }

    /// Head to tail.
    pub fn iter(pool: &PmemPool) -> Result<ListIter<'_>> {
        let root = pool.root()?;
        Ok(ListIter::forward(pool, root.resident_head(), root.resident_count()))
    }

    /// Tail to head.
    pub fn iter_rev(pool: &PmemPool) -> Result<ListIter<'_>> {
        let root = pool.root()?;
        Ok(ListIter::backward(pool, root.resident_tail(), root.resident_count()))
    }

    pub fn len(pool: &PmemPool) -> Result<u64> {
        Ok(pool.root()?.resident_count())
    }

    /// Follows `prev` links from `node` and requires them to end at the
    /// resident head within `resident_count` steps. Victim nodes and detached
    /// or freed nodes end somewhere else.
    fn ensure_member(pool: &PmemPool, node: PmemOid, current: &KvNode) -> Result<()> {
        let root = *pool.root()?;
        let mut cursor = node;
        let mut prev = current.prev();
        let mut steps = 0u64;

        while !prev.is_null() {
            steps += 1;
            if steps >= root.resident_count() {
                bail!(PmemError::invalid(node, "node is not linked into the resident list"));
            }
            cursor = prev;
            prev = NodeStore::load(pool, cursor)?.prev();
        }

        if cursor != root.resident_head() {
            bail!(PmemError::invalid(node, "node is not linked into the resident list"));
        }
        Ok(())
    }

    fn expect_link(
        pool: &PmemPool,
        neighbour: PmemOid,
        link: impl Fn(&KvNode) -> PmemOid,
        node: PmemOid,
    ) -> Result<()> {
        let n = NodeStore::load(pool, neighbour)?;
        if link(&n) != node {
            bail!(PmemError::invalid(
                node,
                "neighbour links do not point back at node"
            ));
        }
        Ok(())
    }
}
