//! # Persistent Node Store
//!
//! Allocation and release of [`KvNode`] records, plus the single-field
//! writers the list code uses for pointer surgery. Each writer snapshots only
//! the field it changes, so a four-case unlink logs exactly the fields in its
//! row of the case table and nothing else.
//!
//! A node comes out of [`NodeStore::allocate`] detached (`next`/`prev` null)
//! and must be linked by the caller in the same transaction. It must be
//! unlinked from every list before [`NodeStore::free`] is called in the same
//! transaction.

use std::mem::size_of;

use eyre::{bail, Result};

use crate::config::{BLOCK_HEADER_SIZE, HEAP_START};
use crate::error::PmemError;
use crate::storage::{buffers, freelist, KvNode, PmemOid, PmemPool, Transaction};

pub struct NodeStore;

impl NodeStore {
    pub fn allocate(tx: &mut Transaction<'_>, key: PmemOid, val: PmemOid) -> Result<PmemOid> {
        let node = tx.alloc(size_of::<KvNode>())?;
        tx.update::<KvNode, _>(node, |n| *n = KvNode::new(key, val))?;
        Ok(node)
    }

    pub fn free(tx: &mut Transaction<'_>, node: PmemOid) -> Result<()> {
        let current = Self::load(tx.pool(), node)?;
        if !Self::is_unowned(tx.pool(), node, &current)? {
            bail!(PmemError::invalid(node, "node is still linked into a list"));
        }
        tx.free(node)
    }

    /// Whether `node` is linked into neither list. A sole list member has
    /// null links too, so the root anchors are consulted as well.
    pub fn is_unowned(pool: &PmemPool, node: PmemOid, current: &KvNode) -> Result<bool> {
        let root = pool.root()?;
        Ok(current.is_detached() && root.resident_head() != node && root.victim_head() != node)
    }

    /// Copies the node at `node` out of the pool.
    pub fn load(pool: &PmemPool, node: PmemOid) -> Result<KvNode> {
        if node.is_null() {
            bail!(PmemError::invalid(node, "null node reference"));
        }
        if node.offset() < HEAP_START + BLOCK_HEADER_SIZE as u64 {
            bail!(PmemError::invalid(node, "node reference outside the heap"));
        }
        Ok(*pool.read::<KvNode>(node)?)
    }

    /// Heap bytes held by `node` together with its key and value buffers.
    pub fn footprint(pool: &PmemPool, node: PmemOid, current: &KvNode) -> Result<u64> {
        let mut bytes = freelist::block_size_of(pool, node)?;
        for buffer in [current.key(), current.val()] {
            if !buffer.is_null() {
                bytes += buffers::footprint(pool, buffer)?;
            }
        }
        Ok(bytes)
    }

    pub fn set_next(tx: &mut Transaction<'_>, node: PmemOid, next: PmemOid) -> Result<()> {
        tx.write_field(node, KvNode::NEXT_FIELD, &next)
    }

    pub fn set_prev(tx: &mut Transaction<'_>, node: PmemOid, prev: PmemOid) -> Result<()> {
        tx.write_field(node, KvNode::PREV_FIELD, &prev)
    }

    pub fn set_val(tx: &mut Transaction<'_>, node: PmemOid, val: PmemOid) -> Result<()> {
        tx.write_field(node, KvNode::VAL_FIELD, &val)
    }

    /// Clears both links.
    pub fn detach(tx: &mut Transaction<'_>, node: PmemOid) -> Result<()> {
        Self::set_next(tx, node, PmemOid::NULL)?;
        Self::set_prev(tx, node, PmemOid::NULL)
    }
}
