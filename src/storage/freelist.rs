//! # Heap Allocator
//!
//! This module implements crash-safe allocation and release of heap blocks
//! inside a pool. Blocks come in power-of-two size classes; released blocks
//! are kept on one singly linked free list per class and reused before the
//! heap grows.
//!
//! ## Block Layout
//!
//! ```text
//! Offset  Size      Description
//! ------  --------  ----------------------------------------
//! 0       4         state: ALLOCATED or FREE magic
//! 4       4         class: size class index
//! 8       8         next_free: offset of next free block (FREE only)
//! 16      2^k - 16  payload (the oid handed to callers points here)
//! ```
//!
//! Classes run from 32 bytes (16 bytes of payload) to 64 KiB. A 64-byte
//! node lands in the 128-byte class.
//!
//! ## Allocation Strategy
//!
//! 1. Pick the smallest class whose block fits header + payload
//! 2. Pop the head of that class's free list if it has one
//! 3. Otherwise carve a fresh block at the heap top
//! 4. If the heap top would pass the end of the pool, fail with
//!    `PmemError::Allocation`
//!
//! Releasing pushes the block onto its class list. Blocks are never split or
//! coalesced.
//!
//! ## Persistence
//!
//! Every piece of allocator state (heap top, live bytes, free-list heads,
//! block headers) lives in the pool and is modified only through the caller's
//! [`Transaction`], so an allocation or release rolls back together with
//! whatever list surgery it was part of.
//!
//! The payload of a freshly allocated block is zeroed. Its old contents are
//! not logged unless the block was released earlier in the same transaction,
//! in which case a rollback has to bring them back.

use eyre::{bail, Result};

use super::headers::{BlockHeader, HeapMeta};
use super::{PmemOid, PmemPool, Transaction};
use crate::config::{
    BLOCK_HEADER_SIZE, HEAP_META_OFFSET, HEAP_START, MAX_ALLOCATION, MAX_BLOCK_SIZE,
    MIN_BLOCK_SIZE, SIZE_CLASS_COUNT,
};
use crate::error::PmemError;

/// Smallest class whose block holds `payload` bytes plus the block header.
pub fn size_class(payload: usize) -> Option<usize> {
    let total = payload.checked_add(BLOCK_HEADER_SIZE)?;
    if total > MAX_BLOCK_SIZE {
        return None;
    }
    let block = total.max(MIN_BLOCK_SIZE).next_power_of_two();
    Some((block / MIN_BLOCK_SIZE).trailing_zeros() as usize)
}

pub fn class_block_size(class: usize) -> usize {
    MIN_BLOCK_SIZE << class
}

pub fn allocate(tx: &mut Transaction<'_>, size: usize) -> Result<PmemOid> {
    let Some(class) = size_class(size) else {
        bail!(PmemError::Allocation {
            requested: size,
            available: MAX_ALLOCATION as u64,
        });
    };
    let block_size = class_block_size(class) as u64;

    let meta = *tx.pool().heap_meta()?;
    let head = meta.free_head(class);

    let block = if head != 0 {
        let header = *tx.pool().read_at::<BlockHeader>(head)?;
        if !header.is_free() || header.class() as usize != class {
            bail!(PmemError::corruption(format!(
                "free list {} points at block {} that is not a free block of that class",
                class, head
            )));
        }
        tx.update_at::<HeapMeta, _>(HEAP_META_OFFSET, |m| {
            m.set_free_head(class, header.next_free())
        })?;
        head
    } else {
        let top = meta.heap_top();
        let end = tx.pool().size() as u64;
        if top + block_size > end {
            bail!(PmemError::Allocation {
                requested: size,
                available: end - top,
            });
        }
        tx.update_at::<HeapMeta, _>(HEAP_META_OFFSET, |m| m.set_heap_top(top + block_size))?;
        top
    };

    tx.update_at::<HeapMeta, _>(HEAP_META_OFFSET, |m| {
        m.set_heap_used(m.heap_used() + block_size)
    })?;
    tx.update_at::<BlockHeader, _>(block, |h| *h = BlockHeader::allocated(class as u32))?;

    let payload = block + BLOCK_HEADER_SIZE as u64;
    let payload_len = block_size as usize - BLOCK_HEADER_SIZE;
    if !tx.was_released(payload, payload_len) {
        tx.mark_fresh(payload, payload_len);
    }
    tx.zero_at(payload, payload_len)?;

    Ok(tx.pool().oid_at(payload))
}

pub fn release(tx: &mut Transaction<'_>, oid: PmemOid) -> Result<()> {
    let block = block_of(tx.pool(), oid)?;
    let header = *tx.pool().read_at::<BlockHeader>(block)?;
    if !header.is_allocated() {
        bail!(PmemError::invalid(oid, "block is not allocated"));
    }

    let class = header.class() as usize;
    if class >= SIZE_CLASS_COUNT {
        bail!(PmemError::corruption(format!(
            "block {} has size class {} out of range",
            block, class
        )));
    }
    let block_size = class_block_size(class) as u64;
    let head = tx.pool().heap_meta()?.free_head(class);

    tx.update_at::<BlockHeader, _>(block, |h| *h = BlockHeader::free(class as u32, head))?;
    tx.update_at::<HeapMeta, _>(HEAP_META_OFFSET, |m| {
        m.set_free_head(class, block);
        m.set_heap_used(m.heap_used().saturating_sub(block_size));
    })?;
    tx.note_released(oid.offset(), block_size as usize - BLOCK_HEADER_SIZE);

    Ok(())
}

/// Block size (header included) of a live allocation.
pub fn block_size_of(pool: &PmemPool, oid: PmemOid) -> Result<u64> {
    let block = block_of(pool, oid)?;
    let header = pool.read_at::<BlockHeader>(block)?;
    if !header.is_allocated() || header.class() as usize >= SIZE_CLASS_COUNT {
        bail!(PmemError::invalid(oid, "block is not allocated"));
    }
    Ok(class_block_size(header.class() as usize) as u64)
}

fn block_of(pool: &PmemPool, oid: PmemOid) -> Result<u64> {
    pool.base().checked_range(oid, 0)?;
    if oid.offset() < HEAP_START + BLOCK_HEADER_SIZE as u64 {
        bail!(PmemError::invalid(oid, "reference does not point into the heap"));
    }
    Ok(oid.offset() - BLOCK_HEADER_SIZE as u64)
}
