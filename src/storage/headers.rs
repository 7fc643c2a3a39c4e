//! # Persistent Layout Structs
//!
//! This module provides the zerocopy structs that make up a pmkv pool. Each is
//! read and written in place through the memory mapping; there is no separate
//! serialization step.
//!
//! ## Pool Layout
//!
//! ```text
//! offset 0       +--------------------------+
//!                | PoolHeader (128B)        |  magic, version, uuid, geometry
//! offset 128     +--------------------------+
//!                | HeapMeta (128B)          |  bump pointer, live bytes, free lists
//! offset 256     +--------------------------+
//!                | RootMetadata (64B)       |  resident/victim anchors + counts
//! offset 320     +--------------------------+
//!                | UndoLogHeader (64B)      |  undo bytes in use (commit point)
//! offset 4096    +--------------------------+
//!                | undo records (64 KiB)    |  UndoRecordHeader + pre-image, ...
//! HEAP_START     +--------------------------+
//!                | BlockHeader | payload    |  KvNode, key buffer, value buffer
//!                | BlockHeader | payload    |
//!                | ...                      |
//!                +--------------------------+
//! ```
//!
//! ## Node Layout
//!
//! ```text
//! +-----------+-----------+-----------+-----------+
//! | key (16B) | val (16B) | next (16B)| prev (16B)|   KvNode, 64 bytes
//! +-----------+-----------+-----------+-----------+
//! ```
//!
//! `next`/`prev` link the node into whichever list currently owns it. A node
//! owned by neither list (freshly allocated, or unlinked and about to be
//! staged) has both links null.
//!
//! ## Endianness
//!
//! All multi-byte fields are little-endian zerocopy wrappers and every struct
//! is `Unaligned`, so they can be overlaid on any byte offset of the mapping.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::PmemOid;
use crate::config::{
    HEAP_META_OFFSET, HEAP_META_SIZE, HEAP_START, POOL_HEADER_SIZE, POOL_MAGIC, POOL_VERSION,
    ROOT_OFFSET, ROOT_SIZE, SIZE_CLASS_COUNT, UNDO_HEADER_SIZE, UNDO_LOG_CAPACITY,
    UNDO_LOG_OFFSET, UNDO_RECORD_HEADER_SIZE, BLOCK_HEADER_SIZE, NODE_SIZE,
};

// ============================================================================
// POOL HEADER
// ============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PoolHeader {
    magic: [u8; 16],
    version: U32,
    flags: U32,
    uuid: U64,
    pool_size: U64,
    root_offset: U64,
    heap_meta_offset: U64,
    undo_offset: U64,
    undo_capacity: U64,
    heap_start: U64,
    reserved: [u8; 48],
}

const _: () = assert!(std::mem::size_of::<PoolHeader>() == POOL_HEADER_SIZE);

impl PoolHeader {
    pub fn new(uuid: u64, pool_size: u64) -> Self {
        Self {
            magic: *POOL_MAGIC,
            version: U32::new(POOL_VERSION),
            flags: U32::new(0),
            uuid: U64::new(uuid),
            pool_size: U64::new(pool_size),
            root_offset: U64::new(ROOT_OFFSET),
            heap_meta_offset: U64::new(HEAP_META_OFFSET),
            undo_offset: U64::new(UNDO_LOG_OFFSET),
            undo_capacity: U64::new(UNDO_LOG_CAPACITY as u64),
            heap_start: U64::new(HEAP_START),
            reserved: [0u8; 48],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= POOL_HEADER_SIZE,
            "buffer too small for PoolHeader: {} < {}",
            bytes.len(),
            POOL_HEADER_SIZE
        );

        let header = Self::ref_from_bytes(&bytes[..POOL_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse PoolHeader: {:?}", e))?;

        ensure!(&header.magic == POOL_MAGIC, "invalid magic bytes in pool file");

        ensure!(
            header.version.get() == POOL_VERSION,
            "unsupported pool version: {} (expected {})",
            header.version.get(),
            POOL_VERSION
        );

        ensure!(
            header.root_offset.get() == ROOT_OFFSET
                && header.heap_meta_offset.get() == HEAP_META_OFFSET
                && header.undo_offset.get() == UNDO_LOG_OFFSET
                && header.undo_capacity.get() == UNDO_LOG_CAPACITY as u64
                && header.heap_start.get() == HEAP_START,
            "pool region layout does not match this build"
        );

        Ok(header)
    }

    zerocopy_accessors! {
        version: u32,
        flags: u32,
        uuid: u64,
        pool_size: u64,
        heap_start: u64,
    }
}

// ============================================================================
// HEAP METADATA
// ============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct HeapMeta {
    heap_top: U64,
    heap_used: U64,
    free_heads: [U64; SIZE_CLASS_COUNT],
    reserved: [u8; 16],
}

const _: () = assert!(std::mem::size_of::<HeapMeta>() == HEAP_META_SIZE);

impl HeapMeta {
    pub fn new() -> Self {
        Self {
            heap_top: U64::new(HEAP_START),
            heap_used: U64::new(0),
            free_heads: [U64::new(0); SIZE_CLASS_COUNT],
            reserved: [0u8; 16],
        }
    }

    zerocopy_accessors! {
        heap_top: u64,
        heap_used: u64,
    }

    /// Offset of the first free block of `class`, 0 when the list is empty.
    pub fn free_head(&self, class: usize) -> u64 {
        self.free_heads[class].get()
    }

    pub fn set_free_head(&mut self, class: usize, offset: u64) {
        self.free_heads[class] = U64::new(offset);
    }
}

impl Default for HeapMeta {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// ROOT METADATA
// ============================================================================

/// The single entry point into the persistent lists.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct RootMetadata {
    resident_head: PmemOid,
    resident_tail: PmemOid,
    victim_head: PmemOid,
    resident_count: U64,
    victim_count: U64,
}

const _: () = assert!(std::mem::size_of::<RootMetadata>() == ROOT_SIZE);

impl RootMetadata {
    zerocopy_accessors! {
        resident_head: oid,
        resident_tail: oid,
        victim_head: oid,
        resident_count: u64,
        victim_count: u64,
    }
}

// ============================================================================
// UNDO LOG
// ============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct UndoLogHeader {
    used: U64,
    reserved: [u8; 56],
}

const _: () = assert!(std::mem::size_of::<UndoLogHeader>() == UNDO_HEADER_SIZE);

impl UndoLogHeader {
    zerocopy_accessors! {
        used: u64,
    }
}

/// Precedes each pre-image in the undo log.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct UndoRecordHeader {
    offset: U64,
    len: U64,
}

const _: () = assert!(std::mem::size_of::<UndoRecordHeader>() == UNDO_RECORD_HEADER_SIZE);

impl UndoRecordHeader {
    pub fn new(offset: u64, len: u64) -> Self {
        Self {
            offset: U64::new(offset),
            len: U64::new(len),
        }
    }

    zerocopy_accessors! {
        offset: u64,
        len: u64,
    }
}

// ============================================================================
// HEAP BLOCKS
// ============================================================================

pub const BLOCK_ALLOCATED: u32 = u32::from_le_bytes(*b"ALOC");
pub const BLOCK_FREE: u32 = u32::from_le_bytes(*b"FREE");

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct BlockHeader {
    state: U32,
    class: U32,
    next_free: U64,
}

const _: () = assert!(std::mem::size_of::<BlockHeader>() == BLOCK_HEADER_SIZE);

impl BlockHeader {
    pub fn allocated(class: u32) -> Self {
        Self {
            state: U32::new(BLOCK_ALLOCATED),
            class: U32::new(class),
            next_free: U64::new(0),
        }
    }

    pub fn free(class: u32, next_free: u64) -> Self {
        Self {
            state: U32::new(BLOCK_FREE),
            class: U32::new(class),
            next_free: U64::new(next_free),
        }
    }

    pub fn is_allocated(&self) -> bool {
        self.state.get() == BLOCK_ALLOCATED
    }

    pub fn is_free(&self) -> bool {
        self.state.get() == BLOCK_FREE
    }

    zerocopy_accessors! {
        class: u32,
        next_free: u64,
    }
}

// ============================================================================
// KEY/VALUE NODE
// ============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct KvNode {
    key: PmemOid,
    val: PmemOid,
    next: PmemOid,
    prev: PmemOid,
}

const _: () = assert!(std::mem::size_of::<KvNode>() == NODE_SIZE);

impl KvNode {
    pub const KEY_FIELD: usize = std::mem::offset_of!(KvNode, key);
    pub const VAL_FIELD: usize = std::mem::offset_of!(KvNode, val);
    pub const NEXT_FIELD: usize = std::mem::offset_of!(KvNode, next);
    pub const PREV_FIELD: usize = std::mem::offset_of!(KvNode, prev);

    pub fn new(key: PmemOid, val: PmemOid) -> Self {
        Self {
            key,
            val,
            next: PmemOid::NULL,
            prev: PmemOid::NULL,
        }
    }

    zerocopy_accessors! {
        key: oid,
        val: oid,
        next: oid,
        prev: oid,
    }

    /// Linked into neither list.
    pub fn is_detached(&self) -> bool {
        self.next.is_null() && self.prev.is_null()
    }
}
