//! # pmkv Layout Constants
//!
//! Every pool file starts with four fixed metadata regions followed by the
//! undo log and the allocation heap. All offsets are relative to the pool
//! base, which is why they are stable across process runs even though the
//! mapping address is not.
//!
//! ## Dependency Graph
//!
//! ```text
//! POOL_HEADER_SIZE (128 bytes, offset 0)
//!       │
//!       └─> HEAP_META_OFFSET (128)
//!             │   HEAP_META_SIZE (128): bump pointer, live bytes,
//!             │   one free-list head per size class
//!             │
//!             └─> ROOT_OFFSET (256)
//!                   │   ROOT_SIZE (64): list heads and counters
//!                   │
//!                   └─> UNDO_HEADER_OFFSET (320)
//!                         │   UNDO_HEADER_SIZE (64): bytes of undo in use
//!                         │
//!                         └─> UNDO_LOG_OFFSET (4096, page aligned)
//!                               │   UNDO_LOG_CAPACITY (64 KiB)
//!                               │
//!                               └─> HEAP_START (derived)
//!
//! MIN_BLOCK_SIZE (32 bytes)
//!       │
//!       ├─> BLOCK_HEADER_SIZE (16, must be < MIN_BLOCK_SIZE)
//!       │
//!       └─> SIZE_CLASS_COUNT (12): classes 32 B, 64 B, ... 64 KiB
//!             MAX_BLOCK_SIZE (derived: MIN_BLOCK_SIZE << 11)
//!
//! NODE_SIZE (64 bytes) must fit the smallest class that holds it
//! ```
//!
//! ## Critical Invariants
//!
//! 1. Offset 0 is the pool header, so no object ever lives at offset 0 and a
//!    zero offset is free to act as the null reference.
//! 2. Metadata regions do not overlap and end before `UNDO_LOG_OFFSET`.
//! 3. The undo log header lives outside the undo-protected regions; it is
//!    the commit point and is never itself logged.
//! 4. `HEAP_START` and `MIN_POOL_SIZE` are multiples of `POOL_ALIGNMENT`.
//!
//! ## Modifying Constants
//!
//! Changing any offset or size here changes the pool format. Bump
//! `POOL_VERSION` alongside it.

// ============================================================================
// POOL FORMAT
// ============================================================================

/// Magic bytes at offset 0 of every pool file.
pub const POOL_MAGIC: &[u8; 16] = b"pmkv pool v1\x00\x00\x00\x00";

/// Pool format version. Bumped on any layout change below.
pub const POOL_VERSION: u32 = 1;

/// Size of the pool header at offset 0.
pub const POOL_HEADER_SIZE: usize = 128;

// ============================================================================
// METADATA REGIONS
// These are laid out back to back; see the dependency graph above.
// ============================================================================

/// Allocator metadata: heap top, live bytes, free-list heads.
pub const HEAP_META_OFFSET: u64 = POOL_HEADER_SIZE as u64;
pub const HEAP_META_SIZE: usize = 128;

/// Root metadata singleton: resident and victim list anchors.
pub const ROOT_OFFSET: u64 = HEAP_META_OFFSET + HEAP_META_SIZE as u64;
pub const ROOT_SIZE: usize = 64;

/// Undo log control block. Written only by the transaction machinery.
pub const UNDO_HEADER_OFFSET: u64 = ROOT_OFFSET + ROOT_SIZE as u64;
pub const UNDO_HEADER_SIZE: usize = 64;

const _: () = assert!(
    UNDO_HEADER_OFFSET + UNDO_HEADER_SIZE as u64 <= UNDO_LOG_OFFSET,
    "metadata regions must end before the undo log"
);

// ============================================================================
// UNDO LOG
// ============================================================================

/// Start of the undo record area. Page aligned so that the undo log and the
/// heap that follows it flush in whole pages.
pub const UNDO_LOG_OFFSET: u64 = 4096;

/// Bytes of undo records a single transaction may produce.
///
/// The largest transaction in the tier (remove of a node with both buffers)
/// snapshots a handful of 16-64 byte ranges, so this is generous.
pub const UNDO_LOG_CAPACITY: usize = 64 * 1024;

/// Size of the per-record header preceding each pre-image.
pub const UNDO_RECORD_HEADER_SIZE: usize = 16;

// ============================================================================
// HEAP
// ============================================================================

/// First byte of the allocation heap.
pub const HEAP_START: u64 = UNDO_LOG_OFFSET + UNDO_LOG_CAPACITY as u64;

/// Header in front of every heap block (state, size class, free link).
pub const BLOCK_HEADER_SIZE: usize = 16;

/// Smallest block, header included.
pub const MIN_BLOCK_SIZE: usize = 32;

/// Number of power-of-two size classes.
pub const SIZE_CLASS_COUNT: usize = 12;

/// Largest block, header included.
pub const MAX_BLOCK_SIZE: usize = MIN_BLOCK_SIZE << (SIZE_CLASS_COUNT - 1);

/// Largest payload a single allocation can hold.
pub const MAX_ALLOCATION: usize = MAX_BLOCK_SIZE - BLOCK_HEADER_SIZE;

const _: () = assert!(BLOCK_HEADER_SIZE < MIN_BLOCK_SIZE);
const _: () = assert!(MAX_BLOCK_SIZE == 64 * 1024);

// ============================================================================
// NODES AND BUFFERS
// ============================================================================

/// Size of a key/value node record.
pub const NODE_SIZE: usize = 64;

/// Length prefix in front of every key or value byte buffer.
pub const BUFFER_LEN_PREFIX: usize = 8;

/// Largest key or value a single buffer can hold.
pub const MAX_BUFFER_LEN: usize = MAX_ALLOCATION - BUFFER_LEN_PREFIX;

const _: () = assert!(NODE_SIZE <= MAX_ALLOCATION);

// ============================================================================
// POOL SIZING
// ============================================================================

/// Pools are sized in multiples of this.
pub const POOL_ALIGNMENT: u64 = 4096;

/// Smallest pool that leaves room for at least one maximal block.
pub const MIN_POOL_SIZE: u64 = HEAP_START + MAX_BLOCK_SIZE as u64;

/// Default pool size when the builder is not told otherwise (64 MiB).
pub const DEFAULT_POOL_SIZE: u64 = 64 * 1024 * 1024;

const _: () = assert!(HEAP_START % POOL_ALIGNMENT == 0);
const _: () = assert!(MIN_POOL_SIZE % POOL_ALIGNMENT == 0);
const _: () = assert!(DEFAULT_POOL_SIZE >= MIN_POOL_SIZE);
const _: () = assert!(DEFAULT_POOL_SIZE % POOL_ALIGNMENT == 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_are_contiguous() {
        assert_eq!(HEAP_META_OFFSET, 128);
        assert_eq!(ROOT_OFFSET, 256);
        assert_eq!(UNDO_HEADER_OFFSET, 320);
        assert_eq!(HEAP_START, 4096 + 65536);
    }

    #[test]
    fn largest_buffer_fits_largest_block() {
        assert_eq!(MAX_BUFFER_LEN + BUFFER_LEN_PREFIX + BLOCK_HEADER_SIZE, MAX_BLOCK_SIZE);
        assert!(MIN_POOL_SIZE > HEAP_START);
    }
}
