//! # Persistent References
//!
//! A [`PmemOid`] names a location inside a pool as `(pool uuid, offset)`.
//! It is the only kind of link stored on media: nodes point at their key and
//! value buffers and at their neighbours through oids, never through process
//! addresses, so a pool can be mapped at a different address on every run.
//!
//! ```text
//! +----------------+----------------+
//! | pool_uuid (8B) | offset (8B)    |   16 bytes, little-endian
//! +----------------+----------------+
//! ```
//!
//! Offset 0 always holds the pool header, so an oid with offset 0 can never
//! denote a live object. That is the null reference.

use std::fmt;

use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PmemOid {
    pool_uuid: U64,
    off: U64,
}

const _: () = assert!(std::mem::size_of::<PmemOid>() == 16);

impl PmemOid {
    pub const NULL: PmemOid = PmemOid {
        pool_uuid: U64::new(0),
        off: U64::new(0),
    };

    pub fn new(pool_uuid: u64, offset: u64) -> Self {
        Self {
            pool_uuid: U64::new(pool_uuid),
            off: U64::new(offset),
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.off.get() == 0
    }

    #[inline]
    pub fn pool_uuid(&self) -> u64 {
        self.pool_uuid.get()
    }

    #[inline]
    pub fn offset(&self) -> u64 {
        self.off.get()
    }

    /// Same pool, offset moved by `delta` bytes.
    pub(crate) fn add(&self, delta: u64) -> Self {
        Self::new(self.pool_uuid(), self.offset() + delta)
    }
}

impl Default for PmemOid {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Debug for PmemOid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return write!(f, "PmemOid(null)");
        }
        write!(f, "PmemOid({:#x}@{:#x})", self.pool_uuid(), self.offset())
    }
}
