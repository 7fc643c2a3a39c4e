//! # Offset Addressing
//!
//! Translates persistent references to process addresses and back. The pool
//! base is the only absolute address in the system; it is bound when the pool
//! is mapped and cleared when it is unmapped, and may differ on every run.
//!
//! ```text
//!   process address = base + oid.offset
//!   oid.offset      = process address - base
//! ```
//!
//! `resolve` and `reference_of` are pure arithmetic against the current base.
//! They do not check what lives at the address; resolving a stale oid yields
//! an address that is in bounds but meaningless. Slice access elsewhere in the
//! crate goes through [`PoolBase::checked_range`], which additionally rejects
//! null, foreign-pool and out-of-range references.

use std::ops::Range;
use std::ptr::NonNull;

use super::PmemOid;
use crate::error::PmemError;

#[derive(Debug, Clone, Copy, Default)]
pub struct PoolBase {
    base: Option<usize>,
    len: usize,
    uuid: u64,
}

impl PoolBase {
    pub fn unbound(uuid: u64) -> Self {
        Self {
            base: None,
            len: 0,
            uuid,
        }
    }

    pub fn bind(&mut self, base: *const u8, len: usize) {
        self.base = Some(base as usize);
        self.len = len;
    }

    pub fn unbind(&mut self) {
        self.base = None;
        self.len = 0;
    }

    pub fn is_mapped(&self) -> bool {
        self.base.is_some()
    }

    pub fn uuid(&self) -> u64 {
        self.uuid
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address of `oid` under the current mapping.
    pub fn resolve(&self, oid: PmemOid) -> Result<NonNull<u8>, PmemError> {
        let base = self.base.ok_or(PmemError::PoolNotMapped)?;
        let addr = base.wrapping_add(oid.offset() as usize);
        NonNull::new(addr as *mut u8).ok_or(PmemError::PoolNotMapped)
    }

    /// Reference for an address inside the current mapping.
    pub fn reference_of(&self, addr: *const u8) -> Result<PmemOid, PmemError> {
        let base = self.base.ok_or(PmemError::PoolNotMapped)?;
        let addr = addr as usize;
        match addr.checked_sub(base) {
            Some(off) if off < self.len => Ok(PmemOid::new(self.uuid, off as u64)),
            _ => Err(PmemError::invalid(
                PmemOid::NULL,
                "address lies outside the mapped pool",
            )),
        }
    }

    /// Byte range of `len` bytes at `oid`, validated against this pool.
    pub fn checked_range(&self, oid: PmemOid, len: usize) -> Result<Range<usize>, PmemError> {
        if !self.is_mapped() {
            return Err(PmemError::PoolNotMapped);
        }
        if oid.is_null() {
            return Err(PmemError::invalid(oid, "null reference"));
        }
        if oid.pool_uuid() != self.uuid {
            return Err(PmemError::invalid(oid, "reference belongs to another pool"));
        }
        let start = oid.offset() as usize;
        match start.checked_add(len) {
            Some(end) if end <= self.len => Ok(start..end),
            _ => Err(PmemError::invalid(oid, "reference out of pool bounds")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_fails_only_when_unmapped() {
        let base = PoolBase::unbound(7);
        assert_eq!(
            base.resolve(PmemOid::new(7, 64)),
            Err(PmemError::PoolNotMapped)
        );
    }

    #[test]
    fn resolve_and_reference_of_are_inverse() {
        let region = vec![0u8; 1024];
        let mut base = PoolBase::unbound(7);
        base.bind(region.as_ptr(), region.len());

        let oid = PmemOid::new(7, 300);
        let addr = base.resolve(oid).unwrap();
        assert_eq!(addr.as_ptr() as usize, region.as_ptr() as usize + 300);
        assert_eq!(base.reference_of(addr.as_ptr()).unwrap(), oid);
    }

    #[test]
    fn rebinding_moves_addresses_but_not_references() {
        let first = vec![0u8; 256];
        let second = vec![0u8; 256];
        let oid = PmemOid::new(3, 128);

        let mut base = PoolBase::unbound(3);
        base.bind(first.as_ptr(), first.len());
        let a = base.resolve(oid).unwrap();
        base.unbind();
        base.bind(second.as_ptr(), second.len());
        let b = base.resolve(oid).unwrap();

        assert_ne!(a, b);
        assert_eq!(base.reference_of(b.as_ptr()).unwrap(), oid);
    }

    #[test]
    fn reference_of_rejects_foreign_address() {
        let region = vec![0u8; 64];
        let mut base = PoolBase::unbound(1);
        base.bind(region.as_ptr(), region.len());

        assert!(base.reference_of(region.as_ptr().wrapping_sub(1)).is_err());
        assert!(base.reference_of(region.as_ptr().wrapping_add(64)).is_err());
    }

    #[test]
    fn checked_range_rejects_null_foreign_and_out_of_bounds() {
        let region = vec![0u8; 512];
        let mut base = PoolBase::unbound(9);
        base.bind(region.as_ptr(), region.len());

        assert!(base.checked_range(PmemOid::NULL, 8).is_err());
        assert!(base.checked_range(PmemOid::new(8, 64), 8).is_err());
        assert!(base.checked_range(PmemOid::new(9, 508), 8).is_err());
        assert_eq!(base.checked_range(PmemOid::new(9, 504), 8).unwrap(), 504..512);
    }
}
