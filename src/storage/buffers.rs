//! # Key/Value Byte Buffers
//!
//! Keys and values are stored in the pool as length-prefixed byte sequences,
//! each in its own heap allocation:
//!
//! ```text
//! +-----------------+----------------------+
//! | len (8B, LE)    | bytes (len)          |
//! +-----------------+----------------------+
//! ^ oid
//! ```
//!
//! Nodes hold the oids of their key and value buffers. Buffers are owned by
//! whoever frees the node: removal frees both alongside the node, and the
//! victim drain frees them from its per-node callback.

use eyre::{bail, Result};
use zerocopy::little_endian::U64;

use super::{freelist, PmemOid, PmemPool, Transaction};
use crate::config::{BUFFER_LEN_PREFIX, MAX_BUFFER_LEN};
use crate::error::PmemError;

/// Copies `bytes` into a new buffer allocated inside `tx`.
pub fn write(tx: &mut Transaction<'_>, bytes: &[u8]) -> Result<PmemOid> {
    if bytes.len() > MAX_BUFFER_LEN {
        bail!(PmemError::Allocation {
            requested: bytes.len() + BUFFER_LEN_PREFIX,
            available: (MAX_BUFFER_LEN + BUFFER_LEN_PREFIX) as u64,
        });
    }

    let oid = tx.alloc(BUFFER_LEN_PREFIX + bytes.len())?;
    tx.write_at(oid.offset(), &(bytes.len() as u64).to_le_bytes())?;
    tx.write_at(oid.offset() + BUFFER_LEN_PREFIX as u64, bytes)?;
    Ok(oid)
}

pub fn read(pool: &PmemPool, oid: PmemOid) -> Result<&[u8]> {
    let len = pool.read::<U64>(oid)?.get() as usize;
    if len > MAX_BUFFER_LEN {
        bail!(PmemError::invalid(oid, "buffer length prefix out of range"));
    }
    pool.bytes(oid.add(BUFFER_LEN_PREFIX as u64), len)
}

pub fn free(tx: &mut Transaction<'_>, oid: PmemOid) -> Result<()> {
    tx.free(oid)
}

/// Recovers the buffer oid from a slice previously returned by [`read`].
pub fn oid_of(pool: &PmemPool, payload: &[u8]) -> Result<PmemOid> {
    let at = pool.reference_of(payload.as_ptr())?;
    if at.offset() < BUFFER_LEN_PREFIX as u64 {
        bail!(PmemError::invalid(at, "slice is not a buffer payload"));
    }
    Ok(PmemOid::new(at.pool_uuid(), at.offset() - BUFFER_LEN_PREFIX as u64))
}

/// Heap bytes consumed by the buffer, block header included.
pub fn footprint(pool: &PmemPool, oid: PmemOid) -> Result<u64> {
    freelist::block_size_of(pool, oid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pool() -> (tempfile::TempDir, PmemPool) {
        let dir = tempdir().unwrap();
        let pool = PmemPool::create(dir.path().join("pool"), 1 << 20).unwrap();
        (dir, pool)
    }

    #[test]
    fn written_bytes_read_back() {
        let (_dir, mut pool) = pool();

        let mut tx = pool.begin().unwrap();
        let oid = write(&mut tx, b"hello").unwrap();
        let empty = write(&mut tx, b"").unwrap();
        tx.commit().unwrap();

        assert_eq!(read(&pool, oid).unwrap(), b"hello");
        assert_eq!(read(&pool, empty).unwrap(), b"");
    }

    #[test]
    fn oid_of_recovers_buffer_reference() {
        let (_dir, mut pool) = pool();

        let mut tx = pool.begin().unwrap();
        let oid = write(&mut tx, b"payload").unwrap();
        tx.commit().unwrap();

        let slice = read(&pool, oid).unwrap();
        assert_eq!(oid_of(&pool, slice).unwrap(), oid);
    }

    #[test]
    fn footprint_counts_whole_block() {
        let (_dir, mut pool) = pool();

        let mut tx = pool.begin().unwrap();
        let small = write(&mut tx, b"abc").unwrap();
        let large = write(&mut tx, &[7u8; 100]).unwrap();
        tx.commit().unwrap();

        assert_eq!(footprint(&pool, small).unwrap(), 32);
        assert_eq!(footprint(&pool, large).unwrap(), 128);
    }

    #[test]
    fn oversized_buffer_is_an_allocation_error() {
        let (_dir, mut pool) = pool();

        let mut tx = pool.begin().unwrap();
        let err = write(&mut tx, &vec![0u8; MAX_BUFFER_LEN + 1]).unwrap_err();

        assert!(matches!(
            PmemError::of(&err),
            Some(PmemError::Allocation { .. })
        ));
    }

    #[test]
    fn freed_buffer_can_no_longer_be_measured() {
        let (_dir, mut pool) = pool();

        let mut tx = pool.begin().unwrap();
        let oid = write(&mut tx, b"gone").unwrap();
        free(&mut tx, oid).unwrap();
        tx.commit().unwrap();

        assert!(footprint(&pool, oid).is_err());
    }
}
