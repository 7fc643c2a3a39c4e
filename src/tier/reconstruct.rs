//! # Reconstruction
//!
//! Rebuilds the volatile index from the pool at process start, before any
//! command is served. The pool has already been opened, which rolled back any
//! transaction a crash interrupted, so both lists are structurally valid.
//!
//! ## Phases
//!
//! ```text
//! 1. resident   reserve(resident_count); walk head→tail; insert as Pmem
//!                                                     with node back-ref
//! 2. victims    reserve(victim_count); walk victim head; insert as Dram
//! 3. barrier    log.force_flush()                     (exactly once)
//! 4. drain      free every victim node and its buffers
//! ```
//!
//! Phase 3 must complete before phase 4 starts: a victim's value is neither
//! resident nor guaranteed durable until the log has been flushed, so freeing
//! it first could lose it to a crash between the two. Phase 2 must complete
//! before phase 3 so that every victim value is already back in the index
//! when the barrier is taken.
//!
//! The ordering is carried in the types. Each phase consumes the token the
//! previous one produced, and the tokens cannot be built outside this
//! module:
//!
//! ```text
//! load_resident() -> ResidentLoaded
//!   load_victims(ResidentLoaded) -> VictimsLoaded
//!     barrier(VictimsLoaded) -> Flushed
//!       drain(Flushed) -> ReconstructionReport
//! ```
//!
//! ## Duplicate Keys
//!
//! A key can be in both lists if it was evicted and later admitted again.
//! The resident walk runs first and the index keeps the first insert, so
//! the resident copy wins.
//!
//! ## Idempotence
//!
//! Phases 1 and 2 only read the pool. Running reconstruction twice from the
//! same image yields the same index; a crash during phase 4 leaves a shorter
//! victim list whose remaining entries are loaded again on the next run.

use eyre::{Result, WrapErr};
use tracing::info;

use super::{NodeStore, ResidentList, VictimList};
use crate::error::PmemError;
use crate::index::{Tier, VolatileIndex};
use crate::storage::{buffers, DurableLog, PmemPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconstructionReport {
    /// Entries loaded from the resident list, tagged `Pmem`.
    pub resident_entries: u64,
    /// Entries loaded from the victim list, tagged `Dram`.
    pub victim_entries: u64,
    /// Victim nodes freed after the durability barrier.
    pub victims_freed: u64,
    /// Heap bytes held by resident nodes and their buffers.
    pub resident_bytes: u64,
    /// Undo records replayed when the pool was opened.
    pub rolled_back_records: usize,
}

struct ResidentLoaded {
    entries: u64,
    bytes: u64,
}

struct VictimsLoaded {
    resident: ResidentLoaded,
    entries: u64,
}

struct Flushed {
    loaded: VictimsLoaded,
}

/// Runs all four phases. `on_discard` sees the key of each victim as it is
/// freed.
pub fn reconstruct<I, L, F>(
    pool: &mut PmemPool,
    index: &mut I,
    log: &L,
    on_discard: F,
) -> Result<ReconstructionReport>
where
    I: VolatileIndex + ?Sized,
    L: DurableLog + ?Sized,
    F: FnMut(&[u8]),
{
    let resident = load_resident(pool, index).wrap_err("failed to load resident list")?;
    let victims = load_victims(pool, index, resident).wrap_err("failed to load victim list")?;
    let flushed = barrier(log, victims).wrap_err("durability barrier failed")?;
    let report = drain(pool, flushed, on_discard).wrap_err("failed to drain victim list")?;

    info!(
        resident = report.resident_entries,
        victims = report.victim_entries,
        freed = report.victims_freed,
        resident_bytes = report.resident_bytes,
        rolled_back = report.rolled_back_records,
        "reconstructed volatile index"
    );
    Ok(report)
}

fn load_resident<I>(pool: &PmemPool, index: &mut I) -> Result<ResidentLoaded>
where
    I: VolatileIndex + ?Sized,
{
    let count = ResidentList::len(pool)?;
    index.reserve(count as usize);

    let mut entries = 0u64;
    let mut bytes = 0u64;
    for item in ResidentList::iter(pool)? {
        let (oid, node) = item?;
        let key = buffers::read(pool, node.key())?;
        let value = buffers::read(pool, node.val())?;
        index.insert(key, value, Tier::Pmem, Some(oid));

        bytes += NodeStore::footprint(pool, oid, &node)?;
        entries += 1;
    }

    if entries != count {
        eyre::bail!(PmemError::corruption(format!(
            "resident list holds {} nodes but root counts {}",
            entries, count
        )));
    }

    Ok(ResidentLoaded { entries, bytes })
}

fn load_victims<I>(pool: &PmemPool, index: &mut I, resident: ResidentLoaded) -> Result<VictimsLoaded>
where
    I: VolatileIndex + ?Sized,
{
    let count = VictimList::len(pool)?;
    index.reserve(count as usize);

    let mut entries = 0u64;
    for item in VictimList::iter(pool)? {
        let (_, node) = item?;
        let key = buffers::read(pool, node.key())?;
        let value = buffers::read(pool, node.val())?;
        index.insert(key, value, Tier::Dram, None);
        entries += 1;
    }

    if entries != count {
        eyre::bail!(PmemError::corruption(format!(
            "victim list holds {} nodes but root counts {}",
            entries, count
        )));
    }

    Ok(VictimsLoaded { resident, entries })
}

fn barrier<L>(log: &L, loaded: VictimsLoaded) -> Result<Flushed>
where
    L: DurableLog + ?Sized,
{
    log.force_flush()?;
    Ok(Flushed { loaded })
}

fn drain<F>(pool: &mut PmemPool, flushed: Flushed, on_discard: F) -> Result<ReconstructionReport>
where
    F: FnMut(&[u8]),
{
    let freed = free_victims(pool, on_discard)?;

    let loaded = flushed.loaded;
    Ok(ReconstructionReport {
        resident_entries: loaded.resident.entries,
        victim_entries: loaded.entries,
        victims_freed: freed,
        resident_bytes: loaded.resident.bytes,
        rolled_back_records: pool.rolled_back_records(),
    })
}

/// Drains the victim list, releasing each node's key and value buffers with
/// it. Only valid once the durable log has been flushed.
pub(crate) fn free_victims<F>(pool: &mut PmemPool, mut on_discard: F) -> Result<u64>
where
    F: FnMut(&[u8]),
{
    VictimList::drain_and_free(pool, |tx, node| {
        if !node.key().is_null() {
            on_discard(buffers::read(tx.pool(), node.key())?);
            buffers::free(tx, node.key())?;
        }
        if !node.val().is_null() {
            buffers::free(tx, node.val())?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::HashIndex;
    use crate::storage::PmemOid;
    use crate::tier::{update_root, EvictionController, EvictionPolicy};
    use std::cell::Cell;
    use tempfile::tempdir;

    struct CountingLog(Cell<u32>);

    impl DurableLog for CountingLog {
        fn force_flush(&self) -> Result<()> {
            self.0.set(self.0.get() + 1);
            Ok(())
        }
    }

    struct FailingLog;

    impl DurableLog for FailingLog {
        fn force_flush(&self) -> Result<()> {
            eyre::bail!("disk full")
        }
    }

    fn insert(pool: &mut PmemPool, key: &[u8], value: &[u8]) -> PmemOid {
        let mut tx = pool.begin().unwrap();
        let k = buffers::write(&mut tx, key).unwrap();
        let v = buffers::write(&mut tx, value).unwrap();
        let node = ResidentList::insert(&mut tx, k, v).unwrap();
        tx.commit().unwrap();
        node
    }

    fn evict(pool: &mut PmemPool) {
        let mut controller = EvictionController::new(EvictionPolicy::Recency);
        let mut tx = pool.begin().unwrap();
        controller.evict(&mut tx).unwrap();
        tx.commit().unwrap();
    }

    #[test]
    fn empty_pool_reconstructs_to_empty_index() {
        let dir = tempdir().unwrap();
        let mut pool = PmemPool::create(dir.path().join("pool"), 1 << 20).unwrap();
        let mut index = HashIndex::new();
        let log = CountingLog(Cell::new(0));

        let report = reconstruct(&mut pool, &mut index, &log, |_| {}).unwrap();

        assert_eq!(report, ReconstructionReport::default());
        assert!(index.is_empty());
        assert_eq!(log.0.get(), 1);
    }

    #[test]
    fn resident_copy_wins_over_victim_copy() {
        let dir = tempdir().unwrap();
        let mut pool = PmemPool::create(dir.path().join("pool"), 1 << 20).unwrap();

        insert(&mut pool, b"k", b"old");
        evict(&mut pool);
        let node = insert(&mut pool, b"k", b"new");

        let mut index = HashIndex::new();
        let log = CountingLog(Cell::new(0));
        let report = reconstruct(&mut pool, &mut index, &log, |_| {}).unwrap();

        let entry = index.get(b"k").unwrap();
        assert_eq!(entry.value, b"new");
        assert_eq!(entry.tier, Tier::Pmem);
        assert_eq!(entry.back_ref, Some(node));
        assert_eq!(report.victim_entries, 1);
        assert_eq!(report.victims_freed, 1);
    }

    #[test]
    fn failed_barrier_keeps_victims() {
        let dir = tempdir().unwrap();
        let mut pool = PmemPool::create(dir.path().join("pool"), 1 << 20).unwrap();
        insert(&mut pool, b"a", b"1");
        evict(&mut pool);

        let mut index = HashIndex::new();
        let err = reconstruct(&mut pool, &mut index, &FailingLog, |_| {}).unwrap_err();

        assert!(format!("{:?}", err).contains("disk full"));
        assert_eq!(VictimList::len(&pool).unwrap(), 1);
        assert_eq!(index.get(b"a").unwrap().tier, Tier::Dram);
    }

    #[test]
    fn short_victim_chain_is_corruption_before_barrier() {
        let dir = tempdir().unwrap();
        let mut pool = PmemPool::create(dir.path().join("pool"), 1 << 20).unwrap();
        insert(&mut pool, b"a", b"1");
        insert(&mut pool, b"b", b"2");
        evict(&mut pool);
        evict(&mut pool);

        let mut tx = pool.begin().unwrap();
        update_root(&mut tx, |r| r.set_victim_count(3)).unwrap();
        tx.commit().unwrap();

        let mut index = HashIndex::new();
        let log = CountingLog(Cell::new(0));
        let err = reconstruct(&mut pool, &mut index, &log, |_| {}).unwrap_err();

        assert!(err
            .chain()
            .any(|cause| matches!(
                cause.downcast_ref::<PmemError>(),
                Some(PmemError::Corruption { .. })
            )));
        assert_eq!(log.0.get(), 0);
        assert_eq!(VictimList::len(&pool).unwrap(), 3);
    }

    #[test]
    fn resident_bytes_cover_node_and_buffers() {
        let dir = tempdir().unwrap();
        let mut pool = PmemPool::create(dir.path().join("pool"), 1 << 20).unwrap();
        insert(&mut pool, b"key", b"value");

        let mut index = HashIndex::new();
        let log = CountingLog(Cell::new(0));
        let report = reconstruct(&mut pool, &mut index, &log, |_| {}).unwrap();

        assert_eq!(report.resident_bytes, 128 + 32 + 32);
        assert_eq!(report.resident_bytes, pool.heap_used().unwrap());
    }
}
