//! # Store Facade
//!
//! `PmemStore` is the one owned handle a process holds on its resident tier.
//! It bundles the pool, the eviction controller and the PMEM budget, and
//! wraps each command-level mutation in exactly one transaction:
//!
//! | Operation | Transaction contents |
//! |-----------|----------------------|
//! | `insert` | key buffer, value buffer, node, link at head |
//! | `update_value` | new value buffer, `val` field, free old value |
//! | `relocate` | new value buffer, `val` field, free old value, unlink, link at head |
//! | `remove` | unlink, free node, free both buffers |
//! | `evict` | unlink, stage on victim list |
//!
//! Draining the victim list (`confirm_victims`, `reconstruct`) runs one
//! transaction per victim after the durable log has been flushed.
//!
//! ## Budget
//!
//! The store keeps the budget in step with every operation above. An entry
//! is charged whole heap blocks: the 128-byte node block plus one block for
//! each buffer, headers included ([`PmemStore::footprint_of`]). The store
//! never evicts on its own: the command layer calls
//! [`PmemStore::evict_to_fit`] with the key and value lengths of the
//! incoming write before performing it.
//!
//! ## Usage
//!
//! ```ignore
//! let mut store = PmemStore::builder("./tier.pool").open_or_create()?;
//! store.reconstruct(&mut index, &log)?;
//!
//! store.evict_to_fit(key.len(), value.len())?;
//! let node = store.insert(key, value)?;
//! ```

use std::fmt;
use std::mem::size_of;
use std::path::Path;

use eyre::{bail, Result, WrapErr};
use tracing::{debug, info};

use super::reconstruct::{self, ReconstructionReport};
use super::{
    integrity, Eviction, EvictionController, EvictionPolicy, IntegrityReport, NodeStore,
    ResidentList, StoreBuilder, StoreConfig, VictimList,
};
use crate::config::{BUFFER_LEN_PREFIX, MAX_ALLOCATION};
use crate::error::PmemError;
use crate::index::VolatileIndex;
use crate::memory::{BudgetStats, PmemBudget};
use crate::storage::{buffers, freelist, DurableLog, KvNode, PmemOid, PmemPool, Transaction};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierStatus {
    pub budget: BudgetStats,
    pub resident_entries: u64,
    pub victim_entries: u64,
    pub heap_used: u64,
    pub heap_capacity: u64,
    pub eviction_policy: EvictionPolicy,
}

impl fmt::Display for TierStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "resident:{} victims:{} {} heap:{}/{} policy:{}",
            self.resident_entries,
            self.victim_entries,
            self.budget,
            self.heap_used,
            self.heap_capacity,
            self.eviction_policy
        )
    }
}

#[derive(Debug)]
pub struct PmemStore {
    pool: PmemPool,
    eviction: EvictionController,
    budget: PmemBudget,
    config: StoreConfig,
}

impl PmemStore {
    pub fn builder<P: AsRef<Path>>(path: P) -> StoreBuilder {
        StoreBuilder::new(path)
    }

    pub(crate) fn from_pool(pool: PmemPool, config: StoreConfig) -> Result<Self> {
        let eviction = match config.rng_seed {
            Some(seed) => EvictionController::with_seed(config.eviction_policy, seed),
            None => EvictionController::new(config.eviction_policy),
        };

        if config.verify_on_open {
            let report = integrity::verify(&pool)
                .wrap_err_with(|| format!("pool {} failed verification", config.path.display()))?;
            debug!(resident = report.resident, victims = report.victims, "verified pool");
        }

        let budget = PmemBudget::with_limit(config.max_pmem_memory);
        budget.set_used(resident_footprint(&pool)? as usize);

        info!(
            path = %config.path.display(),
            policy = %config.eviction_policy,
            budget = %budget.stats(),
            "opened store"
        );

        Ok(Self {
            pool,
            eviction,
            budget,
            config,
        })
    }

    /// Writes `key` and `value` into the pool and links a new node at the
    /// resident head.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<PmemOid> {
        let mut tx = self.pool.begin()?;
        let key_ref = buffers::write(&mut tx, key)?;
        let val_ref = buffers::write(&mut tx, value)?;
        let node = ResidentList::insert(&mut tx, key_ref, val_ref)?;

        let current = NodeStore::load(tx.pool(), node)?;
        let bytes = NodeStore::footprint(tx.pool(), node, &current)?;
        tx.commit()?;

        self.budget.charge(bytes as usize);
        Ok(node)
    }

    /// Replaces the value of a resident node in place. The node keeps its
    /// list position.
    pub fn update_value(&mut self, node: PmemOid, value: &[u8]) -> Result<()> {
        let mut tx = self.pool.begin()?;
        let (released, added) = replace_value(&mut tx, node, value)?;
        tx.commit()?;

        self.budget.release(released as usize);
        self.budget.charge(added as usize);
        Ok(())
    }

    /// Replaces the value and moves the node to the resident head, marking
    /// it most recently written. The key buffer is kept.
    pub fn relocate(&mut self, node: PmemOid, value: &[u8]) -> Result<PmemOid> {
        let mut tx = self.pool.begin()?;
        let (released, added) = replace_value(&mut tx, node, value)?;
        ResidentList::unlink(&mut tx, node)?;
        ResidentList::link_head(&mut tx, node)?;
        tx.commit()?;

        self.budget.release(released as usize);
        self.budget.charge(added as usize);
        Ok(node)
    }

    /// Unlinks a resident node and frees it along with its buffers.
    pub fn remove(&mut self, node: PmemOid) -> Result<()> {
        let mut tx = self.pool.begin()?;
        let current = NodeStore::load(tx.pool(), node)?;
        let bytes = NodeStore::footprint(tx.pool(), node, &current)?;

        let removed = ResidentList::remove(&mut tx, node)?;
        free_buffers(&mut tx, &removed)?;
        tx.commit()?;

        self.budget.release(bytes as usize);
        Ok(())
    }

    /// Moves the policy's candidate to the victim list.
    pub fn evict(&mut self) -> Result<Eviction> {
        let mut tx = self.pool.begin()?;
        let eviction = self.eviction.evict(&mut tx)?;

        let current = NodeStore::load(tx.pool(), eviction.node)?;
        let bytes = NodeStore::footprint(tx.pool(), eviction.node, &current)?;
        tx.commit()?;

        self.budget.release(bytes as usize);
        Ok(eviction)
    }

    /// Heap bytes an entry with these key and value lengths is charged once
    /// inserted. Fails with `Allocation` when a buffer would exceed the
    /// largest size class.
    pub fn footprint_of(key_len: usize, val_len: usize) -> Result<usize> {
        let payloads = [
            size_of::<KvNode>(),
            key_len.saturating_add(BUFFER_LEN_PREFIX),
            val_len.saturating_add(BUFFER_LEN_PREFIX),
        ];

        let mut bytes = 0;
        for payload in payloads {
            let Some(class) = freelist::size_class(payload) else {
                bail!(PmemError::Allocation {
                    requested: payload,
                    available: MAX_ALLOCATION as u64,
                });
            };
            bytes += freelist::class_block_size(class);
        }
        Ok(bytes)
    }

    /// Evicts until an entry of `key_len` and `val_len` bytes fits under
    /// `max_pmem_memory`, or the resident list is empty. Each eviction
    /// commits on its own.
    pub fn evict_to_fit(&mut self, key_len: usize, val_len: usize) -> Result<Vec<Eviction>> {
        let incoming = Self::footprint_of(key_len, val_len)?;
        let mut evicted = Vec::new();
        while self.budget.would_exceed(incoming) && ResidentList::len(&self.pool)? > 0 {
            evicted.push(self.evict()?);
        }

        if !evicted.is_empty() {
            debug!(
                evicted = evicted.len(),
                incoming,
                used = self.budget.used(),
                "evicted to fit write"
            );
        }
        Ok(evicted)
    }

    /// Flushes `log` and then frees every victim. Returns the number freed.
    /// Does not touch the log when the victim list is already empty.
    pub fn confirm_victims<L>(&mut self, log: &L) -> Result<u64>
    where
        L: DurableLog + ?Sized,
    {
        if VictimList::len(&self.pool)? == 0 {
            return Ok(0);
        }

        log.force_flush().wrap_err("durability barrier failed")?;
        let freed = reconstruct::free_victims(&mut self.pool, |_| {})?;

        debug!(freed, "confirmed victims");
        Ok(freed)
    }

    pub fn reconstruct<I, L>(&mut self, index: &mut I, log: &L) -> Result<ReconstructionReport>
    where
        I: VolatileIndex + ?Sized,
        L: DurableLog + ?Sized,
    {
        self.reconstruct_with(index, log, |_| {})
    }

    /// Rebuilds `index` from the pool. `on_discard` sees the key of every
    /// victim freed at the end.
    pub fn reconstruct_with<I, L, F>(
        &mut self,
        index: &mut I,
        log: &L,
        on_discard: F,
    ) -> Result<ReconstructionReport>
    where
        I: VolatileIndex + ?Sized,
        L: DurableLog + ?Sized,
        F: FnMut(&[u8]),
    {
        let report = reconstruct::reconstruct(&mut self.pool, index, log, on_discard)?;
        self.budget.set_used(report.resident_bytes as usize);
        Ok(report)
    }

    pub fn key(&self, node: PmemOid) -> Result<&[u8]> {
        let current = NodeStore::load(&self.pool, node)?;
        buffers::read(&self.pool, current.key())
    }

    pub fn value(&self, node: PmemOid) -> Result<&[u8]> {
        let current = NodeStore::load(&self.pool, node)?;
        buffers::read(&self.pool, current.val())
    }

    /// Resident node at `index` from the head.
    pub fn get(&self, index: u64) -> Result<Option<PmemOid>> {
        ResidentList::get(&self.pool, index)
    }

    /// Head to tail.
    pub fn resident_nodes(&self) -> Result<Vec<PmemOid>> {
        ResidentList::iter(&self.pool)?
            .map(|item| item.map(|(oid, _)| oid))
            .collect()
    }

    pub fn victim_nodes(&self) -> Result<Vec<PmemOid>> {
        VictimList::iter(&self.pool)?
            .map(|item| item.map(|(oid, _)| oid))
            .collect()
    }

    pub fn status(&self) -> Result<TierStatus> {
        Ok(TierStatus {
            budget: self.budget.stats(),
            resident_entries: ResidentList::len(&self.pool)?,
            victim_entries: VictimList::len(&self.pool)?,
            heap_used: self.pool.heap_used()?,
            heap_capacity: self.pool.heap_capacity(),
            eviction_policy: self.eviction.policy(),
        })
    }

    pub fn verify(&self) -> Result<IntegrityReport> {
        integrity::verify(&self.pool)
    }

    pub fn eviction_policy(&self) -> EvictionPolicy {
        self.eviction.policy()
    }

    pub fn set_eviction_policy(&mut self, policy: EvictionPolicy) {
        self.eviction.set_policy(policy);
    }

    pub fn budget(&self) -> BudgetStats {
        self.budget.stats()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn pool(&self) -> &PmemPool {
        &self.pool
    }

    /// Opens a transaction for composing list operations directly. The
    /// budget is not updated for anything done through it.
    pub fn begin(&mut self) -> Result<Transaction<'_>> {
        self.pool.begin()
    }

    pub fn close(self) -> Result<()> {
        self.pool.close()
    }
}

/// Writes a new value buffer for `node` and frees the old one. Returns the
/// bytes released and added.
fn replace_value(tx: &mut Transaction<'_>, node: PmemOid, value: &[u8]) -> Result<(u64, u64)> {
    let new_val = buffers::write(tx, value)?;
    let old_val = ResidentList::update_value(tx, node, new_val)?;
    let added = buffers::footprint(tx.pool(), new_val)?;

    let released = if old_val.is_null() {
        0
    } else {
        let bytes = buffers::footprint(tx.pool(), old_val)?;
        buffers::free(tx, old_val)?;
        bytes
    };
    Ok((released, added))
}

fn free_buffers(tx: &mut Transaction<'_>, node: &KvNode) -> Result<()> {
    for buffer in [node.key(), node.val()] {
        if !buffer.is_null() {
            buffers::free(tx, buffer)?;
        }
    }
    Ok(())
}

fn resident_footprint(pool: &PmemPool) -> Result<u64> {
    let mut bytes = 0;
    for item in ResidentList::iter(pool)? {
        let (oid, node) = item?;
        bytes += NodeStore::footprint(pool, oid, &node)?;
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_BUFFER_LEN;
    use std::cell::Cell;
    use tempfile::tempdir;

    const ENTRY: usize = 128 + 32 + 32;

    struct CountingLog(Cell<u32>);

    impl DurableLog for CountingLog {
        fn force_flush(&self) -> Result<()> {
            self.0.set(self.0.get() + 1);
            Ok(())
        }
    }

    fn store(limit: usize) -> (tempfile::TempDir, PmemStore) {
        let dir = tempdir().unwrap();
        let store = PmemStore::builder(dir.path().join("pool"))
            .pool_size(1 << 20)
            .max_pmem_memory(limit)
            .create()
            .unwrap();
        (dir, store)
    }

    #[test]
    fn insert_and_remove_keep_budget_in_step() {
        let (_dir, mut store) = store(0);

        let a = store.insert(b"a", b"1").unwrap();
        let b = store.insert(b"b", b"2").unwrap();
        assert_eq!(store.budget().used, 2 * ENTRY);
        assert_eq!(store.key(a).unwrap(), b"a");
        assert_eq!(store.value(b).unwrap(), b"2");

        store.remove(a).unwrap();
        assert_eq!(store.budget().used, ENTRY);
        assert_eq!(store.resident_nodes().unwrap(), vec![b]);
        assert_eq!(store.pool().heap_used().unwrap(), ENTRY as u64);
    }

    #[test]
    fn update_value_keeps_position() {
        let (_dir, mut store) = store(0);
        let a = store.insert(b"a", b"1").unwrap();
        let b = store.insert(b"b", b"2").unwrap();

        store.update_value(a, &[9u8; 100]).unwrap();

        assert_eq!(store.value(a).unwrap(), &[9u8; 100][..]);
        assert_eq!(store.resident_nodes().unwrap(), vec![b, a]);
        assert_eq!(store.budget().used, 2 * ENTRY - 32 + 128);
        assert_eq!(store.budget().used as u64, store.pool().heap_used().unwrap());
    }

    #[test]
    fn relocate_moves_node_to_head() {
        let (_dir, mut store) = store(0);
        let a = store.insert(b"a", b"1").unwrap();
        let b = store.insert(b"b", b"2").unwrap();
        let c = store.insert(b"c", b"3").unwrap();

        let moved = store.relocate(a, b"new").unwrap();

        assert_eq!(moved, a);
        assert_eq!(store.resident_nodes().unwrap(), vec![a, c, b]);
        assert_eq!(store.key(a).unwrap(), b"a");
        assert_eq!(store.value(a).unwrap(), b"new");
        store.verify().unwrap();
    }

    #[test]
    fn evict_to_fit_stops_once_write_fits() {
        let (_dir, mut store) = store(3 * ENTRY);
        let a = store.insert(b"a", b"1").unwrap();
        let b = store.insert(b"b", b"2").unwrap();
        store.insert(b"c", b"3").unwrap();

        let evicted = store.evict_to_fit(1, 1).unwrap();

        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].node, a);
        assert_eq!(store.budget().used, 2 * ENTRY);

        // 128-byte value block: 128 + 32 + 128 more bytes
        let evicted = store.evict_to_fit(1, 100).unwrap();
        assert_eq!(evicted.iter().map(|e| e.node).collect::<Vec<_>>(), vec![b]);
        assert_eq!(store.victim_nodes().unwrap(), vec![b, a]);
    }

    #[test]
    fn evict_to_fit_empties_list_for_oversized_write() {
        let (_dir, mut store) = store(ENTRY);
        store.insert(b"a", b"1").unwrap();

        let evicted = store.evict_to_fit(1, 10 * ENTRY).unwrap();

        assert_eq!(evicted.len(), 1);
        assert!(store.resident_nodes().unwrap().is_empty());
    }

    #[test]
    fn footprint_of_counts_whole_blocks() {
        assert_eq!(PmemStore::footprint_of(1, 1).unwrap(), ENTRY);
        assert_eq!(PmemStore::footprint_of(0, 100).unwrap(), 128 + 32 + 128);
        assert_eq!(PmemStore::footprint_of(24, 0).unwrap(), 128 + 64 + 32);

        let err = PmemStore::footprint_of(1, MAX_BUFFER_LEN + 1).unwrap_err();
        assert!(matches!(
            PmemError::of(&err),
            Some(PmemError::Allocation { .. })
        ));
    }

    #[test]
    fn write_after_evict_to_fit_stays_under_limit() {
        let (_dir, mut store) = store(500);
        store.insert(b"a", b"1").unwrap();
        store.insert(b"b", b"2").unwrap();

        let evicted = store.evict_to_fit(1, 1).unwrap();
        assert_eq!(evicted.len(), 1);

        store.insert(b"c", b"3").unwrap();
        let budget = store.budget();
        assert_eq!(budget.used, 2 * ENTRY);
        assert!(budget.used <= budget.limit);
        assert_eq!(budget.used as u64, store.pool().heap_used().unwrap() - ENTRY as u64);
    }

    #[test]
    fn removing_an_interior_victim_is_rejected() {
        let (_dir, mut store) = store(0);
        for key in [b"a", b"b", b"c", b"d", b"e"] {
            store.insert(key, b"v").unwrap();
        }
        for _ in 0..3 {
            store.evict().unwrap();
        }
        let victims = store.victim_nodes().unwrap();
        let resident = store.resident_nodes().unwrap();
        let used = store.budget().used;

        for result in [
            store.remove(victims[1]),
            store.update_value(victims[1], b"new"),
            store.relocate(victims[1], b"new").map(|_| ()),
        ] {
            let err = result.unwrap_err();
            assert!(matches!(
                PmemError::of(&err),
                Some(PmemError::InvalidReference { .. })
            ));
        }

        assert_eq!(store.victim_nodes().unwrap(), victims);
        assert_eq!(store.resident_nodes().unwrap(), resident);
        assert_eq!(store.budget().used, used);
        let report = store.verify().unwrap();
        assert_eq!((report.resident, report.victims), (2, 3));
    }

    #[test]
    fn evict_on_empty_store_is_no_victim_available() {
        let (_dir, mut store) = store(0);
        let err = store.evict().unwrap_err();
        assert_eq!(PmemError::of(&err), Some(&PmemError::NoVictimAvailable));
    }

    #[test]
    fn confirm_victims_flushes_once_then_frees() {
        let (_dir, mut store) = store(0);
        let log = CountingLog(Cell::new(0));

        assert_eq!(store.confirm_victims(&log).unwrap(), 0);
        assert_eq!(log.0.get(), 0);

        store.insert(b"a", b"1").unwrap();
        store.insert(b"b", b"2").unwrap();
        store.evict().unwrap();
        store.evict().unwrap();

        assert_eq!(store.confirm_victims(&log).unwrap(), 2);
        assert_eq!(log.0.get(), 1);
        assert_eq!(store.pool().heap_used().unwrap(), 0);
    }

    #[test]
    fn reopen_recomputes_budget() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool");

        let mut store = PmemStore::builder(&path).pool_size(1 << 20).create().unwrap();
        store.insert(b"a", b"1").unwrap();
        store.insert(b"b", b"2").unwrap();
        store.evict().unwrap();
        store.close().unwrap();

        let store = PmemStore::builder(&path).max_pmem_memory(4096).open().unwrap();
        assert_eq!(store.budget().used, ENTRY);
        assert_eq!(store.budget().limit, 4096);
    }

    #[test]
    fn status_reports_counts_and_policy() {
        let (_dir, mut store) = store(4096);
        store.insert(b"a", b"1").unwrap();
        store.insert(b"b", b"2").unwrap();
        store.evict().unwrap();

        let status = store.status().unwrap();
        assert_eq!(status.resident_entries, 1);
        assert_eq!(status.victim_entries, 1);
        assert_eq!(status.heap_used, 2 * ENTRY as u64);
        assert_eq!(
            status.to_string(),
            format!(
                "resident:1 victims:1 pmem:{}/4096 heap:{}/{} policy:allkeys-lru",
                ENTRY,
                2 * ENTRY,
                status.heap_capacity
            )
        );
    }
}
