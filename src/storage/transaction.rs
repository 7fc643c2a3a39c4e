//! # Undo-Log Transactions
//!
//! Every multi-field mutation of a pool runs inside one [`Transaction`]. A
//! transaction is a scoped guard: it is acquired with [`PmemPool::begin`],
//! holds the pool exclusively, and on every exit path that does not reach
//! [`Transaction::commit`] its writes are rolled back.
//!
//! ## Transaction States
//!
//! ```text
//! ┌─────────┐     commit()     ┌───────────┐
//! │ Active  │ ───────────────> │ Committed │
//! └─────────┘                  └───────────┘
//!      │  │
//!      │  │ abort() / drop
//!      │  v
//!      │ ┌─────────┐
//!      │ │ Aborted │
//!      │ └─────────┘
//!      │ abandon()
//!      v
//! ┌───────────┐
//! │ Abandoned │   undo log left on media, replayed by the next open
//! └───────────┘
//! ```
//!
//! ## Write Protocol
//!
//! Before a range is mutated for the first time in a transaction its current
//! bytes are appended to the undo log:
//!
//! 1. Write `UndoRecordHeader { offset, len }` plus the pre-image at the end
//!    of the undo area, and persist it
//! 2. Bump `UndoLogHeader.used` and persist it
//! 3. Mutate the range in place (persisted at commit)
//!
//! A crash after step 1 but before step 2 leaves a record that is not counted
//! and is ignored. A crash any time after step 2 replays the record.
//!
//! Ranges inside blocks allocated by the same transaction are not logged:
//! if the transaction rolls back, the allocator metadata that made them live
//! rolls back too, and their contents become unreachable.
//!
//! ## Commit Protocol
//!
//! 1. Persist every range written by the transaction
//! 2. Truncate the undo log (`used = 0`) and persist the header
//!
//! Step 2 is the commit point. Until it completes, the next open rolls the
//! transaction back.
//!
//! ## Rollback
//!
//! Records are applied newest-first, so when a range was logged more than
//! once the oldest pre-image wins. Rollback then truncates the log. Replay is
//! idempotent: a crash during rollback simply replays the same records again
//! on the next open.

use std::mem::size_of;
use std::ops::Range;

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;
use tracing::{debug, error};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::headers::UndoRecordHeader;
use super::{freelist, PmemOid, PmemPool};
use crate::config::{
    HEAP_META_OFFSET, HEAP_START, UNDO_HEADER_OFFSET, UNDO_LOG_CAPACITY, UNDO_LOG_OFFSET,
    UNDO_RECORD_HEADER_SIZE,
};
use crate::error::PmemError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxState {
    #[default]
    Active,
    Committed,
    Aborted,
    Abandoned,
}

pub struct Transaction<'p> {
    pool: &'p mut PmemPool,
    state: TxState,
    undo_used: usize,
    logged: SmallVec<[Range<usize>; 8]>,
    fresh: SmallVec<[Range<usize>; 4]>,
    released: SmallVec<[Range<usize>; 4]>,
    dirty: SmallVec<[Range<usize>; 16]>,
}

impl<'p> Transaction<'p> {
    pub(crate) fn begin(pool: &'p mut PmemPool) -> Result<Self> {
        let used = pool.undo_header()?.used();
        ensure!(
            used == 0,
            "cannot begin a transaction over a pending undo log of {} bytes",
            used
        );

        Ok(Self {
            pool,
            state: TxState::Active,
            undo_used: 0,
            logged: SmallVec::new(),
            fresh: SmallVec::new(),
            released: SmallVec::new(),
            dirty: SmallVec::new(),
        })
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    /// Read access to the pool, reflecting this transaction's writes.
    pub fn pool(&self) -> &PmemPool {
        self.pool
    }

    /// Records the current contents of `len` bytes at `offset` so they can
    /// be restored on rollback. Idempotent within a transaction.
    pub fn snapshot(&mut self, offset: u64, len: usize) -> Result<()> {
        self.ensure_active()?;

        let range = self
            .pool
            .base()
            .checked_range(self.pool.oid_at(offset), len)?;

        if covers(&self.logged, &range) || covers(&self.fresh, &range) {
            self.dirty.push(range);
            return Ok(());
        }

        let need = UNDO_RECORD_HEADER_SIZE + len;
        if self.undo_used + need > UNDO_LOG_CAPACITY {
            bail!(PmemError::UndoLogFull {
                requested: self.undo_used + need,
                capacity: UNDO_LOG_CAPACITY,
            });
        }

        let record_at = UNDO_LOG_OFFSET as usize + self.undo_used;
        let header = UndoRecordHeader::new(offset, len as u64);
        self.pool
            .slice_mut(record_at as u64, UNDO_RECORD_HEADER_SIZE)?
            .copy_from_slice(header.as_bytes());
        self.pool
            .copy_within(range.clone(), record_at + UNDO_RECORD_HEADER_SIZE)?;
        self.pool.persist(record_at, need)?;

        self.undo_used += need;
        self.pool.set_undo_used(self.undo_used as u64)?;

        self.logged.push(range.clone());
        self.dirty.push(range);
        Ok(())
    }

    pub fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.snapshot(offset, bytes.len())?;
        self.pool
            .slice_mut(offset, bytes.len())?
            .copy_from_slice(bytes);
        Ok(())
    }

    pub fn zero_at(&mut self, offset: u64, len: usize) -> Result<()> {
        self.snapshot(offset, len)?;
        self.pool.slice_mut(offset, len)?.fill(0);
        Ok(())
    }

    /// Snapshots a `T` at `offset` and mutates it in place.
    pub fn update_at<T, F>(&mut self, offset: u64, f: F) -> Result<()>
    where
        T: FromBytes + IntoBytes + KnownLayout + Immutable + Unaligned,
        F: FnOnce(&mut T),
    {
        self.snapshot(offset, size_of::<T>())?;
        let slice = self.pool.slice_mut(offset, size_of::<T>())?;
        let value = T::mut_from_bytes(slice).map_err(|e| {
            eyre::eyre!(
                "failed to parse {} at offset {}: {:?}",
                std::any::type_name::<T>(),
                offset,
                e
            )
        })?;
        f(value);
        Ok(())
    }

    pub fn update<T, F>(&mut self, oid: PmemOid, f: F) -> Result<()>
    where
        T: FromBytes + IntoBytes + KnownLayout + Immutable + Unaligned,
        F: FnOnce(&mut T),
    {
        self.pool.base().checked_range(oid, size_of::<T>())?;
        self.update_at(oid.offset(), f)
    }

    /// Snapshots and overwrites a single field of the object at `oid`.
    pub fn write_field<T>(&mut self, oid: PmemOid, field_offset: usize, value: &T) -> Result<()>
    where
        T: IntoBytes + Immutable,
    {
        let bytes = value.as_bytes();
        let field = oid.add(field_offset as u64);
        self.pool.base().checked_range(field, bytes.len())?;
        self.write_at(field.offset(), bytes)
    }

    pub fn alloc(&mut self, size: usize) -> Result<PmemOid> {
        self.ensure_active()?;
        freelist::allocate(self, size)
    }

    pub fn free(&mut self, oid: PmemOid) -> Result<()> {
        self.ensure_active()?;
        freelist::release(self, oid)
    }

    pub fn commit(mut self) -> Result<()> {
        self.ensure_active()?;

        for range in &self.dirty {
            self.pool.persist(range.start, range.len())?;
        }
        self.pool.set_undo_used(0)?;

        self.state = TxState::Committed;
        Ok(())
    }

    /// Rolls back every write of this transaction. Returns the number of
    /// undo records applied.
    pub fn abort(mut self) -> Result<usize> {
        self.ensure_active()?;
        let applied = rollback_undo_log(self.pool)?;
        self.state = TxState::Aborted;
        Ok(applied)
    }

    /// Persists the writes made so far and stops without committing or
    /// rolling back, leaving the undo log in place.
    ///
    /// The pool is then in the state a crash at this point would leave on
    /// media. It refuses new transactions until it is reopened, at which
    /// point the undo log is replayed.
    pub fn abandon(mut self) -> Result<()> {
        self.ensure_active()?;
        for range in &self.dirty {
            self.pool.persist(range.start, range.len())?;
        }
        self.state = TxState::Abandoned;
        Ok(())
    }

    pub(crate) fn mark_fresh(&mut self, offset: u64, len: usize) {
        let start = offset as usize;
        self.fresh.push(start..start + len);
    }

    pub(crate) fn note_released(&mut self, offset: u64, len: usize) {
        let start = offset as usize;
        self.released.push(start..start + len);
    }

    pub(crate) fn was_released(&self, offset: u64, len: usize) -> bool {
        let start = offset as usize;
        overlaps(&self.released, &(start..start + len))
    }

    fn ensure_active(&self) -> Result<()> {
        ensure!(
            self.state == TxState::Active,
            "transaction is no longer active ({:?})",
            self.state
        );
        Ok(())
    }
}

impl<'p> Drop for Transaction<'p> {
    fn drop(&mut self) {
        if self.state != TxState::Active {
            return;
        }
        self.state = TxState::Aborted;
        match rollback_undo_log(self.pool) {
            Ok(applied) => debug!(applied, "rolled back dropped transaction"),
            Err(e) => error!(error = %e, "failed to roll back dropped transaction"),
        }
    }
}

fn covers(ranges: &[Range<usize>], range: &Range<usize>) -> bool {
    ranges
        .iter()
        .any(|r| r.start <= range.start && range.end <= r.end)
}

fn overlaps(ranges: &[Range<usize>], range: &Range<usize>) -> bool {
    ranges
        .iter()
        .any(|r| r.start < range.end && range.start < r.end)
}

/// Applies a pending undo log newest-first and truncates it.
pub(crate) fn rollback_undo_log(pool: &mut PmemPool) -> Result<usize> {
    let used = pool.undo_header()?.used() as usize;
    if used == 0 {
        return Ok(0);
    }

    if used > UNDO_LOG_CAPACITY {
        bail!(PmemError::corruption(format!(
            "undo log length {} exceeds capacity {}",
            used, UNDO_LOG_CAPACITY
        )));
    }

    let mut records: SmallVec<[(usize, usize, usize); 16]> = SmallVec::new();
    let mut cursor = 0usize;

    while cursor < used {
        if cursor + UNDO_RECORD_HEADER_SIZE > used {
            bail!(PmemError::corruption(format!(
                "truncated undo record header at {}",
                cursor
            )));
        }

        let header = *pool.read_at::<UndoRecordHeader>(UNDO_LOG_OFFSET + cursor as u64)?;
        let target = header.offset() as usize;
        let len = header.len() as usize;
        let data = UNDO_LOG_OFFSET as usize + cursor + UNDO_RECORD_HEADER_SIZE;

        if cursor + UNDO_RECORD_HEADER_SIZE + len > used {
            bail!(PmemError::corruption(format!(
                "undo record at {} runs past the log end",
                cursor
            )));
        }

        if !restorable(target, len, pool.size()) {
            bail!(PmemError::corruption(format!(
                "undo record targets protected range {}..{}",
                target,
                target + len
            )));
        }

        records.push((target, len, data));
        cursor += UNDO_RECORD_HEADER_SIZE + len;
    }

    for &(target, len, data) in records.iter().rev() {
        pool.copy_within(data..data + len, target)?;
        pool.persist(target, len)?;
    }

    pool.set_undo_used(0)?;
    Ok(records.len())
}

/// Undo records may only restore allocator metadata, root metadata or heap.
fn restorable(target: usize, len: usize, pool_size: usize) -> bool {
    let Some(end) = target.checked_add(len) else {
        return false;
    };
    let metadata = target >= HEAP_META_OFFSET as usize && end <= UNDO_HEADER_OFFSET as usize;
    let heap = target >= HEAP_START as usize && end <= pool_size;
    metadata || heap
}
