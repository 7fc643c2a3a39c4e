//! # pmkv - Persistent-Memory Resident Tier
//!
//! pmkv is the persistent-memory tier of a key/value server. Hot entries live
//! in a pool file mapped into the process, linked into a crash-consistent
//! doubly linked list; colder entries are evicted through a write-back
//! staging list and, after a restart, the volatile index is rebuilt from
//! both lists before the server accepts commands.
//!
//! - **Offset addressing**: persistent links are `(pool, offset)` pairs,
//!   never raw addresses, so a pool maps correctly at any base
//! - **One transaction per mutation**: every multi-field change is covered
//!   by an in-pool undo log and rolls back as a unit after a crash
//! - **Ordered recovery**: victims are freed only after the durable log has
//!   been flushed
//!
//! ## Quick Start
//!
//! ```ignore
//! use pmkv::{AppendLog, HashIndex, PmemStore};
//!
//! let log = AppendLog::open("./kv.aof")?;
//! let mut store = PmemStore::builder("./kv.pool")
//!     .max_pmem_memory(64 * 1024 * 1024)
//!     .open_or_create()?;
//!
//! let mut index = HashIndex::new();
//! store.reconstruct(&mut index, &log)?;
//!
//! store.evict_to_fit(key.len(), value.len())?;
//! let node = store.insert(key, value)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │       Store facade (PmemStore)       │
//! ├─────────────────────────────────────┤
//! │ Eviction │ Reconstruction │ Integrity│
//! ├─────────────────────────────────────┤
//! │   Resident List   │   Victim List    │
//! ├─────────────────────────────────────┤
//! │      Node Store / Byte Buffers       │
//! ├─────────────────────────────────────┤
//! │   Transactions (undo log) / Heap     │
//! ├─────────────────────────────────────┤
//! │  Memory-Mapped Pool + Offset Refs    │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## Pool Layout
//!
//! ```text
//! tier.pool
//! ├── 0        pool header      magic, version, uuid, region offsets
//! ├── 128      heap metadata    heap top, live bytes, free-list heads
//! ├── 256      root metadata    list heads, tail, counts
//! ├── 320      undo log header  bytes of undo records in use
//! ├── 4096     undo log         64 KiB of undo records
//! └── 69632    heap             nodes and key/value buffers
//! ```
//!
//! ## Module Overview
//!
//! - [`storage`]: Pool mapping, offset references, transactions, heap, log
//! - [`tier`]: Resident and victim lists, eviction, reconstruction, store
//! - [`index`]: Volatile index interface and a hash map implementation
//! - [`memory`]: PMEM budget accounting
//! - [`config`]: Layout constants
//! - [`error`]: Typed error taxonomy

#[macro_use]
mod macros;

pub mod config;
pub mod error;
pub mod index;
pub mod memory;
pub mod storage;
pub mod tier;

pub use error::PmemError;
pub use index::{HashIndex, IndexEntry, Tier, VolatileIndex};
pub use memory::{BudgetStats, PmemBudget};
pub use storage::{AppendLog, DurableLog, LogRecord, PmemOid, PmemPool, Transaction};
pub use tier::{
    Eviction, EvictionController, EvictionPolicy, IntegrityReport, PmemStore,
    ReconstructionReport, StoreBuilder, StoreConfig, TierStatus,
};
