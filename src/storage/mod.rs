//! # Storage Module
//!
//! This module provides the persistent substrate the tier is built on: a pool
//! file mapped into memory, offset-based references into it, an undo-log
//! transaction guard, a crash-safe heap allocator, length-prefixed byte
//! buffers, and the append-only durable log.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ tier: node store, resident/victim lists, ... │
//! ├──────────────────────────────────────────────┤
//! │ buffers (key/value bytes) │ aof (durable log)│
//! ├───────────────────────────┴──────────────────┤
//! │ Transaction (undo log) ── freelist (heap)    │
//! ├──────────────────────────────────────────────┤
//! │ PmemPool (mmap) ── PoolBase (oid ⇄ address)  │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Safety Model
//!
//! The mapping is read through `&PmemPool` and written only through a
//! [`Transaction`], which borrows the pool mutably. The borrow checker thus
//! rules out reading a structure while a transaction is halfway through
//! rewriting it, and rules out two overlapping transactions.
//!
//! Persistent structures never contain process addresses. Every link is a
//! [`PmemOid`], resolved against the current [`PoolBase`] only at use time.
//!
//! ## Durability Model
//!
//! A transaction persists its undo records before mutating, persists its
//! writes at commit, and only then truncates the undo log. A crash at any
//! byte boundary leaves either the old state or the new one after the next
//! [`PmemPool::open`].

mod addressing;
pub mod aof;
pub mod buffers;
pub mod freelist;
pub mod headers;
mod oid;
mod pool;
mod transaction;

pub use addressing::PoolBase;
pub use aof::{AppendLog, DurableLog, LogRecord};
pub use headers::{KvNode, RootMetadata};
pub use oid::PmemOid;
pub use pool::PmemPool;
pub use transaction::{Transaction, TxState};
