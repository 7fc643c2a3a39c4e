//! # PMEM Budget Management
//!
//! Tracks how much of the pool the resident list occupies so the store can
//! evict before a write would push it past `max_pmem_memory`.
//!
//! ```text
//! +----------------------------------------------------------+
//! |                      Pool heap                           |
//! +----------------------------------------------------------+
//! |  resident nodes + buffers   (charged to the budget)      |
//! |  victim nodes + buffers     (not charged, transient)     |
//! |  free-listed blocks                                      |
//! |  unused tail                                             |
//! +----------------------------------------------------------+
//! ```
//!
//! ## Configuration
//!
//! ```rust,ignore
//! // No limit: the heap size is the only bound
//! let budget = PmemBudget::unlimited();
//!
//! // Explicit limit
//! let budget = PmemBudget::with_limit(16 * 1024 * 1024);
//!
//! // Via store builder
//! let store = PmemStore::builder("tier.pool")
//!     .max_pmem_memory(16 * 1024 * 1024)
//!     .open_or_create()?;
//! ```

mod budget;

pub use budget::{BudgetStats, PmemBudget};
