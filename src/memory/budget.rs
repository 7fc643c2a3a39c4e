//! # PMEM Budget Implementation
//!
//! Counts the heap bytes held by resident entries against the configured
//! `max_pmem_memory`.
//!
//! ## Accounting
//!
//! An entry is charged the full block size of its node, its key buffer and
//! its value buffer, headers included. This matches what the allocator
//! reports as `heap_used` for the resident list, so after reconstruction
//! the budget and the heap agree.
//!
//! | Event | Effect |
//! |-------|--------|
//! | insert | `charge(node + key + value)` |
//! | update / relocate | `release(old value)`, `charge(new value)` |
//! | remove | `release(node + key + value)` |
//! | evict | `release(node + key + value)` |
//! | reconstruct | `set_used(resident footprint)` |
//!
//! Evicted entries are no longer charged even though their blocks stay
//! allocated until the victim list is drained; the victim list is transient
//! and drained in full, so it is not counted against the resident limit.
//!
//! ## Enforcement Model
//!
//! Unlike a hard allocator limit, the budget never refuses a charge. Callers
//! run `PmemStore::evict_to_fit` before a write, which asks
//! [`PmemBudget::would_exceed`] and evicts until the write fits; the heap itself is the hard limit and fails with
//! `PmemError::Allocation` when exhausted.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetStats {
    pub limit: usize,
    pub used: usize,
}

impl BudgetStats {
    pub fn is_unlimited(&self) -> bool {
        self.limit == 0
    }

    pub fn available(&self) -> Option<usize> {
        if self.is_unlimited() {
            return None;
        }
        Some(self.limit.saturating_sub(self.used))
    }

    pub fn utilization_percent(&self) -> f64 {
        if self.limit == 0 {
            return 0.0;
        }
        (self.used as f64 / self.limit as f64) * 100.0
    }
}

impl fmt::Display for BudgetStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unlimited() {
            write!(f, "pmem:{}/unlimited", self.used)
        } else {
            write!(f, "pmem:{}/{}", self.used, self.limit)
        }
    }
}

#[derive(Debug)]
pub struct PmemBudget {
    limit: usize,
    used: AtomicUsize,
}

impl PmemBudget {
    /// A `limit` of zero disables the budget.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
        }
    }

    pub fn unlimited() -> Self {
        Self::with_limit(0)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Whether adding `bytes` would take usage past the limit.
    pub fn would_exceed(&self, bytes: usize) -> bool {
        self.limit != 0 && self.used().saturating_add(bytes) > self.limit
    }

    pub fn charge(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        self.used.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn release(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }

        loop {
            let current = self.used.load(Ordering::Acquire);
            let new_value = current.saturating_sub(bytes);

            match self.used.compare_exchange_weak(
                current,
                new_value,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(_) => continue,
            }
        }
    }

    pub fn set_used(&self, bytes: usize) {
        self.used.store(bytes, Ordering::Release);
    }

    pub fn stats(&self) -> BudgetStats {
        BudgetStats {
            limit: self.limit,
            used: self.used(),
        }
    }
}

impl Default for PmemBudget {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_never_exceeds() {
        let budget = PmemBudget::unlimited();
        budget.charge(usize::MAX / 2);
        assert!(!budget.would_exceed(usize::MAX / 2));
        assert_eq!(budget.stats().available(), None);
    }

    #[test]
    fn test_would_exceed_at_boundary() {
        let budget = PmemBudget::with_limit(1000);
        budget.charge(600);

        assert!(!budget.would_exceed(400));
        assert!(budget.would_exceed(401));
    }

    #[test]
    fn test_release_underflow_protection() {
        let budget = PmemBudget::with_limit(1000);
        budget.charge(100);
        budget.release(1000);
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn test_zero_charge() {
        let budget = PmemBudget::with_limit(1000);
        budget.charge(0);
        budget.release(0);
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn test_set_used_replaces_count() {
        let budget = PmemBudget::with_limit(1000);
        budget.charge(100);
        budget.set_used(384);
        assert_eq!(budget.used(), 384);
        assert_eq!(budget.stats().available(), Some(616));
    }

    #[test]
    fn test_stats_display() {
        let budget = PmemBudget::with_limit(4096);
        budget.charge(192);

        assert_eq!(budget.stats().to_string(), "pmem:192/4096");
        assert_eq!(PmemBudget::unlimited().stats().to_string(), "pmem:0/unlimited");
        assert!((budget.stats().utilization_percent() - 4.6875).abs() < f64::EPSILON);
    }
}
