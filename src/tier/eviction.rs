//! # Eviction Controller
//!
//! Picks a resident node to demote and moves it to the victim list.
//!
//! ## Policies
//!
//! | Policy | Config name | Candidate | Cost |
//! |--------|-------------|-----------|------|
//! | `Recency` | `allkeys-lru` | `resident_tail` | O(1) |
//! | `Random` | `allkeys-random` | uniform index in `[0, resident_count)` | O(n) walk from head |
//!
//! `Recency` approximates LRU by insertion order: inserts and relocations
//! move a node to the head, so the tail is the node written longest ago.
//! Reads do not reorder the list, so this is write recency, not access
//! recency.
//!
//! Eviction is infrequent relative to lookups, which is why the random
//! policy walks the list instead of keeping an auxiliary array.
//!
//! ## Atomicity
//!
//! [`EvictionController::evict`] unlinks the candidate and stages it inside
//! the caller's transaction, so both lists and both counters change together
//! or not at all.

use std::fmt;
use std::str::FromStr;

use eyre::{bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use super::{ResidentList, VictimList};
use crate::error::PmemError;
use crate::storage::{buffers, PmemOid, PmemPool, Transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    #[default]
    Recency,
    Random,
}

impl EvictionPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            EvictionPolicy::Recency => "allkeys-lru",
            EvictionPolicy::Random => "allkeys-random",
        }
    }
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EvictionPolicy {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "allkeys-lru" | "recency" => Ok(EvictionPolicy::Recency),
            "allkeys-random" | "random" => Ok(EvictionPolicy::Random),
            other => bail!("unknown eviction policy '{}'", other),
        }
    }
}

/// A node that moved from the resident list to the victim list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub node: PmemOid,
    pub key: Vec<u8>,
}

#[derive(Debug)]
pub struct EvictionController {
    policy: EvictionPolicy,
    rng: StdRng,
}

impl EvictionController {
    pub fn new(policy: EvictionPolicy) -> Self {
        Self {
            policy,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic random policy, for tests and reproducible runs.
    pub fn with_seed(policy: EvictionPolicy, seed: u64) -> Self {
        Self {
            policy,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: EvictionPolicy) {
        self.policy = policy;
    }

    /// The node the policy would evict now, `None` if the list is empty.
    pub fn select(&mut self, pool: &PmemPool) -> Result<Option<PmemOid>> {
        let root = *pool.root()?;
        let count = root.resident_count();
        if count == 0 {
            return Ok(None);
        }

        match self.policy {
            EvictionPolicy::Recency => Ok(Some(root.resident_tail())),
            EvictionPolicy::Random => {
                let index = self.rng.gen_range(0..count);
                ResidentList::get(pool, index)
            }
        }
    }

    /// Moves the selected node from the resident list to the victim list.
    pub fn evict(&mut self, tx: &mut Transaction<'_>) -> Result<Eviction> {
        let Some(node) = self.select(tx.pool())? else {
            bail!(PmemError::NoVictimAvailable);
        };

        let unlinked = ResidentList::unlink(tx, node)?;
        VictimList::stage(tx, node)?;
        let key = buffers::read(tx.pool(), unlinked.key())?.to_vec();

        debug!(node = ?node, policy = %self.policy, "evicted resident node");
        Ok(Eviction { node, key })
    }
}
