//! # Store Builder
//!
//! Fluent configuration for opening a [`PmemStore`]. Settings are chained
//! before one of the terminal calls:
//!
//! | Terminal | Pool file missing | Pool file present |
//! |----------|-------------------|-------------------|
//! | `create()` | created | error |
//! | `open()` | error | opened, undo log replayed |
//! | `open_or_create()` | created | opened, undo log replayed |
//!
//! ## Configuration Options
//!
//! | Option          | Default          | Description                               |
//! |-----------------|------------------|-------------------------------------------|
//! | pool_size       | 64 MiB           | Size of a newly created pool file         |
//! | max_pmem_memory | 0 (unlimited)    | Resident bytes allowed before eviction    |
//! | eviction_policy | `allkeys-lru`    | Candidate selection for eviction          |
//! | rng_seed        | entropy          | Seed for the random policy                |
//! | verify_on_open  | false            | Run the integrity checker after opening   |
//!
//! `pool_size` is ignored when an existing pool is opened; the file's size
//! wins.
//!
//! ## Usage
//!
//! ```ignore
//! let mut store = PmemStore::builder("./tier.pool")
//!     .pool_size(256 * 1024 * 1024)
//!     .max_pmem_memory(128 * 1024 * 1024)
//!     .eviction_policy("allkeys-random".parse()?)
//!     .open_or_create()?;
//!
//! store.reconstruct(&mut index, &log)?;
//! ```

use std::path::{Path, PathBuf};

use eyre::{bail, Result};

use super::{EvictionPolicy, PmemStore};
use crate::config::DEFAULT_POOL_SIZE;
use crate::storage::PmemPool;

/// Resolved settings of an open store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub pool_size: u64,
    pub max_pmem_memory: usize,
    pub eviction_policy: EvictionPolicy,
    pub rng_seed: Option<u64>,
    pub verify_on_open: bool,
}

pub struct StoreBuilder {
    path: PathBuf,
    pool_size: Option<u64>,
    max_pmem_memory: Option<usize>,
    eviction_policy: Option<EvictionPolicy>,
    rng_seed: Option<u64>,
    verify_on_open: Option<bool>,
}

impl StoreBuilder {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            pool_size: None,
            max_pmem_memory: None,
            eviction_policy: None,
            rng_seed: None,
            verify_on_open: None,
        }
    }

    /// Size of the pool file when one is created. Must be a multiple of 4 KiB
    /// and at least `MIN_POOL_SIZE`.
    pub fn pool_size(mut self, bytes: u64) -> Self {
        self.pool_size = Some(bytes);
        self
    }

    /// Resident bytes the store tries to stay under. Zero disables the limit.
    pub fn max_pmem_memory(mut self, bytes: usize) -> Self {
        self.max_pmem_memory = Some(bytes);
        self
    }

    pub fn eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = Some(policy);
        self
    }

    /// Makes the random eviction policy deterministic.
    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    pub fn verify_on_open(mut self, enabled: bool) -> Self {
        self.verify_on_open = Some(enabled);
        self
    }

    pub fn config(&self) -> StoreConfig {
        StoreConfig {
            path: self.path.clone(),
            pool_size: self.pool_size.unwrap_or(DEFAULT_POOL_SIZE),
            max_pmem_memory: self.max_pmem_memory.unwrap_or(0),
            eviction_policy: self.eviction_policy.unwrap_or_default(),
            rng_seed: self.rng_seed,
            verify_on_open: self.verify_on_open.unwrap_or(false),
        }
    }

    /// Creates a new pool. Fails if the file already exists.
    pub fn create(self) -> Result<PmemStore> {
        let config = self.config();
        if config.path.exists() {
            bail!("pool file {} already exists", config.path.display());
        }
        let pool = PmemPool::create(&config.path, config.pool_size)?;
        PmemStore::from_pool(pool, config)
    }

    /// Opens an existing pool, rolling back any interrupted transaction.
    pub fn open(self) -> Result<PmemStore> {
        let config = self.config();
        let pool = PmemPool::open(&config.path)?;
        PmemStore::from_pool(pool, config)
    }

    pub fn open_or_create(self) -> Result<PmemStore> {
        if self.path.exists() {
            self.open()
        } else {
            self.create()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_resolve_to_documented_values() {
        let config = StoreBuilder::new("/tmp/pool").config();

        assert_eq!(config.path, PathBuf::from("/tmp/pool"));
        assert_eq!(config.pool_size, DEFAULT_POOL_SIZE);
        assert_eq!(config.max_pmem_memory, 0);
        assert_eq!(config.eviction_policy, EvictionPolicy::Recency);
        assert_eq!(config.rng_seed, None);
        assert!(!config.verify_on_open);
    }

    #[test]
    fn setters_override_defaults() {
        let config = StoreBuilder::new("/tmp/pool")
            .pool_size(1 << 20)
            .max_pmem_memory(4096)
            .eviction_policy(EvictionPolicy::Random)
            .rng_seed(9)
            .verify_on_open(true)
            .config();

        assert_eq!(config.pool_size, 1 << 20);
        assert_eq!(config.max_pmem_memory, 4096);
        assert_eq!(config.eviction_policy, EvictionPolicy::Random);
        assert_eq!(config.rng_seed, Some(9));
        assert!(config.verify_on_open);
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool");

        let store = StoreBuilder::new(&path).pool_size(1 << 20).create().unwrap();
        store.close().unwrap();

        let err = StoreBuilder::new(&path).pool_size(1 << 20).create().err().unwrap();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn open_requires_existing_file() {
        let dir = tempdir().unwrap();
        assert!(StoreBuilder::new(dir.path().join("missing")).open().is_err());
    }

    #[test]
    fn open_or_create_reopens_same_pool() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool");

        let mut store = StoreBuilder::new(&path)
            .pool_size(1 << 20)
            .open_or_create()
            .unwrap();
        store.insert(b"k", b"v").unwrap();
        let uuid = store.pool().uuid();
        store.close().unwrap();

        let store = StoreBuilder::new(&path)
            .verify_on_open(true)
            .open_or_create()
            .unwrap();
        assert_eq!(store.pool().uuid(), uuid);
        assert_eq!(store.resident_nodes().unwrap().len(), 1);
        assert_eq!(store.pool().size(), 1 << 20);
    }
}
