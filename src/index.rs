//! # Volatile Index
//!
//! The in-memory key map that the command layer serves reads from. The tier
//! does not own it; reconstruction repopulates it through the narrow
//! [`VolatileIndex`] interface, tagging every entry with the tier it now
//! lives in:
//!
//! | Source at startup | Tier tag | Back-reference |
//! |-------------------|----------|----------------|
//! | Resident list | `Pmem` | node oid |
//! | Victim list | `Dram` | none |
//!
//! Insertion never overwrites: when a key is already present the existing
//! entry wins and `insert` reports `false`. Reconstruction loads the resident
//! list first, so a key that was evicted and later re-admitted resolves to
//! its resident copy.
//!
//! [`HashIndex`] is a `hashbrown` implementation used by tests and tooling.

use hashbrown::hash_map::Entry;
use hashbrown::HashMap;

use crate::storage::PmemOid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Dram,
    Pmem,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub value: Vec<u8>,
    pub tier: Tier,
    pub back_ref: Option<PmemOid>,
}

pub trait VolatileIndex {
    fn reserve(&mut self, additional: usize);

    /// Adds `key` unless it is already present. Returns whether it was added.
    fn insert(&mut self, key: &[u8], value: &[u8], tier: Tier, back_ref: Option<PmemOid>) -> bool;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HashIndex {
    entries: HashMap<Vec<u8>, IndexEntry>,
}

impl HashIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &[u8]) -> Option<&IndexEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    /// Entries currently tagged with `tier`.
    pub fn count(&self, tier: Tier) -> usize {
        self.entries.values().filter(|e| e.tier == tier).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &IndexEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_slice(), v))
    }
}

impl VolatileIndex for HashIndex {
    fn reserve(&mut self, additional: usize) {
        self.entries.reserve(additional);
    }

    fn insert(&mut self, key: &[u8], value: &[u8], tier: Tier, back_ref: Option<PmemOid>) -> bool {
        match self.entries.entry(key.to_vec()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(IndexEntry {
                    value: value.to_vec(),
                    tier,
                    back_ref,
                });
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_insert_wins() {
        let mut index = HashIndex::new();
        let node = PmemOid::new(1, 4096);

        assert!(index.insert(b"k", b"resident", Tier::Pmem, Some(node)));
        assert!(!index.insert(b"k", b"victim", Tier::Dram, None));

        let entry = index.get(b"k").unwrap();
        assert_eq!(entry.value, b"resident");
        assert_eq!(entry.tier, Tier::Pmem);
        assert_eq!(entry.back_ref, Some(node));
    }

    #[test]
    fn reserve_presizes_capacity() {
        let mut index = HashIndex::new();
        index.reserve(1000);
        assert!(index.capacity() >= 1000);
    }

    #[test]
    fn count_partitions_by_tier() {
        let mut index = HashIndex::new();
        index.insert(b"a", b"1", Tier::Pmem, Some(PmemOid::new(1, 64)));
        index.insert(b"b", b"2", Tier::Dram, None);
        index.insert(b"c", b"3", Tier::Dram, None);

        assert_eq!(index.count(Tier::Pmem), 1);
        assert_eq!(index.count(Tier::Dram), 2);
        assert_eq!(index.len(), 3);
    }
}
