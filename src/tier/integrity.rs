//! # Integrity Checker
//!
//! Walks both lists and checks the structural invariants of the tier. Used
//! after opening a pool when `verify_on_open` is set, by tests after every
//! crash scenario, and by tooling.
//!
//! ## Checks
//!
//! | Check | Resident | Victim |
//! |-------|----------|--------|
//! | anchors agree with count | head null ⇔ tail null ⇔ count 0 | head null ⇔ count 0 |
//! | forward walk length | == count, ends at tail | == count, ends at null |
//! | backward walk | reverse of forward | n/a |
//! | head has no prev | yes | yes |
//! | `next.prev` points back | yes | yes |
//! | lists disjoint | shared node set | shared node set |
//!
//! Walks are bounded by the root counters, so a cycle shows up as a length
//! mismatch rather than a hang. Every violation is reported as
//! `PmemError::Corruption`.

use eyre::{bail, Result};
use hashbrown::HashSet;

use super::ListIter;
use crate::error::PmemError;
use crate::storage::{PmemOid, PmemPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IntegrityReport {
    pub resident: u64,
    pub victims: u64,
}

pub fn verify(pool: &PmemPool) -> Result<IntegrityReport> {
    let root = *pool.root()?;
    let mut seen = HashSet::new();

    let head = root.resident_head();
    let tail = root.resident_tail();
    let count = root.resident_count();
    if head.is_null() != tail.is_null() || head.is_null() != (count == 0) {
        bail!(PmemError::corruption(format!(
            "resident anchors disagree: head {:?}, tail {:?}, count {}",
            head, tail, count
        )));
    }

    let forward = walk(ListIter::forward(pool, head, count + 1), "resident", &mut seen)?;
    if forward.len() as u64 != count {
        bail!(PmemError::corruption(format!(
            "resident list walks {} nodes but root counts {}",
            forward.len(),
            count
        )));
    }
    if let Some(&last) = forward.last() {
        if last != tail {
            bail!(PmemError::corruption(format!(
                "resident walk ends at {:?} but tail is {:?}",
                last, tail
            )));
        }
    }

    let mut backward = Vec::with_capacity(forward.len());
    for item in ListIter::backward(pool, tail, count + 1) {
        backward.push(item?.0);
    }
    backward.reverse();
    if backward != forward {
        bail!(PmemError::corruption(
            "resident prev links do not mirror next links"
        ));
    }

    let victim_head = root.victim_head();
    let victim_count = root.victim_count();
    if victim_head.is_null() != (victim_count == 0) {
        bail!(PmemError::corruption(format!(
            "victim anchors disagree: head {:?}, count {}",
            victim_head, victim_count
        )));
    }

    let victims = walk(
        ListIter::forward(pool, victim_head, victim_count + 1),
        "victim",
        &mut seen,
    )?;
    if victims.len() as u64 != victim_count {
        bail!(PmemError::corruption(format!(
            "victim list walks {} nodes but root counts {}",
            victims.len(),
            victim_count
        )));
    }

    Ok(IntegrityReport {
        resident: count,
        victims: victim_count,
    })
}

/// Collects a forward walk, checking that each node's `prev` names the node
/// before it and that no node has been seen before in either list.
fn walk(
    iter: ListIter<'_>,
    list: &str,
    seen: &mut HashSet<PmemOid>,
) -> Result<Vec<PmemOid>> {
    let mut order = Vec::new();
    let mut expected_prev = PmemOid::NULL;

    for item in iter {
        let (oid, node) = item?;
        if !seen.insert(oid) {
            bail!(PmemError::corruption(format!(
                "node {:?} reached twice while walking the {} list",
                oid, list
            )));
        }
        if node.prev() != expected_prev {
            bail!(PmemError::corruption(format!(
                "{} node {:?} has prev {:?}, expected {:?}",
                list,
                oid,
                node.prev(),
                expected_prev
            )));
        }
        expected_prev = oid;
        order.push(oid);
    }

    Ok(order)
}
