//! The chaining resolver: links direct branches to the records of their targets so that control
//! flow stays within the cache.

use crate::record::{InsIdx, RecordStore};
use std::collections::{hash_map::Entry, HashMap};

/// Maps an original address to the first record derived from it. Later records with the same
/// original address (e.g. an instruction preceded by its profiling stub) are not independently
/// addressable: branching to the address enters at the earliest of them.
pub(crate) struct ChainMap(HashMap<u64, InsIdx>);

impl ChainMap {
    pub(crate) fn build(store: &RecordStore) -> Self {
        let mut map = HashMap::with_capacity(store.len());
        for (idx, rec) in store.iter_enumerated() {
            if rec.orig_addr == 0 {
                continue;
            }
            if let Entry::Vacant(e) = map.entry(rec.orig_addr) {
                e.insert(idx);
            }
        }
        Self(map)
    }

    pub(crate) fn get(&self, addr: u64) -> Option<InsIdx> {
        self.0.get(&addr).copied()
    }
}

/// Resolve every direct branch that doesn't yet have a target record. Branches whose target isn't
/// in `map` stay unresolved: they leave the translated region. Returns how many were resolved.
pub(crate) fn chain(store: &mut RecordStore, map: &ChainMap) -> usize {
    let mut n = 0;
    for rec in store.iter_mut() {
        if rec.target.is_some() || rec.orig_target == 0 || !rec.branch.is_direct() {
            continue;
        }
        rec.target = map.get(rec.orig_target);
        if rec.target.is_some() {
            n += 1;
        }
    }
    n
}
