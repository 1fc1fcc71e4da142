//! The basic-block profile table.
//!
//! Profiling stubs in the first cache update [BlockCounters] directly, by absolute address, from
//! whatever program threads execute them. Counts take no locks and are not atomic
//! read-modify-writes: concurrent executions of the same stub can lose increments. Only claiming a
//! histogram slot is atomic, so a slot never changes target once claimed.
//! Everything in [BlockCounters] is thus advisory: it drives a best-effort heuristic and never
//! affects correctness. Readers use `Relaxed` loads.
//!
//! [BlockInfo] is written only while a generation is being built, by the single thread building
//! it.

use crate::record::{BlockIdx, InsIdx};
use index_vec::IndexVec;
use static_assertions::const_assert_eq;
use std::{
    mem::{offset_of, size_of},
    sync::atomic::{AtomicU64, Ordering},
};

/// How many (target, count) histogram slots each block has. Slots are claimed by the first K
/// distinct targets seen; later targets go uncounted.
pub(crate) const HISTOGRAM_SLOTS: usize = 4;

/// The counters a block's profiling stubs update. The layout is relied upon by generated code.
#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct BlockCounters {
    /// How often has the block's terminator been reached?
    pub counter: AtomicU64,
    /// How often has a conditional terminator not been taken?
    pub fallthrough: AtomicU64,
    /// The target each histogram slot has been claimed for, or 0 if it is still free.
    pub targets: [AtomicU64; HISTOGRAM_SLOTS],
    /// Hits in each histogram slot.
    pub counts: [AtomicU64; HISTOGRAM_SLOTS],
}

const_assert_eq!(size_of::<BlockCounters>(), 16 + 16 * HISTOGRAM_SLOTS);
const_assert_eq!(offset_of!(BlockCounters, counter), 0);

/// What the builder knows about a block.
#[derive(Clone, Debug)]
pub(crate) struct BlockInfo {
    /// The index of the block's terminating record, if the block was given a full stub.
    pub terminator: Option<InsIdx>,
    /// Does the block end in an indirect jump or call?
    pub indirect: bool,
}

pub(crate) struct ProfileTable {
    /// One entry per potential block. Never reallocated: stubs embed these addresses.
    counters: Box<[BlockCounters]>,
    info: IndexVec<BlockIdx, BlockInfo>,
}

impl ProfileTable {
    /// Create a table able to hold up to `capacity` blocks.
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            counters: (0..capacity).map(|_| BlockCounters::default()).collect(),
            info: IndexVec::with_capacity(capacity),
        }
    }

    /// Start a new block and return its id, or `None` if the table is full.
    pub(crate) fn new_block(&mut self) -> Option<BlockIdx> {
        if self.info.len() >= self.counters.len() {
            return None;
        }
        Some(self.info.push(BlockInfo {
            terminator: None,
            indirect: false,
        }))
    }

    pub(crate) fn num_blocks(&self) -> usize {
        self.info.len()
    }

    pub(crate) fn info(&self, b: BlockIdx) -> &BlockInfo {
        &self.info[b]
    }

    pub(crate) fn info_mut(&mut self, b: BlockIdx) -> &mut BlockInfo {
        &mut self.info[b]
    }

    pub(crate) fn blocks(&self) -> impl Iterator<Item = (BlockIdx, &BlockInfo)> {
        self.info.iter_enumerated()
    }

    pub(crate) fn counters(&self, b: BlockIdx) -> &BlockCounters {
        &self.counters[b.index()]
    }

    pub(crate) fn counter_addr(&self, b: BlockIdx) -> u64 {
        &self.counters(b).counter as *const AtomicU64 as u64
    }

    pub(crate) fn fallthrough_addr(&self, b: BlockIdx) -> u64 {
        &self.counters(b).fallthrough as *const AtomicU64 as u64
    }

    pub(crate) fn targets_addr(&self, b: BlockIdx) -> u64 {
        self.counters(b).targets.as_ptr() as u64
    }

    pub(crate) fn counts_addr(&self, b: BlockIdx) -> u64 {
        self.counters(b).counts.as_ptr() as u64
    }

    /// A snapshot of block `b`'s `(target, count)` histogram.
    pub(crate) fn histogram(&self, b: BlockIdx) -> [(u64, u64); HISTOGRAM_SLOTS] {
        let c = self.counters(b);
        std::array::from_fn(|i| {
            (
                c.targets[i].load(Ordering::Relaxed),
                c.counts[i].load(Ordering::Relaxed),
            )
        })
    }

    /// If block `b`'s histogram has a dominant target, return it.
    ///
    /// A target is dominant if the histogram's total count is at least `count_threshold`, its own
    /// share of that total is at least `percent_threshold`, and no other slot has as many hits.
    /// An even split is thus never dominant, whatever the threshold.
    pub(crate) fn dominant_target(
        &self,
        b: BlockIdx,
        count_threshold: u64,
        percent_threshold: u64,
    ) -> Option<u64> {
        let hist = self.histogram(b);
        let total = hist
            .iter()
            .fold(0u64, |acc, (_, n)| acc.saturating_add(*n));
        if total == 0 || total < count_threshold {
            return None;
        }
        let (hot, hot_count) = hist.iter().copied().max_by_key(|(_, n)| *n)?;
        if hist.iter().filter(|(_, n)| *n == hot_count).count() > 1 {
            return None;
        }
        if u128::from(hot_count) * 100 < u128::from(total) * u128::from(percent_threshold) {
            return None;
        }
        Some(hot)
    }
}
