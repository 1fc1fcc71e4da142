//! The exit table: absolute addresses of branch targets outside the translated region.
//!
//! A relocated direct branch whose target is not in the translated region can't, in general,
//! reach that target with a 32-bit displacement. Instead it becomes an indirect branch through a
//! cell of this table, addressed RIP-relatively. Cells are allocated densely from slot 0 and are
//! deduplicated by target, so every allocated cell is referenced by at least one branch.
//!
//! Cells are written once, before any code referencing them is published, and never changed.

use crate::errors::TranslationError;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

pub(crate) struct ExitTable {
    /// The address of slot 0.
    base: u64,
    /// How many cells fit in the table?
    capacity: usize,
    /// Maps a target address to its slot.
    slots: HashMap<u64, usize>,
}

impl ExitTable {
    /// Create a table over `capacity` cells of executable memory starting at `base`, which must
    /// be 8-byte aligned and remain mapped for the table's lifetime.
    pub(crate) fn new(base: u64, capacity: usize) -> Self {
        debug_assert_eq!(base % 8, 0);
        Self {
            base,
            capacity,
            slots: HashMap::new(),
        }
    }

    /// The size, in bytes, of a table with `capacity` cells.
    pub(crate) fn size_of(capacity: usize) -> usize {
        capacity * 8
    }

    /// Return the address of the cell holding `target`, allocating one if needed.
    pub(crate) fn cell_for(&mut self, target: u64) -> Result<u64, TranslationError> {
        if let Some(slot) = self.slots.get(&target) {
            return Ok(self.cell_addr(*slot));
        }
        let slot = self.slots.len();
        if slot >= self.capacity {
            return Err(TranslationError::CacheOverflow {
                need: Self::size_of(slot + 1),
                have: Self::size_of(self.capacity),
            });
        }
        let addr = self.cell_addr(slot);
        unsafe { &*(addr as *const AtomicU64) }.store(target, Ordering::Release);
        self.slots.insert(target, slot);
        Ok(addr)
    }

    /// How many cells have been allocated?
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    fn cell_addr(&self, slot: usize) -> u64 {
        self.base + (slot as u64) * 8
    }
}
