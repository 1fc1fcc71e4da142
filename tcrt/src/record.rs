//! The instruction record store: an append-only table of relocated instructions.
//!
//! Records are appended in program order and never reordered or removed, so an [InsIdx] stays
//! valid for the lifetime of a generation. The fixup engine mutates records in place (their
//! bytes and new addresses change) but never moves them. A record whose length is zero is
//! "elided": it produces no output bytes, but keeps its slot, and branches to it land on the next
//! live record.

use crate::{
    codec::{self, BranchKind, Bytes, PATCH_SLOT_LEN},
    errors::TranslationError,
};
use iced_x86::{Instruction, Mnemonic};
use index_vec::IndexVec;
use std::ops::{Index, IndexMut};

index_vec::define_index_type! {
    /// The index of an [InstructionRecord] in a [RecordStore].
    pub struct InsIdx = u32;
}

index_vec::define_index_type! {
    /// A basic block id. Blocks are numbered in program order across all routines.
    pub struct BlockIdx = u32;
}

/// What role does a record play in the translated code?
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RecordKind {
    /// An instruction of the original program.
    Regular,
    /// The first record of a routine: the entry the host redirects to.
    RoutineHead,
    /// The original instruction that ends a profiled block.
    Terminating,
    /// Injected profiling code.
    Profiling,
    /// Injected devirtualisation guard.
    Optimization,
}

#[derive(Clone, Debug)]
pub(crate) struct InstructionRecord {
    /// The address this record was derived from: a program address in the first generation, a
    /// first-cache address in the second.
    pub orig_addr: u64,
    /// The address assigned by the most recent fixup pass.
    pub new_addr: u64,
    /// The instruction. For direct branches its branch target is rewritten by every fixup pass.
    pub inst: Instruction,
    /// The current encoding. Empty if the record is elided.
    pub bytes: Bytes,
    /// Bytes of `nop` padding laid out immediately before this record.
    pub pad: usize,
    /// The record this record's direct branch goes to, if it is inside the translated region.
    pub target: Option<InsIdx>,
    /// The address this record's direct branch goes to in the originating code (0 if none).
    pub orig_target: u64,
    pub kind: RecordKind,
    pub block: BlockIdx,
    pub branch: BranchKind,
    /// Is this a 5-byte `nop` slot that may later be overwritten by a `jmp rel32`? Such slots are
    /// 4-byte aligned so that publishing their first 4 bytes is a single aligned store.
    pub patch_slot: bool,
    /// Has this branch ever needed its long form? Once set, it is never shortened again, which
    /// keeps the fixup pass monotonic.
    pub long_branch: bool,
}

impl InstructionRecord {
    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }

    pub(crate) fn is_elided(&self) -> bool {
        self.bytes.is_empty()
    }

    pub(crate) fn elide(&mut self) {
        self.bytes.clear();
        self.pad = 0;
    }

    /// The address just beyond this record's bytes.
    pub(crate) fn end_addr(&self) -> u64 {
        self.new_addr + self.len() as u64
    }
}

#[derive(Debug)]
pub(crate) struct RecordStore {
    recs: IndexVec<InsIdx, InstructionRecord>,
    capacity: usize,
}

impl RecordStore {
    /// Create a store that may hold at most `capacity` records.
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            recs: IndexVec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `inst`, which was derived from code at `orig_addr`, and return its index. The
    /// instruction is encoded as if it stayed at `orig_addr`: the fixup engine deals with
    /// anything position dependent.
    pub(crate) fn append(
        &mut self,
        orig_addr: u64,
        mut inst: Instruction,
        kind: RecordKind,
        block: BlockIdx,
    ) -> Result<InsIdx, TranslationError> {
        if self.recs.len() >= self.capacity {
            return Err(TranslationError::CapacityExhausted(self.capacity));
        }
        inst.set_ip(orig_addr);
        let bytes = codec::encode(&inst, orig_addr, orig_addr)?;
        let branch = BranchKind::classify(&inst);
        let orig_target = if branch.is_direct() {
            inst.near_branch_target()
        } else {
            0
        };
        Ok(self.recs.push(InstructionRecord {
            orig_addr,
            new_addr: orig_addr,
            inst,
            bytes,
            pad: 0,
            target: None,
            orig_target,
            kind,
            block,
            branch,
            patch_slot: false,
            long_branch: false,
        }))
    }

    /// Append a reserved 5-byte `nop` patch slot.
    pub(crate) fn append_patch_slot(
        &mut self,
        orig_addr: u64,
        kind: RecordKind,
        block: BlockIdx,
    ) -> Result<InsIdx, TranslationError> {
        let nop = codec::decode_one(orig_addr, codec::nop_bytes(PATCH_SLOT_LEN))?;
        let idx = self.append(orig_addr, nop, kind, block)?;
        self.recs[idx].patch_slot = true;
        Ok(idx)
    }

    /// Insert an already-built record (used when deriving one generation from another).
    pub(crate) fn push(&mut self, rec: InstructionRecord) -> Result<InsIdx, TranslationError> {
        if self.recs.len() >= self.capacity {
            return Err(TranslationError::CapacityExhausted(self.capacity));
        }
        Ok(self.recs.push(rec))
    }

    pub(crate) fn len(&self) -> usize {
        self.recs.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &InstructionRecord> {
        self.recs.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut InstructionRecord> {
        self.recs.iter_mut()
    }

    pub(crate) fn iter_enumerated(&self) -> impl Iterator<Item = (InsIdx, &InstructionRecord)> {
        self.recs.iter_enumerated()
    }

    pub(crate) fn indices(&self) -> impl Iterator<Item = InsIdx> {
        self.recs.indices()
    }

    /// Derive the next generation from this laid out one. Each record is copied, with addresses
    /// reinterpreted: this generation's new addresses become the next generation's original
    /// addresses, and branch targets stay linked to the same indices. Profiling stubs, patch slots
    /// and `nop`s are elided.
    pub(crate) fn derive(&self) -> Result<RecordStore, TranslationError> {
        let mut next = RecordStore::with_capacity(self.capacity);
        for rec in self.recs.iter() {
            let mut r = rec.clone();
            r.orig_addr = rec.new_addr;
            if let Some(t) = rec.target {
                r.orig_target = self.recs[t].new_addr;
            }
            r.pad = 0;
            r.long_branch = false;
            if rec.kind == RecordKind::Profiling
                || rec.patch_slot
                || rec.inst.mnemonic() == Mnemonic::Nop
            {
                r.elide();
            }
            next.push(r)?;
        }
        Ok(next)
    }

    /// The address one byte past the last laid out record, or `start` if nothing is live.
    pub(crate) fn end_addr(&self, start: u64) -> u64 {
        self.recs.last().map(|r| r.end_addr()).unwrap_or(start)
    }
}

impl Index<InsIdx> for RecordStore {
    type Output = InstructionRecord;

    fn index(&self, idx: InsIdx) -> &Self::Output {
        &self.recs[idx]
    }
}

impl IndexMut<InsIdx> for RecordStore {
    fn index_mut(&mut self, idx: InsIdx) -> &mut Self::Output {
        &mut self.recs[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::{chain, ChainMap},
        instrument::Instrumentor,
        profile::ProfileTable,
        testing::{routine, SUM},
    };

    #[test]
    fn append_records_targets() {
        let mut s = RecordStore::with_capacity(4);
        let b = BlockIdx::new(0);
        // add rax, rdi
        let add = codec::decode_one(0x1000, &[0x48, 0x01, 0xF8]).unwrap();
        // jne -8 (to 0x1000)
        let jne = codec::decode_one(0x1003, &[0x75, 0xFB]).unwrap();
        let i = s.append(0x1000, add, RecordKind::Regular, b).unwrap();
        let j = s.append(0x1003, jne, RecordKind::Terminating, b).unwrap();
        assert_eq!(s[i].orig_target, 0);
        assert_eq!(s[i].bytes.as_slice(), &[0x48, 0x01, 0xF8]);
        assert_eq!(s[j].orig_target, 0x1000);
        assert_eq!(s[j].branch, BranchKind::Conditional);
        assert_eq!(s[j].len(), 2);
        assert!(s[j].target.is_none());
    }

    #[test]
    fn capacity_is_fatal() {
        let mut s = RecordStore::with_capacity(1);
        let b = BlockIdx::new(0);
        s.append_patch_slot(0x1000, RecordKind::RoutineHead, b)
            .unwrap();
        assert!(matches!(
            s.append_patch_slot(0x1000, RecordKind::RoutineHead, b),
            Err(TranslationError::CapacityExhausted(1))
        ));
    }

    #[test]
    fn patch_slots() {
        let mut s = RecordStore::with_capacity(2);
        let i = s
            .append_patch_slot(0x1000, RecordKind::RoutineHead, BlockIdx::new(0))
            .unwrap();
        assert!(s[i].patch_slot);
        assert_eq!(s[i].inst.mnemonic(), Mnemonic::Nop);
        assert_eq!(s[i].bytes.as_slice(), codec::nop_bytes(PATCH_SLOT_LEN));
        s[i].elide();
        assert!(s[i].is_elided());
        assert_eq!(s.end_addr(0x1000), 0x1000);
    }

    #[test]
    fn derive_reinterprets_addresses() {
        let mut gen1 = RecordStore::with_capacity(200);
        let mut profile = ProfileTable::with_capacity(16);
        Instrumentor::new(&mut gen1, &mut profile, true, false)
            .routine(&routine(0x1000, SUM))
            .unwrap();
        let map = ChainMap::build(&gen1);
        chain(&mut gen1, &map);
        // Fake a layout.
        let mut cursor = 0x9000;
        for r in gen1.iter_mut() {
            r.new_addr = cursor;
            cursor += r.len() as u64;
        }
        let gen2 = gen1.derive().unwrap();
        assert_eq!(gen2.len(), gen1.len());
        for ((r1, r2), i) in gen1.iter().zip(gen2.iter()).zip(gen1.indices()) {
            assert_eq!(r2.orig_addr, r1.new_addr);
            assert_eq!(r2.target, r1.target);
            if let Some(t) = r1.target {
                assert_eq!(r2.orig_target, gen1[t].new_addr);
            }
            let elided = r1.kind == RecordKind::Profiling || r1.patch_slot;
            assert_eq!(r2.is_elided(), elided, "{i:?}");
        }
        // All seven original instructions survive.
        assert_eq!(gen2.iter().filter(|r| !r.is_elided()).count(), 7);
    }
}
