//! The devirtualisation optimiser.
//!
//! For every block of the first generation that ends in an indirect jump or call with a dominant
//! target inside the translated region, the second generation gets a guard in the space freed by
//! the block's (elided) profiling stub:
//!
//! ```text
//!   cmp reg, hot             ; or, for a memory operand, load it into a spilled rax first
//!   jne fallback             ; the original indirect transfer
//!   jmp/call hot             ; a direct transfer to the hot target's record
//!   jmp after                ; calls only: skip the original transfer on return
//! ```
//!
//! If `hot` doesn't fit a sign-extended 32-bit immediate, the compare reads it from an exit-table
//! cell instead. A mispredicted guard always falls through to the original transfer, so the
//! speculation never affects correctness.

use crate::{
    chain::ChainMap,
    codec::{self, BranchKind},
    errors::TranslationError,
    exits::ExitTable,
    profile::ProfileTable,
    record::{BlockIdx, InsIdx, RecordKind, RecordStore},
};
use iced_x86::{Code, Instruction, MemoryOperand, Register};

/// How far below `rsp` guards start using the stack.
const RED_ZONE: i64 = 128;

pub(crate) struct Devirtualiser<'a> {
    /// The second generation, freshly derived from the first.
    store: &'a mut RecordStore,
    /// The first generation's profile.
    profile: &'a ProfileTable,
    /// Original program addresses to (first generation) record indices.
    map: &'a ChainMap,
    exits: &'a mut ExitTable,
    count_threshold: u64,
    percent_threshold: u64,
}

impl<'a> Devirtualiser<'a> {
    pub(crate) fn new(
        store: &'a mut RecordStore,
        profile: &'a ProfileTable,
        map: &'a ChainMap,
        exits: &'a mut ExitTable,
        count_threshold: u64,
        percent_threshold: u64,
    ) -> Self {
        Self {
            store,
            profile,
            map,
            exits,
            count_threshold,
            percent_threshold,
        }
    }

    /// Guard every eligible block. Returns the blocks rewritten.
    pub(crate) fn run(&mut self) -> Result<Vec<BlockIdx>, TranslationError> {
        let mut done = Vec::new();
        let candidates = self
            .profile
            .blocks()
            .filter(|(_, info)| info.indirect)
            .filter_map(|(b, info)| info.terminator.map(|t| (b, t)))
            .collect::<Vec<_>>();
        for (b, term) in candidates {
            let Some(hot) =
                self.profile
                    .dominant_target(b, self.count_threshold, self.percent_threshold)
            else {
                continue;
            };
            let Some(hot_idx) = self.map.get(hot) else {
                continue;
            };
            if self.guard(b, term, hot, hot_idx)? {
                done.push(b);
            }
        }
        Ok(done)
    }

    /// Write a guard for `term` speculating on `hot`. Returns `false` if the block can't be
    /// guarded.
    fn guard(
        &mut self,
        b: BlockIdx,
        term: InsIdx,
        hot: u64,
        hot_idx: InsIdx,
    ) -> Result<bool, TranslationError> {
        let term_rec = &self.store[term];
        let orig = term_rec.orig_addr;
        let (call, reg) = match term_rec.branch {
            BranchKind::IndirectRegister { call, reg } if reg != Register::RSP => (call, Some(reg)),
            BranchKind::IndirectMemory { call } => (call, None),
            _ => return Ok(false),
        };
        let after = term + 1;
        if call && after.index() >= self.store.len() {
            return Ok(false);
        }

        // Each guard instruction, with the record it branches to, if any.
        let mut guard: Vec<(Instruction, Option<InsIdx>)> = Vec::new();
        let cmp_reg = match reg {
            Some(reg) => reg,
            None => {
                let load = Instruction::with2(
                    Code::Mov_r64_rm64,
                    Register::RAX,
                    codec::memory_operand(&term_rec.inst, RED_ZONE + 8),
                );
                guard.push((lea_rsp(-RED_ZONE, orig)?, None));
                let push = Instruction::with1(Code::Push_r64, Register::RAX);
                guard.push((codec::build(push, orig)?, None));
                guard.push((codec::build(load, orig)?, None));
                Register::RAX
            }
        };
        let cmp = match i32::try_from(hot as i64) {
            Ok(imm) => Instruction::with2(Code::Cmp_rm64_imm32, cmp_reg, imm),
            Err(_) => {
                let cell = self.exits.cell_for(hot)?;
                Instruction::with2(
                    Code::Cmp_r64_rm64,
                    cmp_reg,
                    MemoryOperand::with_base_displ(Register::RIP, cell as i64),
                )
            }
        };
        guard.push((codec::build(cmp, orig)?, None));
        if reg.is_none() {
            let pop = Instruction::with1(Code::Pop_r64, Register::RAX);
            guard.push((codec::build(pop, orig)?, None));
            guard.push((lea_rsp(RED_ZONE, orig)?, None));
        }
        guard.push((codec::placeholder_branch(Code::Jne_rel32_64, orig)?, Some(term)));
        let direct = if call { Code::Call_rel32_64 } else { Code::Jmp_rel32_64 };
        guard.push((codec::placeholder_branch(direct, orig)?, Some(hot_idx)));
        if call {
            guard.push((codec::placeholder_branch(Code::Jmp_rel32_64, orig)?, Some(after)));
        }

        // The guard overwrites the tail of the block's stub.
        let Some(first) = term.index().checked_sub(guard.len()) else {
            return Ok(false);
        };
        let slots = (first..term.index()).map(InsIdx::new).collect::<Vec<_>>();
        if !slots
            .iter()
            .all(|i| self.store[*i].kind == RecordKind::Profiling && self.store[*i].block == b)
        {
            return Ok(false);
        }
        for (i, (inst, target)) in slots.into_iter().zip(guard) {
            let orig_target = target.map(|t| self.store[t].orig_addr).unwrap_or(0);
            let rec = &mut self.store[i];
            rec.bytes = codec::encode(&inst, rec.orig_addr, rec.orig_addr)?;
            rec.inst = inst;
            rec.branch = BranchKind::classify(&inst);
            rec.kind = RecordKind::Optimization;
            rec.target = target;
            rec.orig_target = orig_target;
            rec.patch_slot = false;
            rec.long_branch = false;
        }
        Ok(true)
    }
}

fn lea_rsp(delta: i64, orig: u64) -> Result<Instruction, TranslationError> {
    codec::build(
        Instruction::with2(
            Code::Lea_r64_m,
            Register::RSP,
            MemoryOperand::with_base_displ(Register::RSP, delta),
        ),
        orig,
    )
}
