//! The profiling instrumentor: turns a host's routines into first-generation records, decorating
//! block terminators with profiling stubs.
//!
//! A full stub, placed before a block's terminator, looks like:
//!
//! ```text
//!   nop5                     ; patch slot: later overwritten with `jmp` past the stub
//!   lea rsp, [rsp-128]       ; step over the red zone
//!   push rax
//!   push rbx                 ; } only for indirect terminators:
//!   push rcx                 ; }
//!   mov rax, <target>        ; } resolve the runtime target
//!   mov rbx, rax             ; }
//!   mov rcx, &targets        ; }
//! slot:                      ; }
//!   xor eax, eax             ; }
//!   lock cmpxchg [rcx], rbx  ; } claim an empty slot...
//!   je hit                   ; }
//!   cmp rax, rbx             ; } ...or find the target's own
//!   je hit                   ; }
//!   lea rcx, [rcx+8]         ; }
//!   mov rax, &targets[K]     ; }
//!   cmp rcx, rax             ; }
//!   jne slot                 ; }
//!   jmp done                 ; } every slot holds another target
//! hit:                       ; }
//!   mov rax, [rcx+8*K]       ; }
//!   lea rax, [rax+1]         ; }
//!   mov [rcx+8*K], rax       ; } count it
//! done:                      ; }
//!   pop rcx                  ; }
//!   pop rbx                  ; }
//!   mov rax, [&counter]
//!   lea rax, [rax+1]
//!   mov [&counter], rax
//!   pop rax
//!   lea rsp, [rsp+128]
//! ```
//!
//! Only the histogram clobbers flags, and indirect transfers don't pass flags to their targets.
//! Spilling to the stack, rather than to fixed memory cells, makes stubs safe to run from many
//! threads at once.
//!
//! Blocks ending in a conditional branch get a similar fallthrough stub just after the branch. A
//! block containing an instruction that overwrites `rax` without reading it, and ending in a
//! direct transfer, instead gets a cheaper counter stub right before that instruction: it needs
//! no spills at all.

use crate::{
    codec::{self, BranchKind, PATCH_SLOT_LEN},
    errors::TranslationError,
    host::Routine,
    patch,
    profile::{ProfileTable, HISTOGRAM_SLOTS},
    record::{BlockIdx, InsIdx, RecordKind, RecordStore},
};
use iced_x86::{Code, IcedError, Instruction, MemoryOperand, Register};
use std::collections::HashSet;

/// How far below `rsp` stubs start using the stack.
const RED_ZONE: i64 = 128;

pub(crate) struct Instrumentor<'a> {
    store: &'a mut RecordStore,
    profile: &'a mut ProfileTable,
    /// Inject profiling stubs and reserve probe slots?
    profiling: bool,
    /// Reserve probe slots before backward jumps too?
    probe_backward_jumps: bool,
}

impl<'a> Instrumentor<'a> {
    pub(crate) fn new(
        store: &'a mut RecordStore,
        profile: &'a mut ProfileTable,
        profiling: bool,
        probe_backward_jumps: bool,
    ) -> Self {
        Self {
            store,
            profile,
            profiling,
            probe_backward_jumps,
        }
    }

    /// Append records for every instruction of `rtn`.
    pub(crate) fn routine(&mut self, rtn: &Routine) -> Result<(), TranslationError> {
        let insts = &rtn.insts;
        let Some(last) = insts.last() else {
            return Ok(());
        };
        let (lo, hi) = (rtn.addr, last.next_ip());
        // Direct branch targets within the routine start new blocks.
        let targets = insts
            .iter()
            .filter(|inst| BranchKind::classify(inst).is_direct())
            .map(|inst| inst.near_branch_target())
            .filter(|t| (lo..hi).contains(t))
            .collect::<HashSet<_>>();
        let terminates = |i: usize| {
            BranchKind::classify(&insts[i]).terminates_block()
                || insts
                    .get(i + 1)
                    .is_some_and(|next| targets.contains(&next.ip()))
        };

        let mut block = None;
        let mut counted = false;
        for (i, inst) in insts.iter().enumerate() {
            let addr = inst.ip();
            let branch = BranchKind::classify(inst);
            let b = match block {
                Some(b) => b,
                None => {
                    let b = self
                        .profile
                        .new_block()
                        .ok_or(TranslationError::CapacityExhausted(self.store.capacity()))?;
                    block = Some(b);
                    b
                }
            };
            let ends_block = terminates(i);

            if self.profiling {
                if i == 0 {
                    self.store
                        .append_patch_slot(addr, RecordKind::RoutineHead, b)?;
                } else if self.probe_backward_jumps
                    && matches!(branch, BranchKind::DirectJump | BranchKind::Conditional)
                    && inst.near_branch_target() < addr
                {
                    self.store.append_patch_slot(addr, RecordKind::Regular, b)?;
                }

                if !counted && codec::kills_rax(inst) {
                    let j = (i..insts.len()).find(|j| terminates(*j));
                    let direct_end = j.is_some_and(|j| {
                        let k = BranchKind::classify(&insts[j]);
                        !k.is_indirect() && k != BranchKind::Return
                    });
                    if direct_end {
                        self.rax_counter_stub(addr, b)?;
                        counted = true;
                    }
                }
                if ends_block && !counted {
                    self.block_stub(addr, b, inst, branch)?;
                }
            }

            let kind = if i == 0 && !self.profiling {
                RecordKind::RoutineHead
            } else if ends_block {
                RecordKind::Terminating
            } else {
                RecordKind::Regular
            };
            let idx = self.store.append(addr, *inst, kind, b)?;

            if ends_block {
                if self.profiling {
                    if !counted {
                        self.profile.info_mut(b).terminator = Some(idx);
                    }
                    if branch == BranchKind::Conditional {
                        self.fallthrough_stub(addr, b)?;
                    }
                }
                block = None;
                counted = false;
            }
        }
        Ok(())
    }

    fn push(
        &mut self,
        addr: u64,
        b: BlockIdx,
        inst: Instruction,
    ) -> Result<InsIdx, TranslationError> {
        self.store.append(addr, inst, RecordKind::Profiling, b)
    }

    /// `mov rax, [counter]; lea rax, [rax+1]; mov [counter], rax`.
    fn bump(&mut self, addr: u64, b: BlockIdx, counter: u64) -> Result<(), TranslationError> {
        let cell = MemoryOperand::with_displ(counter, 8);
        self.push(
            addr,
            b,
            codec::build(Instruction::with2(Code::Mov_RAX_moffs64, Register::RAX, cell), addr)?,
        )?;
        self.push(
            addr,
            b,
            codec::build(
                Instruction::with2(
                    Code::Lea_r64_m,
                    Register::RAX,
                    MemoryOperand::with_base_displ(Register::RAX, 1),
                ),
                addr,
            )?,
        )?;
        self.push(
            addr,
            b,
            codec::build(Instruction::with2(Code::Mov_moffs64_RAX, cell, Register::RAX), addr)?,
        )?;
        Ok(())
    }

    /// `lea rsp, [rsp+delta]`.
    fn adjust_rsp(&mut self, addr: u64, b: BlockIdx, delta: i64) -> Result<(), TranslationError> {
        let inst = codec::build(
            Instruction::with2(
                Code::Lea_r64_m,
                Register::RSP,
                MemoryOperand::with_base_displ(Register::RSP, delta),
            ),
            addr,
        )?;
        self.push(addr, b, inst)?;
        Ok(())
    }

    fn push_reg(&mut self, addr: u64, b: BlockIdx, reg: Register) -> Result<(), TranslationError> {
        self.push(addr, b, codec::build(Instruction::with1(Code::Push_r64, reg), addr)?)?;
        Ok(())
    }

    fn pop_reg(&mut self, addr: u64, b: BlockIdx, reg: Register) -> Result<(), TranslationError> {
        self.push(addr, b, codec::build(Instruction::with1(Code::Pop_r64, reg), addr)?)?;
        Ok(())
    }

    /// A counter stub before an instruction that overwrites `rax`.
    fn rax_counter_stub(&mut self, addr: u64, b: BlockIdx) -> Result<(), TranslationError> {
        self.store.append_patch_slot(addr, RecordKind::Profiling, b)?;
        self.bump(addr, b, self.profile.counter_addr(b))
    }

    /// The fallthrough counter stub after a conditional branch at `addr`.
    fn fallthrough_stub(&mut self, addr: u64, b: BlockIdx) -> Result<(), TranslationError> {
        self.store.append_patch_slot(addr, RecordKind::Profiling, b)?;
        self.adjust_rsp(addr, b, -RED_ZONE)?;
        self.push_reg(addr, b, Register::RAX)?;
        self.bump(addr, b, self.profile.fallthrough_addr(b))?;
        self.pop_reg(addr, b, Register::RAX)?;
        self.adjust_rsp(addr, b, RED_ZONE)
    }

    /// The full stub before the terminator `term` of block `b`.
    fn block_stub(
        &mut self,
        addr: u64,
        b: BlockIdx,
        term: &Instruction,
        branch: BranchKind,
    ) -> Result<(), TranslationError> {
        self.store.append_patch_slot(addr, RecordKind::Profiling, b)?;
        self.adjust_rsp(addr, b, -RED_ZONE)?;
        self.push_reg(addr, b, Register::RAX)?;

        // The instruction loading the runtime target into `rax`, if we can build one.
        let load = match branch {
            BranchKind::IndirectRegister { reg, .. } if reg == Register::RAX => {
                Some(None)
            }
            BranchKind::IndirectRegister { reg, .. } if reg != Register::RSP => Some(Some(
                codec::build(Instruction::with2(Code::Mov_r64_rm64, Register::RAX, reg), addr)?,
            )),
            BranchKind::IndirectMemory { .. } => Some(Some(codec::build(
                Instruction::with2(
                    Code::Mov_r64_rm64,
                    Register::RAX,
                    codec::memory_operand(term, RED_ZONE + 3 * 8),
                ),
                addr,
            )?)),
            _ => None,
        };
        if let Some(load) = load {
            self.profile.info_mut(b).indirect = true;
            self.push_reg(addr, b, Register::RBX)?;
            self.push_reg(addr, b, Register::RCX)?;
            if let Some(load) = load {
                self.push(addr, b, load)?;
            }
            self.histogram(addr, b)?;
            self.pop_reg(addr, b, Register::RCX)?;
            self.pop_reg(addr, b, Register::RBX)?;
        }

        self.bump(addr, b, self.profile.counter_addr(b))?;
        self.pop_reg(addr, b, Register::RAX)?;
        self.adjust_rsp(addr, b, RED_ZONE)
    }

    /// Record the target in `rax` in block `b`'s histogram. Clobbers `rax`, `rbx`, `rcx`.
    ///
    /// Slots are claimed with `lock cmpxchg`, so a slot only ever holds one target. A target
    /// arriving when every slot holds another is not counted. Branches out of the histogram go
    /// to the record appended right after it.
    fn histogram(&mut self, addr: u64, b: BlockIdx) -> Result<(), TranslationError> {
        let targets = self.profile.targets_addr(b);
        let end = targets + 8 * HISTOGRAM_SLOTS as u64;
        let to_count = (self.profile.counts_addr(b) - targets) as i64;
        let count = MemoryOperand::with_base_displ(Register::RCX, to_count);

        self.push_inst(
            addr,
            b,
            Instruction::with2(Code::Mov_r64_rm64, Register::RBX, Register::RAX),
        )?;
        self.push_inst(
            addr,
            b,
            Instruction::with2(Code::Mov_r64_imm64, Register::RCX, targets),
        )?;
        let slot = self.push_inst(
            addr,
            b,
            Instruction::with2(Code::Xor_r32_rm32, Register::EAX, Register::EAX),
        )?;
        let mut cmpxchg = codec::build(
            Instruction::with2(
                Code::Cmpxchg_rm64_r64,
                MemoryOperand::with_base(Register::RCX),
                Register::RBX,
            ),
            addr,
        )?;
        cmpxchg.set_has_lock_prefix(true);
        self.push(addr, b, cmpxchg)?;
        // Claimed an empty slot, or found our own target in it.
        let claimed = self.push_branch(addr, b, Code::Je_rel32_64)?;
        self.push_inst(
            addr,
            b,
            Instruction::with2(Code::Cmp_r64_rm64, Register::RAX, Register::RBX),
        )?;
        let found = self.push_branch(addr, b, Code::Je_rel32_64)?;
        self.push_inst(
            addr,
            b,
            Instruction::with2(
                Code::Lea_r64_m,
                Register::RCX,
                MemoryOperand::with_base_displ(Register::RCX, 8),
            ),
        )?;
        self.push_inst(addr, b, Instruction::with2(Code::Mov_r64_imm64, Register::RAX, end))?;
        self.push_inst(
            addr,
            b,
            Instruction::with2(Code::Cmp_r64_rm64, Register::RCX, Register::RAX),
        )?;
        let next = self.push_branch(addr, b, Code::Jne_rel32_64)?;
        let full = self.push_branch(addr, b, Code::Jmp_rel32_64)?;
        let hit = self.push_inst(
            addr,
            b,
            Instruction::with2(Code::Mov_r64_rm64, Register::RAX, count),
        )?;
        self.push_inst(
            addr,
            b,
            Instruction::with2(
                Code::Lea_r64_m,
                Register::RAX,
                MemoryOperand::with_base_displ(Register::RAX, 1),
            ),
        )?;
        let last = self.push_inst(
            addr,
            b,
            Instruction::with2(Code::Mov_rm64_r64, count, Register::RAX),
        )?;

        self.store[claimed].target = Some(hit);
        self.store[found].target = Some(hit);
        self.store[next].target = Some(slot);
        self.store[full].target = Some(last + 1);
        Ok(())
    }

    fn push_inst(
        &mut self,
        addr: u64,
        b: BlockIdx,
        inst: Result<Instruction, IcedError>,
    ) -> Result<InsIdx, TranslationError> {
        self.push(addr, b, codec::build(inst, addr)?)
    }

    /// A branch whose target record is set by the caller.
    fn push_branch(
        &mut self,
        addr: u64,
        b: BlockIdx,
        code: Code,
    ) -> Result<InsIdx, TranslationError> {
        self.push(addr, b, codec::placeholder_branch(code, addr)?)
    }
}

/// The address a profiling stub headed by `head` should skip to: the first record after it that
/// isn't part of the same stub.
pub(crate) fn stub_end(store: &RecordStore, head: InsIdx) -> u64 {
    store
        .indices()
        .skip(head.index() + 1)
        .find(|i| store[*i].kind != RecordKind::Profiling || store[*i].patch_slot)
        .map(|i| store[i].new_addr)
        .unwrap_or_else(|| store.end_addr(store[head].end_addr()))
}

/// Turn off profiling in the laid out, committed cache described by `store`, by overwriting every
/// profiling stub's patch slot with a jump past the stub. Returns the number of stubs disabled.
///
/// # Safety
///
/// `store` must describe code that has been committed to executable memory.
pub(crate) unsafe fn disable_profiling(store: &RecordStore) -> Result<usize, TranslationError> {
    let mut n = 0;
    for (idx, rec) in store.iter_enumerated() {
        if rec.kind != RecordKind::Profiling || !rec.patch_slot || rec.is_elided() {
            continue;
        }
        let to = stub_end(store, idx);
        let jmp = codec::jmp_rel32(rec.new_addr, to).ok_or_else(|| {
            TranslationError::Internal(format!(
                "profiling stub at 0x{:x} can't reach 0x{to:x}",
                rec.new_addr
            ))
        })?;
        debug_assert_eq!(rec.len(), PATCH_SLOT_LEN);
        unsafe { patch::publish(rec.new_addr, &jmp)? };
        n += 1;
    }
    Ok(n)
}
