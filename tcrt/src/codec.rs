//! The instruction codec: decoding routines, classifying control transfers, and encoding
//! (relocated or synthesised) instructions. All x64 knowledge is delegated to [iced_x86].

use crate::errors::TranslationError;
use iced_x86::{
    Code, Decoder, DecoderOptions, Encoder, FlowControl, Formatter, IcedError, Instruction,
    IntelFormatter, MemoryOperand, Mnemonic, OpKind, Register,
};
use smallvec::SmallVec;

/// Encoded bytes of a single instruction (or a short composite sequence).
pub(crate) type Bytes = SmallVec<[u8; 16]>;

/// The length of a reserved patch slot: a multi-byte `nop` exactly as long as `jmp rel32`.
pub(crate) const PATCH_SLOT_LEN: usize = 5;

/// Return a single `nop` instruction of `n` bytes (`1 <= n <= 9`).
///
/// # Panics
///
/// If `n` is outside `1..=9`.
pub(crate) fn nop_bytes(n: usize) -> &'static [u8] {
    // From https://en.wikipedia.org/wiki/NOP_(code)
    match n {
        1 => &[0x90],
        2 => &[0x66, 0x90],
        3 => &[0x0F, 0x1F, 0x00],
        4 => &[0x0F, 0x1F, 0x40, 0x00],
        5 => &[0x0F, 0x1F, 0x44, 0x00, 0x00],
        6 => &[0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00],
        7 => &[0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00],
        8 => &[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
        9 => &[0x66, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
        _ => panic!("no {n} byte nop"),
    }
}

/// Decode every instruction in `bytes`, which are located at virtual address `addr`.
pub(crate) fn decode_routine(
    addr: u64,
    bytes: &[u8],
) -> Result<Vec<Instruction>, TranslationError> {
    let mut dec = Decoder::with_ip(64, bytes, addr, DecoderOptions::NONE);
    let mut insts = Vec::new();
    while dec.can_decode() {
        let ip = dec.ip();
        let inst = dec.decode();
        if inst.is_invalid() {
            return Err(TranslationError::Decode { addr: ip });
        }
        insts.push(inst);
    }
    Ok(insts)
}

/// Decode the single instruction at the start of `bytes`.
pub(crate) fn decode_one(ip: u64, bytes: &[u8]) -> Result<Instruction, TranslationError> {
    let inst = Decoder::with_ip(64, bytes, ip, DecoderOptions::NONE).decode();
    if inst.is_invalid() {
        return Err(TranslationError::Decode { addr: ip });
    }
    Ok(inst)
}

/// Encode `inst` as if it were located at `ip`. `orig` is only used for error reporting.
pub(crate) fn encode(inst: &Instruction, ip: u64, orig: u64) -> Result<Bytes, TranslationError> {
    let mut enc = Encoder::new(64);
    enc.encode(inst, ip).map_err(|e| TranslationError::Encode {
        addr: orig,
        msg: e.to_string(),
    })?;
    Ok(Bytes::from_vec(enc.take_buffer()))
}

/// Turn the result of one of iced's `Instruction::with*` constructors into our error type.
pub(crate) fn build(
    inst: Result<Instruction, IcedError>,
    orig: u64,
) -> Result<Instruction, TranslationError> {
    inst.map_err(|e| TranslationError::Encode {
        addr: orig,
        msg: e.to_string(),
    })
}

/// The bytes of `jmp rel32` located at `from` and jumping to `to`, or `None` if `to` is out of
/// range.
pub(crate) fn jmp_rel32(from: u64, to: u64) -> Option<[u8; PATCH_SLOT_LEN]> {
    let next = from.checked_add(u64::try_from(PATCH_SLOT_LEN).ok()?)?;
    let disp = i32::try_from(i128::from(to) - i128::from(next)).ok()?;
    let d = disp.to_le_bytes();
    Some([0xE9, d[0], d[1], d[2], d[3]])
}

/// A placeholder relative branch with opcode `code`, to be retargeted by the fixup engine.
pub(crate) fn placeholder_branch(code: Code, orig: u64) -> Result<Instruction, TranslationError> {
    build(Instruction::with_branch(code, orig), orig)
}

/// `jmp`/`call qword ptr [rip + cell]`.
pub(crate) fn via_cell(call: bool, cell: u64, orig: u64) -> Result<Instruction, TranslationError> {
    let code = if call { Code::Call_rm64 } else { Code::Jmp_rm64 };
    build(
        Instruction::with1(code, MemoryOperand::with_base_displ(Register::RIP, cell as i64)),
        orig,
    )
}

/// The short conditional branch taken exactly when `jcc` is not taken, located at `ip` and
/// jumping `skip` bytes beyond its own end.
pub(crate) fn reversed_jcc(jcc: &Instruction, ip: u64, skip: u64) -> Instruction {
    let mut inst = *jcc;
    inst.negate_condition_code();
    inst.as_short_branch();
    inst.set_near_branch64(ip + 2 + skip);
    inst
}

/// Rebuild the memory operand of `inst`, with an extra `rsp_shift` added to the displacement if
/// it is `rsp`-based. Stubs that have pushed to the stack use this to re-read the operand.
pub(crate) fn memory_operand(inst: &Instruction, rsp_shift: i64) -> MemoryOperand {
    let base = inst.memory_base();
    let mut displ = inst.memory_displacement64() as i64;
    let mut displ_size = inst.memory_displ_size();
    if base == Register::RSP && rsp_shift != 0 {
        displ += rsp_shift;
        // In 64-bit mode a sign-extended disp32 is displacement size 8.
        displ_size = if i8::try_from(displ).is_ok() { 1 } else { 8 };
    }
    MemoryOperand::new(
        base,
        inst.memory_index(),
        inst.memory_index_scale(),
        displ,
        displ_size,
        false,
        inst.segment_prefix(),
    )
}

/// How an instruction transfers control, if at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BranchKind {
    NotBranch,
    /// `jmp rel8/rel32`.
    DirectJump,
    /// `call rel32`.
    DirectCall,
    /// `jcc rel8/rel32`.
    Conditional,
    /// `loop`, `loope`, `loopne` and `jrcxz`. These only exist with 8-bit displacements.
    LoopForm,
    /// `jmp reg` / `call reg`.
    IndirectRegister { call: bool, reg: Register },
    /// `jmp [mem]` / `call [mem]`.
    IndirectMemory { call: bool },
    Return,
}

impl BranchKind {
    pub(crate) fn classify(inst: &Instruction) -> Self {
        let near = matches!(
            inst.op0_kind(),
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64
        );
        match inst.flow_control() {
            FlowControl::UnconditionalBranch if near => Self::DirectJump,
            // `syscall` and friends are "calls" with no branch operand.
            FlowControl::Call if near => Self::DirectCall,
            FlowControl::ConditionalBranch if near => match inst.mnemonic() {
                Mnemonic::Loop
                | Mnemonic::Loope
                | Mnemonic::Loopne
                | Mnemonic::Jcxz
                | Mnemonic::Jecxz
                | Mnemonic::Jrcxz => Self::LoopForm,
                _ => Self::Conditional,
            },
            fc @ (FlowControl::IndirectBranch | FlowControl::IndirectCall) => {
                let call = fc == FlowControl::IndirectCall;
                match inst.op0_kind() {
                    OpKind::Register => Self::IndirectRegister {
                        call,
                        reg: inst.op0_register(),
                    },
                    _ => Self::IndirectMemory { call },
                }
            }
            FlowControl::Return => Self::Return,
            _ => Self::NotBranch,
        }
    }

    /// Does this instruction end a basic block?
    pub(crate) fn terminates_block(&self) -> bool {
        *self != Self::NotBranch
    }

    /// Does this instruction carry a relative displacement to a target?
    pub(crate) fn is_direct(&self) -> bool {
        matches!(
            self,
            Self::DirectJump | Self::DirectCall | Self::Conditional | Self::LoopForm
        )
    }

    pub(crate) fn is_indirect(&self) -> bool {
        matches!(
            self,
            Self::IndirectRegister { .. } | Self::IndirectMemory { .. }
        )
    }
}

/// Does `inst` overwrite all of `rax` without reading it first? If so, `rax` is free for scratch
/// use immediately before `inst`.
pub(crate) fn kills_rax(inst: &Instruction) -> bool {
    if !matches!(inst.mnemonic(), Mnemonic::Mov | Mnemonic::Lea)
        || inst.op_count() != 2
        || inst.op0_kind() != OpKind::Register
        || inst.op0_register() != Register::RAX
    {
        return false;
    }
    match inst.op1_kind() {
        OpKind::Register => inst.op1_register().full_register() != Register::RAX,
        OpKind::Memory => {
            inst.memory_base().full_register() != Register::RAX
                && inst.memory_index().full_register() != Register::RAX
        }
        _ => true,
    }
}

/// An Intel syntax formatter configured for our dumps.
pub(crate) fn formatter() -> IntelFormatter {
    let mut fmtr = IntelFormatter::new();
    fmtr.options_mut().set_branch_leading_zeros(false);
    fmtr.options_mut().set_show_branch_size(false);
    fmtr.options_mut().set_hex_prefix("0x");
    fmtr.options_mut().set_hex_suffix("");
    fmtr.options_mut().set_uppercase_hex(false);
    fmtr.options_mut().set_space_after_operand_separator(true);
    fmtr
}

pub(crate) fn disasm(fmtr: &mut IntelFormatter, inst: &Instruction) -> String {
    let mut s = String::new();
    fmtr.format(inst, &mut s);
    s
}
