//! The displacement fixup engine.
//!
//! Relocating code invalidates every relative encoding in it. Each pass of [fixup]:
//!
//!   1. lays records out from `start`, giving each its tentative new address;
//!   2. re-encodes every position dependent record at its new address:
//!      - a RIP-relative memory operand becomes an absolute 32-bit displacement if the address it
//!        refers to allows, and is otherwise re-encoded RIP-relative from the new address;
//!      - a direct branch to a record gets a displacement to that record's new address, in the
//!        shortest form available (`jmp` may be short; `jcc` and `call` are always near; the
//!        `loop` family only has a short form);
//!      - a direct branch out of the translated region goes indirectly through an exit-table
//!        cell.
//!
//! Passes repeat until one changes no record's size. A `jmp` that once needed its near form keeps
//! it, so sizes only grow and the loop must terminate. If it doesn't within [MAX_PASSES], an
//! encoding is inconsistent and the generation is abandoned.
//!
//! Fixup mutates records in place and must have exclusive access to the generation's store: two
//! fixups never run concurrently on the same generation.

use crate::{
    codec::{self, BranchKind, Bytes},
    errors::TranslationError,
    exits::ExitTable,
    record::{InstructionRecord, RecordStore},
};
use iced_x86::{Instruction, Register};

pub(crate) const MAX_PASSES: usize = 64;

/// The length of `jmp qword ptr [rip+disp32]`.
const INDIRECT_JMP_LEN: u64 = 6;

/// Lay out `store` from `start` and make every encoding valid at its new address. Returns the
/// number of passes needed.
pub(crate) fn fixup(
    store: &mut RecordStore,
    exits: &mut ExitTable,
    start: u64,
) -> Result<usize, TranslationError> {
    for pass in 1..=MAX_PASSES {
        let mut changed = assign_addresses(store, start);
        let idxs = store.indices().collect::<Vec<_>>();
        for idx in idxs {
            let rec = &store[idx];
            if rec.is_elided() {
                continue;
            }
            let target_addr = rec.target.map(|t| store[t].new_addr);
            if let Some((inst, bytes, long)) = reencode(rec, target_addr, exits)? {
                let rec = &mut store[idx];
                changed |= bytes.len() != rec.len();
                rec.inst = inst;
                rec.bytes = bytes;
                rec.long_branch |= long;
            }
        }
        if !changed {
            return Ok(pass);
        }
    }
    Err(TranslationError::NoConvergence(MAX_PASSES))
}

/// Assign each record its tentative address. Patch slots are aligned to 4 bytes with `nop`
/// padding. Returns `true` if any padding changed.
fn assign_addresses(store: &mut RecordStore, start: u64) -> bool {
    let mut changed = false;
    let mut cursor = start;
    for rec in store.iter_mut() {
        if rec.is_elided() {
            rec.new_addr = cursor;
            continue;
        }
        let pad = if rec.patch_slot {
            usize::try_from((4 - cursor % 4) % 4).unwrap_or(0)
        } else {
            0
        };
        changed |= pad != rec.pad;
        rec.pad = pad;
        rec.new_addr = cursor + pad as u64;
        cursor = rec.end_addr();
    }
    changed
}

/// Compute `rec`'s encoding at its current address. Returns `None` if the record is position
/// independent, otherwise its (possibly updated) instruction, its bytes, and whether it is a
/// branch that has now needed its long form.
fn reencode(
    rec: &InstructionRecord,
    target_addr: Option<u64>,
    exits: &mut ExitTable,
) -> Result<Option<(Instruction, Bytes, bool)>, TranslationError> {
    let ip = rec.new_addr;
    if rec.branch.is_direct() && rec.orig_target != 0 {
        let mut inst = rec.inst;
        let Some(target) = target_addr else {
            let bytes = external_branch(rec, exits)?;
            return Ok(Some((inst, bytes, false)));
        };
        inst.set_near_branch64(target);
        return match rec.branch {
            BranchKind::DirectJump => {
                if !rec.long_branch {
                    let mut short = inst;
                    short.as_short_branch();
                    if let Ok(bytes) = codec::encode(&short, ip, rec.orig_addr) {
                        return Ok(Some((short, bytes, false)));
                    }
                }
                inst.as_near_branch();
                let bytes = codec::encode(&inst, ip, rec.orig_addr)?;
                Ok(Some((inst, bytes, true)))
            }
            BranchKind::LoopForm => {
                let bytes = codec::encode(&inst, ip, rec.orig_addr)?;
                Ok(Some((inst, bytes, false)))
            }
            _ => {
                inst.as_near_branch();
                let bytes = codec::encode(&inst, ip, rec.orig_addr)?;
                Ok(Some((inst, bytes, false)))
            }
        };
    }

    if rec.inst.is_ip_rel_memory_operand() {
        let mut inst = rec.inst;
        let abs = inst.memory_displacement64();
        if i32::try_from(abs as i64).is_ok() {
            // Size 8 is a sign-extended disp32 with no base: no address size prefix.
            inst.set_memory_base(Register::None);
            inst.set_memory_displ_size(8);
        }
        let bytes = codec::encode(&inst, ip, rec.orig_addr)?;
        return Ok(Some((inst, bytes, false)));
    }

    Ok(None)
}

/// Encode a direct branch to `rec.orig_target`, which is outside the translated region, as an
/// indirect branch through the exit table.
fn external_branch(
    rec: &InstructionRecord,
    exits: &mut ExitTable,
) -> Result<Bytes, TranslationError> {
    let ip = rec.new_addr;
    let cell = exits.cell_for(rec.orig_target)?;
    match rec.branch {
        BranchKind::DirectJump | BranchKind::DirectCall => {
            let call = rec.branch == BranchKind::DirectCall;
            codec::encode(&codec::via_cell(call, cell, rec.orig_addr)?, ip, rec.orig_addr)
        }
        BranchKind::Conditional => {
            // A reversed short `jcc` skips the indirect jump when the branch isn't taken.
            let skip = codec::reversed_jcc(&rec.inst, ip, INDIRECT_JMP_LEN);
            let mut bytes = codec::encode(&skip, ip, rec.orig_addr)?;
            let jmp = codec::via_cell(false, cell, rec.orig_addr)?;
            bytes.extend_from_slice(&codec::encode(&jmp, ip + bytes.len() as u64, rec.orig_addr)?);
            Ok(bytes)
        }
        _ => Err(TranslationError::Encode {
            addr: rec.orig_addr,
            msg: format!("{:?} can't leave the translated region", rec.branch),
        }),
    }
}

/// Check that every resolved branch in `store` lands on its target's new address.
#[cfg(test)]
pub(crate) fn check_displacements(store: &RecordStore) {
    for (idx, rec) in store.iter_enumerated() {
        let Some(t) = rec.target else { continue };
        if rec.is_elided() {
            continue;
        }
        let inst = codec::decode_one(rec.new_addr, &rec.bytes).unwrap();
        assert_eq!(inst.len(), rec.len(), "{idx:?}");
        assert_eq!(
            store[t].new_addr as i64 - (rec.new_addr + rec.len() as u64) as i64,
            inst.near_branch_target() as i64 - inst.next_ip() as i64,
            "{idx:?}"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::{chain, ChainMap},
        codebuf::ExecMemory,
        instrument::Instrumentor,
        profile::ProfileTable,
        record::{BlockIdx, InsIdx, RecordKind},
        testing::{routine, SUM},
    };
    use iced_x86::{Code, Mnemonic};

    struct Built {
        store: RecordStore,
        exits: ExitTable,
        start: u64,
        _mem: ExecMemory,
    }

    fn build(addr: u64, bytes: &[u8], profiling: bool) -> Built {
        let mut store = RecordStore::with_capacity(400);
        let mut profile = ProfileTable::with_capacity(64);
        Instrumentor::new(&mut store, &mut profile, profiling, false)
            .routine(&routine(addr, bytes))
            .unwrap();
        let map = ChainMap::build(&store);
        chain(&mut store, &map);
        let mut mem = ExecMemory::new(0x4000, None).unwrap();
        let exits = ExitTable::new(mem.carve(ExitTable::size_of(16), 8).unwrap(), 16);
        let start = mem.carve(0x2000, 16).unwrap();
        Built {
            store,
            exits,
            start,
            _mem: mem,
        }
    }

    #[test]
    fn resolved_branches_land() {
        for profiling in [false, true] {
            let mut b = build(0x1000, SUM, profiling);
            fixup(&mut b.store, &mut b.exits, b.start).unwrap();
            check_displacements(&b.store);
            assert_eq!(b.exits.len(), 0);
            // Records are laid out back to back.
            let mut cursor = b.start;
            for rec in b.store.iter() {
                assert_eq!(rec.new_addr, cursor + rec.pad as u64);
                cursor = rec.end_addr();
                if rec.patch_slot {
                    assert_eq!(rec.new_addr % 4, 0);
                }
            }
        }
    }

    #[test]
    fn growth_forces_near_jump() {
        // jmp over 18 `mov rax, [rip+0]`s, each of which grows by a byte when made absolute.
        let mut bytes = vec![0xEB, 0x7E];
        for _ in 0..18 {
            bytes.extend_from_slice(&[0x48, 0x8B, 0x05, 0x00, 0x00, 0x00, 0x00]);
        }
        bytes.push(0xC3);
        let mut b = build(0x1000, &bytes, false);
        let passes = fixup(&mut b.store, &mut b.exits, b.start).unwrap();
        assert!(passes >= 2);
        let jmp = &b.store[InsIdx::new(0)];
        assert!(jmp.long_branch);
        assert_eq!(jmp.inst.code(), Code::Jmp_rel32_64);
        assert_eq!(jmp.len(), 5);
        for rec in b.store.iter().skip(1).take(18) {
            assert!(!rec.inst.is_ip_rel_memory_operand());
            assert_eq!(rec.len(), 8);
            // 48 8B 04 25 disp32: sign-extended, with no address size prefix.
            assert_eq!(&rec.bytes[..4], &[0x48, 0x8B, 0x04, 0x25]);
            let inst = codec::decode_one(rec.new_addr, &rec.bytes).unwrap();
            assert_eq!(inst.memory_base(), Register::None);
            assert_eq!(inst.memory_displacement64(), rec.orig_addr + 7);
        }
        check_displacements(&b.store);
    }

    #[test]
    fn far_rip_relative_is_retargeted() {
        // mov rax, [rip+0] decoded far from its relocated position, above 2GiB.
        let orig = 0x1_0000_0000;
        let mut b = build(0x1000, &[0xC3], false);
        let inst = codec::decode_one(orig, &[0x48, 0x8B, 0x05, 0x00, 0x00, 0x00, 0x00]).unwrap();
        let idx = b
            .store
            .append(orig, inst, RecordKind::Regular, BlockIdx::new(0))
            .unwrap();
        let r = fixup(&mut b.store, &mut b.exits, b.start);
        // Either the mapping happened to land within 2GiB of the operand, or encoding fails.
        match r {
            Ok(_) => {
                let rec = &b.store[idx];
                assert!(rec.inst.is_ip_rel_memory_operand());
                let back = codec::decode_one(rec.new_addr, &rec.bytes).unwrap();
                assert_eq!(back.memory_displacement64(), orig + 7);
            }
            Err(e) => assert!(matches!(e, TranslationError::Encode { .. })),
        }
    }

    #[test]
    fn external_branches_use_exit_cells() {
        // je +0x100; jmp +0x200; call +0x100; ret
        let bytes = [
            0x0F, 0x84, 0x00, 0x01, 0x00, 0x00, // je 0x1106
            0xE9, 0x00, 0x02, 0x00, 0x00, //       jmp 0x120b
            0xE8, 0xF6, 0x00, 0x00, 0x00, //       call 0x1106
            0xC3,
        ];
        let mut b = build(0x1000, &bytes, false);
        fixup(&mut b.store, &mut b.exits, b.start).unwrap();
        // `je` and `call` share a target, and thus a cell.
        assert_eq!(b.exits.len(), 2);

        let je = &b.store[InsIdx::new(0)];
        assert_eq!(je.len(), 8);
        let skip = codec::decode_one(je.new_addr, &je.bytes).unwrap();
        assert_eq!(skip.mnemonic(), Mnemonic::Jne);
        assert_eq!(skip.near_branch_target(), je.end_addr());
        let jmp = codec::decode_one(je.new_addr + 2, &je.bytes[2..]).unwrap();
        assert_eq!(jmp.code(), Code::Jmp_rm64);
        let cell = jmp.ip_rel_memory_address();
        assert_eq!(unsafe { *(cell as *const u64) }, 0x1106);

        let call = &b.store[InsIdx::new(2)];
        let call = codec::decode_one(call.new_addr, &call.bytes).unwrap();
        assert_eq!(call.code(), Code::Call_rm64);
        assert_eq!(call.ip_rel_memory_address(), cell);

        let jmp = &b.store[InsIdx::new(1)];
        let jmp = codec::decode_one(jmp.new_addr, &jmp.bytes).unwrap();
        assert_eq!(unsafe { *(jmp.ip_rel_memory_address() as *const u64) }, 0x120b);
    }

    #[test]
    fn external_loop_is_an_error() {
        // loop +0x40 (outside the 2 byte routine)
        let mut b = build(0x1000, &[0xE2, 0x40], false);
        assert!(matches!(
            fixup(&mut b.store, &mut b.exits, b.start),
            Err(TranslationError::Encode { addr: 0x1000, .. })
        ));
    }
}
