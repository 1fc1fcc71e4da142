//! Human readable dumps of code and profiles. The formats are informational only.

use crate::{
    codec::{self, BranchKind},
    host::Routine,
    profile::ProfileTable,
    record::{RecordKind, RecordStore},
};
use std::{fmt::Write, sync::atomic::Ordering};

/// The program's own code, routine by routine.
pub(crate) fn original_code(rtns: &[Routine]) -> String {
    let mut fmtr = codec::formatter();
    let mut s = String::new();
    for rtn in rtns {
        writeln!(s, "{}:", rtn.name).ok();
        for inst in &rtn.insts {
            writeln!(s, "  0x{:x}: {}", inst.ip(), codec::disasm(&mut fmtr, inst)).ok();
        }
    }
    s
}

/// The code of a committed cache, as laid out by its records.
pub(crate) fn cache(name: &str, store: &RecordStore) -> String {
    let mut fmtr = codec::formatter();
    let mut s = format!("--- {name} ---\n");
    for rec in store.iter().filter(|r| !r.is_elided()) {
        // An external conditional branch is two instructions.
        match codec::decode_routine(rec.new_addr, &rec.bytes) {
            Ok(insts) => {
                for inst in insts {
                    writeln!(s, "0x{:x}: {}", inst.ip(), codec::disasm(&mut fmtr, &inst)).ok();
                }
            }
            Err(_) => {
                writeln!(s, "0x{:x}: <undecodable>", rec.new_addr).ok();
            }
        }
    }
    s
}

/// Every program instruction of the first generation `store` with its block's heat counters.
/// Blocks are separated by blank lines; indirect terminators are followed by their histograms.
pub(crate) fn profile_map(store: &RecordStore, profile: &ProfileTable) -> String {
    let mut fmtr = codec::formatter();
    let mut s = String::new();
    let mut prev = None;
    for rec in store
        .iter()
        .filter(|r| r.kind != RecordKind::Profiling && !r.patch_slot)
    {
        if prev.is_some_and(|b| b != rec.block) {
            s.push('\n');
        }
        prev = Some(rec.block);
        let c = profile.counters(rec.block);
        writeln!(
            s,
            "0x{:x}: {} {}: {}",
            rec.orig_addr,
            c.counter.load(Ordering::Relaxed),
            c.fallthrough.load(Ordering::Relaxed),
            codec::disasm(&mut fmtr, &rec.inst)
        )
        .ok();
        if rec.kind == RecordKind::Terminating && rec.branch.is_indirect() {
            for (target, count) in profile.histogram(rec.block) {
                if count > 0 {
                    writeln!(s, "    -> 0x{target:x} x{count}").ok();
                }
            }
        }
    }
    s
}

/// A summary of every block in `profile`.
pub(crate) fn block_map(profile: &ProfileTable, store: &RecordStore) -> String {
    let indirect = profile.blocks().filter(|(_, i)| i.indirect).count();
    let mut s = format!(
        "blocks: {}\nindirect: {indirect}\n",
        profile.num_blocks()
    );
    for (b, info) in profile.blocks() {
        let c = profile.counters(b);
        let term = match info.terminator {
            Some(t) => {
                let r = &store[t];
                let kind = match r.branch {
                    BranchKind::NotBranch => "fallthrough",
                    BranchKind::DirectJump => "jmp",
                    BranchKind::DirectCall => "call",
                    BranchKind::Conditional => "jcc",
                    BranchKind::LoopForm => "loop",
                    BranchKind::IndirectRegister { call: true, .. }
                    | BranchKind::IndirectMemory { call: true } => "icall",
                    BranchKind::IndirectRegister { call: false, .. }
                    | BranchKind::IndirectMemory { call: false } => "ijmp",
                    BranchKind::Return => "ret",
                };
                format!("{} {kind}@0x{:x}", t.index(), r.orig_addr)
            }
            None => "-".to_owned(),
        };
        let hist = profile
            .histogram(b)
            .iter()
            .filter(|(_, n)| *n > 0)
            .map(|(t, n)| format!("0x{t:x}:{n}"))
            .collect::<Vec<_>>()
            .join(", ");
        writeln!(
            s,
            "{}: term={term} counter={} fallthrough={} indirect={} hist=[{hist}]",
            b.index(),
            c.counter.load(Ordering::Relaxed),
            c.fallthrough.load(Ordering::Relaxed),
            u8::from(info.indirect),
        )
        .ok();
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::{chain, ChainMap},
        codebuf::ExecMemory,
        exits::ExitTable,
        fixup::fixup,
        instrument::Instrumentor,
        record::BlockIdx,
        testing::{routine, SUM},
    };
    use regex::Regex;

    #[test]
    fn original() {
        let s = original_code(&[routine(0x1000, SUM)]);
        let lines = s.lines().collect::<Vec<_>>();
        assert_eq!(lines[0], "r1000:");
        assert_eq!(lines.len(), 8);
        let re = Regex::new(r"^  0x[0-9a-f]+: [a-z]+").unwrap();
        assert!(lines[1..].iter().all(|l| re.is_match(l)));
        assert_eq!(lines[3], "  0x1005: je 0x100f");
    }

    #[test]
    fn translated() {
        let mut store = RecordStore::with_capacity(200);
        let mut profile = ProfileTable::with_capacity(16);
        Instrumentor::new(&mut store, &mut profile, true, false)
            .routine(&routine(0x1000, SUM))
            .unwrap();
        let map = ChainMap::build(&store);
        chain(&mut store, &map);
        let mut mem = ExecMemory::new(0x1000, None).unwrap();
        let mut exits = ExitTable::new(mem.carve(ExitTable::size_of(1), 8).unwrap(), 1);
        let start = mem.carve(0x400, 16).unwrap();
        fixup(&mut store, &mut exits, start).unwrap();
        let s = cache("tc1", &store);
        assert!(s.starts_with("--- tc1 ---\n"));
        let re = Regex::new(r"(?m)^0x[0-9a-f]+: nop \[rax\+rax\]$").unwrap();
        // The head slot and three block stubs, two fallthrough stubs.
        assert_eq!(re.find_iter(&s).count(), 6);
        assert!(Regex::new(r"(?m)^0x[0-9a-f]+: lea rsp, \[rsp-0x80\]$")
            .unwrap()
            .is_match(&s));
    }

    #[test]
    fn profile_and_block_maps() {
        // sub rsp, 8; call rsi; add rsp, 8; ret
        let bytes = [0x48, 0x83, 0xEC, 0x08, 0xFF, 0xD6, 0x48, 0x83, 0xC4, 0x08, 0xC3];
        let mut store = RecordStore::with_capacity(200);
        let mut profile = ProfileTable::with_capacity(16);
        Instrumentor::new(&mut store, &mut profile, true, false)
            .routine(&routine(0x1000, &bytes))
            .unwrap();
        let c = profile.counters(BlockIdx::new(0));
        c.counter.store(7, Ordering::Relaxed);
        c.targets[0].store(0x4000, Ordering::Relaxed);
        c.counts[0].store(7, Ordering::Relaxed);

        let s = profile_map(&store, &profile);
        assert_eq!(
            s,
            "0x1000: 7 0: sub rsp, 8\n\
             0x1004: 7 0: call rsi\n    \
             -> 0x4000 x7\n\
             \n\
             0x1006: 0 0: add rsp, 8\n\
             0x100a: 0 0: ret\n"
        );

        let s = block_map(&profile, &store);
        let re = Regex::new(
            r"(?m)^0: term=\d+ icall@0x1004 counter=7 fallthrough=0 indirect=1 hist=\[0x4000:7\]$",
        )
        .unwrap();
        assert!(s.starts_with("blocks: 2\nindirect: 1\n"));
        assert!(re.is_match(&s));
        assert!(s.contains("1: term="));
    }
}
