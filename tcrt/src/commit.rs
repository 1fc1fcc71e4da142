//! The cache committer: copies a laid out generation into executable memory and redirects
//! control flow into it.

use crate::{
    codebuf::ExecMemory,
    codec::{self, PATCH_SLOT_LEN},
    errors::TranslationError,
    host::Host,
    log::{stats::Stats, Log, Verbosity},
    patch,
    record::{RecordKind, RecordStore},
};

/// Copy the bytes of `store`, laid out from `start`, into `mem`. Returns the address just beyond
/// the last byte written.
///
/// # Safety
///
/// No thread may be executing the destination range.
pub(crate) unsafe fn copy(
    store: &RecordStore,
    mem: &ExecMemory,
    start: u64,
) -> Result<u64, TranslationError> {
    let mut buf = Vec::with_capacity(usize::try_from(store.end_addr(start) - start).unwrap_or(0));
    let mut cursor = start;
    for rec in store.iter() {
        if !rec.is_elided() && rec.pad > 0 {
            buf.extend_from_slice(codec::nop_bytes(rec.pad));
            cursor += rec.pad as u64;
        }
        if cursor != rec.new_addr {
            return Err(TranslationError::Layout {
                expected: rec.new_addr,
                actual: cursor,
            });
        }
        buf.extend_from_slice(&rec.bytes);
        cursor += rec.len() as u64;
    }
    unsafe { mem.write(start, &buf)? };
    Ok(cursor)
}

/// Ask `host` to redirect every routine with a head in `store` to its translation. A routine the
/// host can't redirect stays untranslated. Returns how many routines were redirected.
pub(crate) fn replace_routines(
    host: &dyn Host,
    store: &RecordStore,
    log: &Log,
    stats: &Stats,
) -> usize {
    let mut n = 0;
    for rec in store
        .iter()
        .filter(|r| r.kind == RecordKind::RoutineHead && !r.is_elided())
    {
        let r = if host.is_safe_for_replacement(rec.orig_addr) {
            host.replace_routine(rec.orig_addr, rec.new_addr)
        } else {
            Err(TranslationError::Replace {
                addr: rec.orig_addr,
                msg: "not safe for replacement".into(),
            })
        };
        match r {
            Ok(_) => {
                stats.routine_replaced_ok();
                log.log(
                    Verbosity::Trace,
                    &format!("routine 0x{:x} -> 0x{:x}", rec.orig_addr, rec.new_addr),
                );
                n += 1;
            }
            Err(e) => {
                stats.routine_replaced_err();
                log.log(Verbosity::Warning, &e.to_string());
            }
        }
    }
    n
}

/// Redirect every probe slot of the first generation `gen1` (routine heads, and backward jumps
/// if they were given slots) to the equivalent point of the second generation `gen2`. Returns
/// the number of probes published.
///
/// # Safety
///
/// Both generations must have been committed to executable memory.
pub(crate) unsafe fn probe(
    gen1: &RecordStore,
    gen2: &RecordStore,
    stats: &Stats,
) -> Result<usize, TranslationError> {
    let mut n = 0;
    for (idx, rec) in gen1.iter_enumerated() {
        if !rec.patch_slot || rec.kind == RecordKind::Profiling || rec.is_elided() {
            continue;
        }
        // The second generation keeps the first's indices. An elided record's address is that of
        // the next live record.
        let to = gen2[idx].new_addr;
        let jmp = codec::jmp_rel32(rec.new_addr, to).ok_or_else(|| TranslationError::Patch {
            addr: rec.new_addr,
            msg: format!("can't reach 0x{to:x}"),
        })?;
        debug_assert_eq!(rec.len(), PATCH_SLOT_LEN);
        unsafe { patch::publish(rec.new_addr, &jmp)? };
        stats.probe_published();
        n += 1;
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::{chain, ChainMap},
        exits::ExitTable,
        fixup::fixup,
        instrument::Instrumentor,
        profile::ProfileTable,
        record::InsIdx,
        testing::{routine, SUM},
    };

    fn laid_out(mem: &mut ExecMemory, profiling: bool, back: bool) -> (RecordStore, u64) {
        let mut store = RecordStore::with_capacity(200);
        let mut profile = ProfileTable::with_capacity(16);
        Instrumentor::new(&mut store, &mut profile, profiling, back)
            .routine(&routine(0x1000, SUM))
            .unwrap();
        let map = ChainMap::build(&store);
        chain(&mut store, &map);
        let mut exits = ExitTable::new(mem.carve(ExitTable::size_of(4), 8).unwrap(), 4);
        let start = mem.carve(0x800, 16).unwrap();
        fixup(&mut store, &mut exits, start).unwrap();
        (store, start)
    }

    #[test]
    fn copy_matches_layout() {
        let mut mem = ExecMemory::new(0x2000, None).unwrap();
        let (store, start) = laid_out(&mut mem, true, false);
        let end = unsafe { copy(&store, &mem, start).unwrap() };
        assert_eq!(end, store.end_addr(start));
        for rec in store.iter().filter(|r| !r.is_elided()) {
            let bytes = unsafe {
                std::slice::from_raw_parts(rec.new_addr as *const u8, rec.len())
            };
            assert_eq!(bytes, rec.bytes.as_slice());
        }
    }

    #[test]
    fn copy_checks_the_cursor() {
        let mut mem = ExecMemory::new(0x2000, None).unwrap();
        let (mut store, start) = laid_out(&mut mem, false, false);
        let i = InsIdx::new(3);
        store[i].new_addr += 1;
        let expected = store[i].new_addr;
        assert!(matches!(
            unsafe { copy(&store, &mem, start) },
            Err(TranslationError::Layout { expected: e, actual }) if e == expected && actual == e - 1
        ));
    }

    #[test]
    fn probes_jump_to_the_second_generation() {
        let mut mem = ExecMemory::new(0x4000, None).unwrap();
        let (gen1, start1) = laid_out(&mut mem, true, true);
        unsafe { copy(&gen1, &mem, start1).unwrap() };
        let mut gen2 = gen1.derive().unwrap();
        let mut exits = ExitTable::new(mem.carve(ExitTable::size_of(4), 8).unwrap(), 4);
        let start2 = mem.carve(0x800, 16).unwrap();
        fixup(&mut gen2, &mut exits, start2).unwrap();
        unsafe { copy(&gen2, &mem, start2).unwrap() };

        let stats = Stats::new();
        // The routine head and the slot before `jne loop`.
        assert_eq!(unsafe { probe(&gen1, &gen2, &stats).unwrap() }, 2);
        for (idx, rec) in gen1.iter_enumerated() {
            if !rec.patch_slot || rec.kind == RecordKind::Profiling {
                continue;
            }
            let live = unsafe { std::slice::from_raw_parts(rec.new_addr as *const u8, 5) };
            let jmp = codec::decode_one(rec.new_addr, live).unwrap();
            assert_eq!(jmp.near_branch_target(), gen2[idx].new_addr);
        }
    }
}
