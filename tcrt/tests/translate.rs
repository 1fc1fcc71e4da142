//! Translate routines living in real executable memory, run them, and check what they compute.

use libc::{mmap, MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_EXEC, PROT_READ, PROT_WRITE};
use regex::Regex;
use std::{ptr, sync::Arc, time::Duration};
use tcrt::{Host, InProcessHost, Options, TranslationSession};

/// `lea rax, [rdi+1]; ret`
const INC: &[u8] = &[0x48, 0x8D, 0x47, 0x01, 0xC3];
/// `lea rax, [rdi+2]; ret`
const INC2: &[u8] = &[0x48, 0x8D, 0x47, 0x02, 0xC3];
/// `u64 sum(u64 n)`: sums `n` down to 1.
const SUM: &[u8] = &[
    0x31, 0xC0, //       xor eax, eax
    0x48, 0x85, 0xFF, // test rdi, rdi
    0x74, 0x08, //       je done
    0x48, 0x01, 0xF8, // loop: add rax, rdi
    0x48, 0xFF, 0xCF, // dec rdi
    0x75, 0xF8, //       jne loop
    0xC3, //             done: ret
];
/// `u64 dispatch(u64 x, u64 (*f)(u64))`: `sub rsp, 8; call rsi; add rsp, 8; ret`
const DISPATCH: &[u8] = &[0x48, 0x83, 0xEC, 0x08, 0xFF, 0xD6, 0x48, 0x83, 0xC4, 0x08, 0xC3];

/// As `DISPATCH`, but calling through the stack: `push rsi; call [rsp]; pop rcx; ret`
const DISPATCH_STACK: &[u8] = &[0x56, 0xFF, 0x14, 0x24, 0x59, 0xC3];

type Unary = extern "C" fn(u64) -> u64;
type Dispatch = extern "C" fn(u64, Unary) -> u64;

/// A page of RWX memory holding `code` at the given offsets, and a host describing it.
fn image(code: &[(&str, usize, &[u8])]) -> (u64, Arc<InProcessHost>) {
    let base = unsafe {
        mmap(
            ptr::null_mut(),
            0x1000,
            PROT_READ | PROT_WRITE | PROT_EXEC,
            MAP_ANON | MAP_PRIVATE,
            -1,
            0,
        )
    };
    assert_ne!(base, MAP_FAILED);
    let base = base as u64;
    let mut host = InProcessHost::new();
    for (name, off, bytes) in code {
        let addr = base + *off as u64;
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
            host.add_routine(Some(*name), addr, bytes.len());
        }
    }
    (base, Arc::new(host))
}

fn unary(addr: u64) -> Unary {
    unsafe { std::mem::transmute::<u64, Unary>(addr) }
}

/// The target of the `jmp rel32` at `addr`.
fn jmp_target(addr: u64) -> u64 {
    let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, 5) };
    assert_eq!(bytes[0], 0xE9);
    let disp = i32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    (addr as i64 + 5 + i64::from(disp)) as u64
}

#[test]
fn routines_run_translated() {
    let (base, host) = image(&[("inc", 0, INC), ("sum", 0x40, SUM)]);
    assert_eq!(host.routines().unwrap().len(), 2);
    let s = TranslationSession::new(host, Options::new()).unwrap();
    s.translate().unwrap();

    let inc = base;
    let sum = base + 0x40;
    let tc_inc = s.translated_entry(inc).unwrap();
    assert_ne!(tc_inc, inc);
    assert_eq!(jmp_target(inc), tc_inc);
    assert_eq!(jmp_target(sum), s.translated_entry(sum).unwrap());

    assert_eq!(unary(inc)(41), 42);
    assert_eq!(unary(sum)(0), 0);
    assert_eq!(unary(sum)(100), 5050);
    // The translation can be entered directly too.
    assert_eq!(unary(tc_inc)(1), 2);
    s.finish();
}

#[test]
fn profile_then_optimise() {
    let (base, host) = image(&[("sum", 0, SUM)]);
    let opts = Options::new()
        .create_second_cache(true)
        .probe_backward_jumps(true)
        .profiling_duration(Duration::from_secs(3600));
    let s = TranslationSession::new(host, opts).unwrap();
    s.translate().unwrap();

    let sum = unary(base);
    for _ in 0..3 {
        assert_eq!(sum(10), 55);
    }
    let prof = s.profile_dump().unwrap();
    let lines = prof.lines().collect::<Vec<_>>();
    assert_eq!(lines[0], format!("0x{base:x}: 3 3: xor eax, eax"));
    assert_eq!(lines[4], format!("0x{:x}: 30 3: add rax, rdi", base + 7));
    assert_eq!(lines[lines.len() - 1], format!("0x{:x}: 3 0: ret", base + 15));

    s.optimise().unwrap();
    let tc1 = s.translated_entry(base).unwrap();
    let tc2 = s.optimised_entry(base).unwrap();
    assert_eq!(jmp_target(tc1), tc2);
    assert_eq!(sum(100), 5050);
    assert_eq!(sum(0), 0);
    // Profiling is off: the counters no longer move.
    assert_eq!(s.profile_dump().unwrap(), prof);

    let tc2_dump = s.second_cache_dump().unwrap();
    let re = Regex::new(r"(?m)^0x[0-9a-f]+: lea rsp, \[rsp-0x80\]$").unwrap();
    assert!(!re.is_match(&tc2_dump));
    assert!(re.is_match(&s.first_cache_dump().unwrap()));
    // Optimising again is a no-op.
    s.optimise().unwrap();
    assert_eq!(s.optimised_entry(base), Some(tc2));
    s.finish();
}

#[test]
fn hot_indirect_calls_are_devirtualised() {
    let (base, host) = image(&[
        ("dispatch", 0, DISPATCH),
        ("inc", 0x100, INC),
        ("inc2", 0x200, INC2),
    ]);
    let opts = Options::new()
        .create_second_cache(true)
        .profiling_duration(Duration::from_secs(3600));
    let s = TranslationSession::new(host, opts).unwrap();
    s.translate().unwrap();

    let dispatch = unsafe { std::mem::transmute::<u64, Dispatch>(base) };
    let (inc, inc2) = (unary(base + 0x100), unary(base + 0x200));
    for i in 0..1000 {
        assert_eq!(dispatch(i, inc), i + 1);
    }
    let prof = s.profile_dump().unwrap();
    assert!(prof.contains(&format!("    -> 0x{:x} x1000\n", base + 0x100)));

    s.optimise().unwrap();
    let tc2 = s.second_cache_dump().unwrap();
    let guard = Regex::new(concat!(
        r"(?m)^0x[0-9a-f]+: cmp rsi, .+\n",
        r"0x[0-9a-f]+: jne 0x[0-9a-f]+\n",
        r"0x[0-9a-f]+: call 0x[0-9a-f]+\n",
        r"0x[0-9a-f]+: jmp 0x[0-9a-f]+\n",
        r"0x[0-9a-f]+: call rsi$",
    ))
    .unwrap();
    assert!(guard.is_match(&tc2), "{tc2}");

    // The guard holds for the hot target, and falls back for any other.
    assert_eq!(dispatch(7, inc), 8);
    assert_eq!(dispatch(7, inc2), 9);
    assert_eq!(dispatch(u64::MAX - 1, inc), u64::MAX);
    s.finish();
}

#[test]
fn hot_stack_calls_are_devirtualised() {
    let (base, host) = image(&[("dispatch", 0, DISPATCH_STACK), ("inc", 0x100, INC)]);
    let opts = Options::new()
        .create_second_cache(true)
        .profiling_duration(Duration::from_secs(3600));
    let s = TranslationSession::new(host, opts).unwrap();
    s.translate().unwrap();

    let dispatch = unsafe { std::mem::transmute::<u64, Dispatch>(base) };
    let inc = unary(base + 0x100);
    for i in 0..1000 {
        assert_eq!(dispatch(i, inc), i + 1);
    }
    let prof = s.profile_dump().unwrap();
    assert!(prof.contains(&format!("    -> 0x{:x} x1000\n", base + 0x100)));

    s.optimise().unwrap();
    let tc2 = s.second_cache_dump().unwrap();
    let guard = Regex::new(concat!(
        r"(?m)^0x[0-9a-f]+: mov rax, .*\[rsp\+0x88\]\n",
        r"0x[0-9a-f]+: cmp rax, .+\n",
        r"0x[0-9a-f]+: pop rax\n",
        r"0x[0-9a-f]+: lea rsp, \[rsp\+0x80\]\n",
        r"0x[0-9a-f]+: jne 0x[0-9a-f]+\n",
        r"0x[0-9a-f]+: call 0x[0-9a-f]+\n",
        r"0x[0-9a-f]+: jmp 0x[0-9a-f]+\n",
        r"0x[0-9a-f]+: call .*\[rsp\]$",
    ))
    .unwrap();
    assert!(guard.is_match(&tc2), "{tc2}");
    assert_eq!(dispatch(41, inc), 42);
    s.finish();
}

#[test]
fn even_splits_stay_indirect() {
    // Both targets are 256-byte aligned.
    let (base, host) = image(&[
        ("dispatch", 0, DISPATCH),
        ("inc", 0x100, INC),
        ("inc2", 0x200, INC2),
    ]);
    let opts = Options::new()
        .create_second_cache(true)
        .jump_count_threshold(512)
        .profiling_duration(Duration::from_secs(3600));
    let s = TranslationSession::new(host, opts).unwrap();
    s.translate().unwrap();

    let dispatch = unsafe { std::mem::transmute::<u64, Dispatch>(base) };
    let (inc, inc2) = (unary(base + 0x100), unary(base + 0x200));
    for i in 0..500 {
        assert_eq!(dispatch(i, inc), i + 1);
        assert_eq!(dispatch(i, inc2), i + 2);
    }
    // Each target keeps its own slot and count.
    let prof = s.profile_dump().unwrap();
    assert!(prof.contains(&format!("    -> 0x{:x} x500\n", base + 0x100)));
    assert!(prof.contains(&format!("    -> 0x{:x} x500\n", base + 0x200)));

    s.optimise().unwrap();
    let tc2 = s.second_cache_dump().unwrap();
    assert!(!Regex::new(r"(?m)^0x[0-9a-f]+: cmp rsi, ").unwrap().is_match(&tc2), "{tc2}");
    assert_eq!(dispatch(1, inc), 2);
    assert_eq!(dispatch(1, inc2), 3);
    s.finish();
}

#[test]
fn unsafe_routines_stay_untranslated() {
    // `ret` is too short to be redirected, but everything else still is.
    let (base, host) = image(&[("inc", 0, INC), ("ret", 0x40, &[0xC3][..])]);
    let s = TranslationSession::new(host, Options::new()).unwrap();
    s.translate().unwrap();
    assert_eq!(jmp_target(base), s.translated_entry(base).unwrap());
    let ret = unsafe { std::slice::from_raw_parts((base + 0x40) as *const u8, 1) };
    assert_eq!(ret, &[0xC3]);
    assert_eq!(unary(base)(1), 2);
    s.finish();
}
