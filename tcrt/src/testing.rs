//! Fixtures shared by unit tests.

use crate::{codec::decode_routine, host::Routine};

/// Decode `bytes` as a routine at `addr`.
pub(crate) fn routine(addr: u64, bytes: &[u8]) -> Routine {
    Routine {
        name: format!("r{addr:x}"),
        addr,
        insts: decode_routine(addr, bytes).unwrap(),
    }
}

/// `u64 sum(u64 n)`: sums `n` down to 1.
pub(crate) const SUM: &[u8] = &[
    0x31, 0xC0, //       xor eax, eax
    0x48, 0x85, 0xFF, // test rdi, rdi
    0x74, 0x08, //       je done
    0x48, 0x01, 0xF8, // loop: add rax, rdi
    0x48, 0xFF, 0xCF, // dec rdi
    0x75, 0xF8, //       jne loop
    0xC3, //             done: ret
];
