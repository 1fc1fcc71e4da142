//! Patching code that other threads may be executing at the same moment.
//!
//! [publish] is a two-stage commit. Given a patch site `addr` and replacement `bytes`:
//!
//!   1. `bytes[4..]` are written. The first 4 bytes at `addr` are unchanged.
//!   2. After a full fence, `bytes[..4]` are written by a single aligned 32-bit atomic store.
//!
//! A thread fetching from `addr` therefore sees either the original first 4 bytes or the new
//! ones, never a mixture. The site must be 4-byte aligned (so that the final store cannot straddle
//! a cache line) and its original instruction must not depend on bytes 4 onwards in a way that
//! changes control flow. Our patch sites are 5-byte `nop`s whose fifth byte is a displacement, so
//! the first stage only changes which `nop` is executed. The final store is the only write that
//! redirects control flow.

use crate::{codec::Bytes, errors::TranslationError};
use libc::{PROT_EXEC, PROT_READ, PROT_WRITE, mprotect};
use std::{
    ffi::c_void,
    io,
    sync::atomic::{AtomicU32, Ordering, fence},
};

/// A patch whose tail may have been written but whose head has not.
pub(crate) struct StagedPatch {
    addr: u64,
    bytes: Bytes,
}

impl StagedPatch {
    pub(crate) fn new(addr: u64, bytes: &[u8]) -> Result<Self, TranslationError> {
        if addr % 4 != 0 {
            return Err(TranslationError::Patch {
                addr,
                msg: "patch site is not 4-byte aligned".into(),
            });
        }
        if bytes.len() < 4 {
            return Err(TranslationError::Patch {
                addr,
                msg: format!("{} byte patch is shorter than the 4 byte head", bytes.len()),
            });
        }
        Ok(Self {
            addr,
            bytes: Bytes::from_slice(bytes),
        })
    }

    /// Write everything but the first 4 bytes.
    ///
    /// # Safety
    ///
    /// `addr..addr + bytes.len()` must be writable code that satisfies the module's contract.
    pub(crate) unsafe fn stage(&self) {
        let tail = &self.bytes[4..];
        for (i, b) in tail.iter().enumerate() {
            unsafe { ((self.addr + 4 + i as u64) as *mut u8).write_volatile(*b) };
        }
    }

    /// Publish the first 4 bytes in one store.
    ///
    /// # Safety
    ///
    /// As [Self::stage], which must have been called first.
    pub(crate) unsafe fn commit(self) {
        fence(Ordering::SeqCst);
        let head = u32::from_le_bytes([self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3]]);
        let site = unsafe { &*(self.addr as *const AtomicU32) };
        site.store(head, Ordering::SeqCst);
    }
}

/// Write `bytes` to the live code at `addr` such that concurrently executing threads observe
/// either the old or the new first 4 bytes, never a mixture.
///
/// # Safety
///
/// `addr..addr + bytes.len()` must be writable code. Bytes 4 onwards of the original code must be
/// irrelevant to control flow while the first 4 bytes are unchanged.
pub(crate) unsafe fn publish(addr: u64, bytes: &[u8]) -> Result<(), TranslationError> {
    let p = StagedPatch::new(addr, bytes)?;
    unsafe {
        p.stage();
        p.commit();
    }
    Ok(())
}

/// Make the pages covering `addr..addr + len` writable as well as executable.
pub(crate) fn make_writable(addr: u64, len: usize) -> Result<(), TranslationError> {
    let page = page_size::get() as u64;
    let start = addr - addr % page;
    let end = (addr + len as u64).next_multiple_of(page);
    let rtn = unsafe {
        mprotect(
            start as *mut c_void,
            usize::try_from(end - start).unwrap_or(usize::MAX),
            PROT_READ | PROT_WRITE | PROT_EXEC,
        )
    };
    if rtn != 0 {
        return Err(TranslationError::Patch {
            addr,
            msg: io::Error::last_os_error().to_string(),
        });
    }
    Ok(())
}
