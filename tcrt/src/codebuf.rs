//! Executable memory for translation caches.
//!
//! A session owns a single [ExecMemory] mapping, carved up front-to-back into the exit table, the
//! first cache, and the second cache. Keeping all three in one mapping guarantees that a 32-bit
//! RIP-relative displacement from any cache reaches any exit-table cell. The mapping is readable,
//! writable and executable for its whole life: the second cache and the probe patches are written
//! while the first cache runs. It is never unmapped, since program code may jump into it at any
//! time until the process exits.

use crate::errors::TranslationError;
use libc::{MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_EXEC, PROT_READ, PROT_WRITE, mmap};
use std::{ffi::c_void, io, ptr};

/// The largest mapping we will request.
pub(crate) const MAX_EXEC_MEMORY: usize = 0x7FF_FFFF;

#[derive(Debug)]
pub(crate) struct ExecMemory {
    /// A pointer to the beginning of the `mmap`ed buffer.
    buf: *mut u8,
    /// How many bytes have we allocated to the buffer?
    len: usize,
    /// The offset of the first byte not yet handed out by [Self::carve].
    used: usize,
}

// SAFETY: the raw pointer is only ever dereferenced through explicit unsafe writes whose
// exclusivity the session guarantees.
unsafe impl Send for ExecMemory {}
unsafe impl Sync for ExecMemory {}

impl ExecMemory {
    /// Map at least `len` bytes of RWX memory, preferably near `hint`.
    pub(crate) fn new(len: usize, hint: Option<u64>) -> Result<Self, TranslationError> {
        let page = page_size::get();
        let len = len.next_multiple_of(page);
        if len > MAX_EXEC_MEMORY {
            return Err(TranslationError::ExecMemory {
                len,
                err: io::Error::new(io::ErrorKind::OutOfMemory, "exceeds translation cache limit"),
            });
        }
        // Without `MAP_FIXED` the hint is only advisory, but Linux honours it when the range is
        // free, which keeps the caches close to the code they were derived from.
        let hint = hint
            .and_then(|h| usize::try_from(h).ok())
            .and_then(|h| h.checked_sub(len))
            .map(|h| h - h % page)
            .unwrap_or(0);
        let buf = unsafe {
            mmap(
                hint as *mut c_void,
                len,
                PROT_READ | PROT_WRITE | PROT_EXEC,
                MAP_ANON | MAP_PRIVATE,
                -1,
                0,
            )
        };
        if buf == MAP_FAILED {
            return Err(TranslationError::ExecMemory {
                len,
                err: io::Error::last_os_error(),
            });
        }
        Ok(Self {
            buf: buf as *mut u8,
            len,
            used: 0,
        })
    }

    /// The size of the executable translation memory for an image whose code spans `lo..hi`.
    pub(crate) fn size_for_image(lo: u64, hi: u64) -> usize {
        let page = page_size::get();
        let text = usize::try_from(hi.saturating_sub(lo))
            .unwrap_or(usize::MAX)
            .saturating_mul(2)
            .saturating_add(4 * page);
        text.saturating_mul(10).saturating_add(4 * page)
    }

    pub(crate) fn base(&self) -> u64 {
        self.buf as u64
    }

    /// Return the size of this buffer in bytes.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Hand out the next `len` bytes, aligned to `align`, and return their address.
    pub(crate) fn carve(&mut self, len: usize, align: usize) -> Result<u64, TranslationError> {
        let start = self.used.next_multiple_of(align);
        let end = start.saturating_add(len);
        if end > self.len {
            return Err(TranslationError::CacheOverflow {
                need: end,
                have: self.len,
            });
        }
        self.used = end;
        Ok(self.base() + start as u64)
    }

    /// Hand back everything carved beyond `addr`, so the next carve starts there.
    pub(crate) fn release_after(&mut self, addr: u64) {
        let off = usize::try_from(addr - self.base()).unwrap_or(self.used);
        if off <= self.used {
            self.used = off;
        }
    }

    /// Does `[addr, addr + len)` lie within this mapping?
    pub(crate) fn contains(&self, addr: u64, len: usize) -> bool {
        addr >= self.base() && addr.saturating_add(len as u64) <= self.base() + self.len as u64
    }

    /// Copy `bytes` to `addr`.
    ///
    /// # Safety
    ///
    /// No thread may be executing `[addr, addr + bytes.len())`.
    pub(crate) unsafe fn write(&self, addr: u64, bytes: &[u8]) -> Result<(), TranslationError> {
        if !self.contains(addr, bytes.len()) {
            return Err(TranslationError::CacheOverflow {
                need: usize::try_from(addr - self.base()).unwrap_or(usize::MAX) + bytes.len(),
                have: self.len,
            });
        }
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len()) };
        Ok(())
    }
}
