//! Address utilities.

use cached::proc_macro::cached;
use libc::{c_void, Dl_info};
use std::{ffi::CStr, mem::MaybeUninit};

/// A Rust wrapper around `libc::Dl_info` using FFI types.
///
/// The strings inside are handed out by the loader and, since nothing we translate is ever
/// `dlclose`d, can be considered of static lifetime. That makes the struct thread safe and thus
/// cacheable using `#[cached]`.
#[derive(Debug, Clone)]
pub struct DLInfo {
    dli_sname: Option<&'static CStr>,
    dli_saddr: usize,
}

impl From<Dl_info> for DLInfo {
    fn from(dli: Dl_info) -> Self {
        let dli_sname = if !dli.dli_sname.is_null() {
            Some(unsafe { CStr::from_ptr(dli.dli_sname) })
        } else {
            None
        };
        Self {
            dli_sname,
            dli_saddr: dli.dli_saddr as usize,
        }
    }
}

impl DLInfo {
    /// The name of the nearest symbol at or below the address, if the loader knows one.
    pub fn dli_sname(&self) -> Option<&'static CStr> {
        self.dli_sname
    }
    pub fn dli_saddr(&self) -> usize {
        self.dli_saddr
    }
}

/// Wraps `libc::dladdr`.
///
/// Returns `None` if the underlying call fails, which is the normal outcome for code living in
/// anonymous mappings.
///
/// FIXME: This cache is never invalidated. Objects loaded after the first lookup of an address in
/// their range will be reported as unknown.
#[cached]
pub fn dladdr(vaddr: usize) -> Option<DLInfo> {
    let mut info = MaybeUninit::<Dl_info>::uninit();
    if unsafe { libc::dladdr(vaddr as *const c_void, info.as_mut_ptr()) } != 0 {
        Some(unsafe { info.assume_init() }.into())
    } else {
        None
    }
}

/// Describe `vaddr` as `symbol` or `symbol+0xoff`, or `None` if no symbol covers it.
pub fn symbolise(vaddr: usize) -> Option<String> {
    let info = dladdr(vaddr)?;
    let name = info.dli_sname()?.to_str().ok()?;
    match vaddr - info.dli_saddr() {
        0 => Some(name.to_owned()),
        off => Some(format!("{name}+0x{off:x}")),
    }
}
