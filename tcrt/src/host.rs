//! The host: whatever knows where a program's routines are and can redirect their entries.

use crate::{
    codec::{self, BranchKind, PATCH_SLOT_LEN},
    errors::TranslationError,
    patch,
};
use iced_x86::Instruction;
use std::slice;

/// A routine of the program being translated.
#[derive(Clone, Debug)]
pub struct Routine {
    pub name: String,
    /// The routine's entry, which is also its lowest address.
    pub addr: u64,
    /// The routine's instructions in address order. Each instruction's `ip` is its address.
    pub insts: Vec<Instruction>,
}

impl Routine {
    /// The address one byte beyond the routine's last instruction.
    pub fn end_addr(&self) -> u64 {
        self.insts
            .last()
            .map(|i| i.next_ip())
            .unwrap_or(self.addr)
    }
}

pub trait Host: Send + Sync {
    /// The routines to translate, ordered by address.
    fn routines(&self) -> Result<Vec<Routine>, TranslationError>;

    /// Can the entry of the routine at `addr` be redirected without breaking the program?
    fn is_safe_for_replacement(&self, addr: u64) -> bool;

    /// Redirect every future entry to the routine at `addr` to `new_entry`, returning the address
    /// the routine was previously entered at.
    fn replace_routine(&self, addr: u64, new_entry: u64) -> Result<u64, TranslationError>;

    /// A human readable name for the routine at `addr`.
    fn routine_name(&self, addr: u64) -> Option<String>;
}

struct RoutineDesc {
    name: Option<String>,
    addr: u64,
    len: usize,
}

/// A host for routines of the current process, described by address and length.
///
/// Redirection overwrites a routine's first 5 bytes with `jmp rel32`, so routines must be 4-byte
/// aligned and writable (the host makes their pages writable first).
#[derive(Default)]
pub struct InProcessHost {
    routines: Vec<RoutineDesc>,
}

impl InProcessHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the `len` bytes at `addr` as a routine. If `name` is `None`, the dynamic linker is asked
    /// for one when needed.
    ///
    /// # Safety
    ///
    /// `addr..addr + len` must be readable code of this process for as long as the host lives.
    pub unsafe fn add_routine(&mut self, name: Option<&str>, addr: u64, len: usize) {
        let at = self
            .routines
            .partition_point(|r| r.addr < addr);
        self.routines.insert(
            at,
            RoutineDesc {
                name: name.map(|x| x.to_owned()),
                addr,
                len,
            },
        );
    }

    fn desc(&self, addr: u64) -> Option<&RoutineDesc> {
        self.routines.iter().find(|r| r.addr == addr)
    }

    fn decode(&self, desc: &RoutineDesc) -> Result<Vec<Instruction>, TranslationError> {
        // SAFETY: guaranteed by `add_routine`'s caller.
        let bytes = unsafe { slice::from_raw_parts(desc.addr as *const u8, desc.len) };
        codec::decode_routine(desc.addr, bytes)
    }
}

impl Host for InProcessHost {
    fn routines(&self) -> Result<Vec<Routine>, TranslationError> {
        self.routines
            .iter()
            .map(|d| {
                Ok(Routine {
                    name: self
                        .routine_name(d.addr)
                        .unwrap_or_else(|| format!("0x{:x}", d.addr)),
                    addr: d.addr,
                    insts: self.decode(d)?,
                })
            })
            .collect()
    }

    fn is_safe_for_replacement(&self, addr: u64) -> bool {
        let Some(desc) = self.desc(addr) else {
            return false;
        };
        if desc.len < PATCH_SLOT_LEN {
            return false;
        }
        let Ok(insts) = self.decode(desc) else {
            return false;
        };
        // Nothing may jump into the bytes the redirection overwrites.
        let patched = addr + 1..addr + PATCH_SLOT_LEN as u64;
        !insts
            .iter()
            .filter(|i| BranchKind::classify(i).is_direct())
            .any(|i| patched.contains(&i.near_branch_target()))
    }

    fn replace_routine(&self, addr: u64, new_entry: u64) -> Result<u64, TranslationError> {
        let replace_err = |msg: String| TranslationError::Replace { addr, msg };
        if !self.is_safe_for_replacement(addr) {
            return Err(replace_err("not safe for replacement".into()));
        }
        let jmp = codec::jmp_rel32(addr, new_entry)
            .ok_or_else(|| replace_err(format!("0x{new_entry:x} is out of range")))?;
        patch::make_writable(addr, PATCH_SLOT_LEN).map_err(|e| replace_err(e.to_string()))?;
        // SAFETY: the entry is writable code, and was checked to be long enough.
        unsafe { patch::publish(addr, &jmp) }.map_err(|e| replace_err(e.to_string()))?;
        Ok(addr)
    }

    fn routine_name(&self, addr: u64) -> Option<String> {
        match self.desc(addr).and_then(|d| d.name.clone()) {
            Some(name) => Some(name),
            None => tcaddr::addr::symbolise(usize::try_from(addr).ok()?),
        }
    }
}
