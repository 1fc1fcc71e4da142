//! Errors raised while building, fixing up, and committing a translation generation.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TranslationError {
    #[error("Cannot decode instruction at 0x{addr:x}")]
    /// The bytes at `addr` do not decode to a valid x64 instruction.
    Decode { addr: u64 },
    #[error("Cannot encode instruction for 0x{addr:x}: {msg}")]
    /// An instruction (relocated or synthesised) could not be encoded at its new address. The
    /// `addr` is the original address the instruction was derived from.
    Encode { addr: u64, msg: String },
    #[error("Instruction store exhausted at {0} records")]
    /// The record store was pre-sized too small for the image.
    CapacityExhausted(usize),
    #[error("Cannot allocate {len} bytes of executable memory: {err}")]
    ExecMemory { len: usize, err: io::Error },
    #[error("Translation cache overflow: {need} bytes needed, {have} available")]
    /// The executable mapping was sized too small for the generated code.
    CacheOverflow { need: usize, have: usize },
    #[error("Displacement fixup did not converge after {0} passes")]
    /// Encodings kept changing size after the pass cap. This indicates an encoding defect.
    NoConvergence(usize),
    #[error("Layout mismatch: record at 0x{expected:x} written at 0x{actual:x}")]
    /// The committer's cursor disagreed with the fixed-up layout.
    Layout { expected: u64, actual: u64 },
    #[error("Cannot publish patch at 0x{addr:x}: {msg}")]
    Patch { addr: u64, msg: String },
    #[error("Cannot replace routine at 0x{addr:x}: {msg}")]
    /// The host refused to redirect one routine. Only that routine stays untranslated.
    Replace { addr: u64, msg: String },
    #[error("Internal error: {0}")]
    /// Something went wrong that is probably the result of a bug in the translator.
    Internal(String),
}

impl TranslationError {
    /// Does this error abort translation of the whole image?
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Replace { .. })
    }
}
