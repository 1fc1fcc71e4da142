//! A dynamic binary translator for x64 code that is already loaded and running.
//!
//! A [TranslationSession] relocates a program's routines into a first translation cache that
//! counts how often each basic block runs and where indirect transfers go. After a warm-up period,
//! a background thread builds a second cache in which hot indirect transfers get a guarded direct
//! path to their dominant target, and redirects the first cache into it while program threads
//! keep running.

#![allow(clippy::new_without_default)]

mod chain;
mod codebuf;
mod codec;
mod commit;
mod config;
mod devirt;
mod dump;
mod errors;
mod exits;
mod fixup;
mod host;
mod instrument;
mod log;
mod optimiser;
mod patch;
mod profile;
mod record;
mod session;
#[cfg(test)]
mod testing;

pub use self::config::Options;
pub use self::errors::TranslationError;
pub use self::host::{Host, InProcessHost, Routine};
pub use self::session::TranslationSession;
