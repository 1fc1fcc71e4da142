//! The implementation of the `TCD_LOG` and `TCD_LOG_STATS` environment variables.

use std::{env, error::Error, fs::File, io::Write, path::PathBuf};
use strum::{EnumCount, FromRepr};

pub(crate) mod stats;

/// How verbose should the translator's normal logging be?
#[repr(u8)]
#[derive(Copy, Clone, Debug, EnumCount, FromRepr, PartialEq, PartialOrd)]
pub(crate) enum Verbosity {
    /// Disable logging entirely.
    Disabled,
    /// Log errors.
    Error,
    /// Log warnings.
    Warning,
    /// Log translation events (e.g. a generation committed, profiling disabled).
    Event,
    /// Log every step, including every record built and every fixup pass.
    Trace,
}

pub(crate) struct Log {
    /// The requested [Verbosity] level for logging.
    level: Verbosity,
    /// The path to write to. `None` means stderr.
    path: Option<PathBuf>,
}

impl Log {
    pub(crate) fn new() -> Result<Self, Box<dyn Error>> {
        match env::var("TCD_LOG") {
            Ok(s) => Self::from_spec(&s),
            Err(_) => Ok(Self {
                path: None,
                level: Verbosity::Error,
            }),
        }
    }

    /// Parse a `[<path|->:]<level>` string.
    fn from_spec(s: &str) -> Result<Self, Box<dyn Error>> {
        let (path, level) = match s.split(':').collect::<Vec<_>>()[..] {
            [path, level] => {
                if path == "-" {
                    (None, level)
                } else {
                    let path = PathBuf::from(path);
                    // Truncate any previous run's log: later writes append.
                    File::create(&path).ok();
                    (Some(path), level)
                }
            }
            [level] => (None, level),
            [..] => return Err("TCD_LOG must be of the format `[<path|->:]<level>`".into()),
        };
        let level = level
            .parse::<u8>()
            .map_err(|e| format!("Invalid TCD_LOG level '{s}': {e}"))?;
        let max_level = Verbosity::COUNT - 1;
        let level = Verbosity::from_repr(level)
            .ok_or_else(|| format!("TCD_LOG level {level} exceeds maximum {max_level}"))?;
        Ok(Self { path, level })
    }

    /// A log writing to stderr at `level`.
    #[cfg(test)]
    pub(crate) fn with_level(level: Verbosity) -> Self {
        Self { path: None, level }
    }

    /// Raise the level to at least `level`.
    pub(crate) fn raise_to(&mut self, level: Verbosity) {
        if level > self.level {
            self.level = level;
        }
    }

    pub(crate) fn enabled(&self, level: Verbosity) -> bool {
        level != Verbosity::Disabled && level <= self.level
    }

    /// Log `msg` with the [Verbosity] level `level`.
    ///
    /// # Panics
    ///
    /// If `level == Verbosity::Disabled`.
    pub(crate) fn log(&self, level: Verbosity, msg: &str) {
        if level <= self.level {
            let prefix = match level {
                Verbosity::Disabled => panic!(),
                Verbosity::Error => "tc-error",
                Verbosity::Warning => "tc-warning",
                Verbosity::Event => "tc-event",
                Verbosity::Trace => "tc-trace",
            };
            self.write(&format!("{prefix}: {msg}\n"));
        }
    }

    /// Write a diagnostic dump. Dumps are requested explicitly, so they ignore the log level.
    pub(crate) fn dump(&self, s: &str) {
        self.write(s);
        if !s.ends_with('\n') {
            self.write("\n");
        }
    }

    fn write(&self, s: &str) {
        match &self.path {
            Some(p) => {
                File::options()
                    .append(true)
                    .open(p)
                    .map(|mut x| x.write(s.as_bytes()))
                    .ok();
            }
            None => eprint!("{s}"),
        }
    }
}
