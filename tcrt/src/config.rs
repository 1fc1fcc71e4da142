//! Translation options.
//!
//! Options can be built programmatically with the chained setters on [Options] or read from the
//! environment with [Options::from_env]:
//!
//! - `TC_VERBOSE`: trace every step (implies `TCD_LOG` level 4).
//! - `TC_DUMP_ORIG_CODE`, `TC_DUMP_TC`, `TC_DUMP_TC2`: disassemble the original code, the first
//!   cache, and the second cache.
//! - `TC_DUMP_PROFILE`: at exit, dump every first-generation record with its block's counters.
//! - `TC_DUMP_BLOCK_MAP`: at exit, dump the block table.
//! - `TC_NO_COMMIT`: build everything but never patch running code.
//! - `TC_CREATE_TC2`: profile the first cache and build an optimised second cache.
//! - `TC_PROF_TIME`: seconds to profile before building the second cache.
//! - `TC_PROBE_BACK_JUMPS`: also redirect backward jumps into the second cache.
//! - `TC_NO_CODE_REORDER`: accepted and ignored.
//! - `TC_JUMP_COUNT`, `TC_JUMP_PERCENT`: devirtualisation thresholds.
//!
//! Booleans take the values `0` and `1`.

use std::{env, error::Error, time::Duration};

const DEFAULT_PROFILING_DURATION: Duration = Duration::from_secs(2);
/// An indirect transfer must have been executed at least this many times to be devirtualised.
const DEFAULT_JUMP_COUNT_THRESHOLD: u64 = 512;
/// The dominant target must account for at least this percentage of executions.
const DEFAULT_JUMP_PERCENT_THRESHOLD: u64 = 50;

#[derive(Clone, Debug)]
pub struct Options {
    pub(crate) verbose: bool,
    pub(crate) dump_original_code: bool,
    pub(crate) dump_tc1: bool,
    pub(crate) dump_tc2: bool,
    pub(crate) dump_profile: bool,
    pub(crate) dump_block_map: bool,
    pub(crate) do_not_commit: bool,
    pub(crate) create_second_cache: bool,
    pub(crate) profiling_duration: Duration,
    pub(crate) probe_backward_jumps: bool,
    pub(crate) no_code_reorder: bool,
    pub(crate) jump_count_threshold: u64,
    pub(crate) jump_percent_threshold: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            verbose: false,
            dump_original_code: false,
            dump_tc1: false,
            dump_tc2: false,
            dump_profile: false,
            dump_block_map: false,
            do_not_commit: false,
            create_second_cache: false,
            profiling_duration: DEFAULT_PROFILING_DURATION,
            probe_backward_jumps: false,
            no_code_reorder: false,
            jump_count_threshold: DEFAULT_JUMP_COUNT_THRESHOLD,
            jump_percent_threshold: DEFAULT_JUMP_PERCENT_THRESHOLD,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read options from `TC_*` environment variables, starting from the defaults.
    pub fn from_env() -> Result<Self, Box<dyn Error>> {
        Self::from_vars(|k| env::var(k).ok())
    }

    fn from_vars<F>(var: F) -> Result<Self, Box<dyn Error>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |k: &str, dflt: bool| -> Result<bool, Box<dyn Error>> {
            match var(k).as_deref() {
                None => Ok(dflt),
                Some("1") => Ok(true),
                Some("0") => Ok(false),
                Some(x) => Err(format!("{k} must be 0 or 1, not '{x}'").into()),
            }
        };
        let num = |k: &str, dflt: u64| -> Result<u64, Box<dyn Error>> {
            match var(k) {
                None => Ok(dflt),
                Some(x) => x
                    .parse::<u64>()
                    .map_err(|e| format!("Invalid {k} value '{x}': {e}").into()),
            }
        };

        let dflt = Self::default();
        let jump_percent_threshold = num("TC_JUMP_PERCENT", dflt.jump_percent_threshold)?;
        if jump_percent_threshold > 100 {
            return Err(format!("TC_JUMP_PERCENT {jump_percent_threshold} exceeds 100").into());
        }
        Ok(Self {
            verbose: flag("TC_VERBOSE", dflt.verbose)?,
            dump_original_code: flag("TC_DUMP_ORIG_CODE", dflt.dump_original_code)?,
            dump_tc1: flag("TC_DUMP_TC", dflt.dump_tc1)?,
            dump_tc2: flag("TC_DUMP_TC2", dflt.dump_tc2)?,
            dump_profile: flag("TC_DUMP_PROFILE", dflt.dump_profile)?,
            dump_block_map: flag("TC_DUMP_BLOCK_MAP", dflt.dump_block_map)?,
            do_not_commit: flag("TC_NO_COMMIT", dflt.do_not_commit)?,
            create_second_cache: flag("TC_CREATE_TC2", dflt.create_second_cache)?,
            profiling_duration: Duration::from_secs(num(
                "TC_PROF_TIME",
                dflt.profiling_duration.as_secs(),
            )?),
            probe_backward_jumps: flag("TC_PROBE_BACK_JUMPS", dflt.probe_backward_jumps)?,
            no_code_reorder: flag("TC_NO_CODE_REORDER", dflt.no_code_reorder)?,
            jump_count_threshold: num("TC_JUMP_COUNT", dflt.jump_count_threshold)?,
            jump_percent_threshold,
        })
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn dump_original_code(mut self, dump: bool) -> Self {
        self.dump_original_code = dump;
        self
    }

    pub fn dump_tc1(mut self, dump: bool) -> Self {
        self.dump_tc1 = dump;
        self
    }

    pub fn dump_tc2(mut self, dump: bool) -> Self {
        self.dump_tc2 = dump;
        self
    }

    pub fn dump_profile(mut self, dump: bool) -> Self {
        self.dump_profile = dump;
        self
    }

    pub fn dump_block_map(mut self, dump: bool) -> Self {
        self.dump_block_map = dump;
        self
    }

    /// Build caches but never redirect running code into them.
    pub fn do_not_commit(mut self, do_not_commit: bool) -> Self {
        self.do_not_commit = do_not_commit;
        self
    }

    /// Profile the first cache and, after [Self::profiling_duration], build the second.
    pub fn create_second_cache(mut self, create: bool) -> Self {
        self.create_second_cache = create;
        self
    }

    pub fn profiling_duration(mut self, d: Duration) -> Self {
        self.profiling_duration = d;
        self
    }

    /// Reserve probe slots before backward jumps as well as at routine heads.
    pub fn probe_backward_jumps(mut self, probe: bool) -> Self {
        self.probe_backward_jumps = probe;
        self
    }

    /// Reserved. Code is always laid out in original program order.
    pub fn no_code_reorder(mut self, no_reorder: bool) -> Self {
        self.no_code_reorder = no_reorder;
        self
    }

    pub fn jump_count_threshold(mut self, count: u64) -> Self {
        self.jump_count_threshold = count;
        self
    }

    /// The share of executions the dominant target needs. Percentages above 100 are clamped.
    pub fn jump_percent_threshold(mut self, percent: u64) -> Self {
        self.jump_percent_threshold = percent.min(100);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(pairs: &[(&str, &str)]) -> Result<Options, Box<dyn Error>> {
        let m = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        Options::from_vars(|k| m.get(k).cloned())
    }

    #[test]
    fn defaults() {
        let o = from(&[]).unwrap();
        assert!(!o.create_second_cache);
        assert_eq!(o.profiling_duration, Duration::from_secs(2));
        assert_eq!(o.jump_count_threshold, 512);
        assert_eq!(o.jump_percent_threshold, 50);
    }

    #[test]
    fn parse_flags() {
        let o = from(&[
            ("TC_CREATE_TC2", "1"),
            ("TC_PROF_TIME", "5"),
            ("TC_PROBE_BACK_JUMPS", "1"),
            ("TC_NO_COMMIT", "0"),
            ("TC_JUMP_COUNT", "100"),
        ])
        .unwrap();
        assert!(o.create_second_cache);
        assert!(o.probe_backward_jumps);
        assert!(!o.do_not_commit);
        assert_eq!(o.profiling_duration, Duration::from_secs(5));
        assert_eq!(o.jump_count_threshold, 100);
    }

    #[test]
    fn bad_values() {
        assert!(from(&[("TC_VERBOSE", "yes")]).is_err());
        assert!(from(&[("TC_PROF_TIME", "-1")]).is_err());
        assert!(from(&[("TC_JUMP_PERCENT", "101")]).is_err());
    }

    #[test]
    fn builder() {
        let o = Options::new()
            .create_second_cache(true)
            .profiling_duration(Duration::ZERO)
            .jump_percent_threshold(60);
        assert!(o.create_second_cache);
        assert_eq!(o.profiling_duration, Duration::ZERO);
        assert_eq!(o.jump_percent_threshold, 60);
        assert_eq!(Options::new().jump_percent_threshold(250).jump_percent_threshold, 100);
    }
}
