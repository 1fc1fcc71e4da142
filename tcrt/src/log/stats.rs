//! Statistics about a translation session. Durations are wall-clock time and are thus only a
//! rough guide.

#[cfg(not(test))]
use std::env;
use parking_lot::Mutex;
use std::{
    cell::Cell,
    fs,
    time::{Duration, Instant},
};
use strum::{Display, EnumCount, EnumIter, IntoEnumIterator};

/// Record statistics if enabled. Outside of testing, this is only enabled if the user defines the
/// environment variable `TCD_LOG_STATS`. In testing mode, this is always enabled, with output
/// being sent to `stderr`.
pub(crate) struct Stats {
    // Most runs don't record statistics, so "are stats enabled?" must be a pointer check. Only if
    // they are do we pay for the `Mutex`.
    inner: Option<Mutex<StatsInner>>,
}

struct StatsInner {
    /// The path to write output. If exactly equal to `-`, output will be written to stderr.
    output_path: String,
    /// How many routines were handed to the instrumentor?
    routines_translated: u64,
    /// How many routine entries did the host redirect successfully?
    routines_replaced_ok: u64,
    /// How many routine entries did the host refuse to redirect?
    routines_replaced_err: u64,
    /// Records in each generation (index 0 is the first generation).
    records: [u64; 2],
    /// Fixup passes needed by each generation.
    fixup_passes: [u64; 2],
    /// How many basic blocks were profiled?
    blocks: u64,
    /// How many exit-table cells were allocated?
    exit_cells: u64,
    /// How many indirect transfers were given a guarded direct path?
    devirtualised: u64,
    /// How many probe patches redirected the first cache into the second?
    probes_published: u64,
    /// The time spent in each [TimingState].
    durations: [Duration; TimingState::COUNT],
}

impl Stats {
    #[cfg(not(test))]
    pub fn new() -> Self {
        if let Ok(p) = env::var("TCD_LOG_STATS") {
            Self {
                inner: Some(Mutex::new(StatsInner::new(p))),
            }
        } else {
            Self { inner: None }
        }
    }

    #[cfg(test)]
    pub fn new() -> Self {
        Self {
            inner: Some(Mutex::new(StatsInner::new("-".to_string()))),
        }
    }

    /// If statistics are enabled, update `inner` by running the function `f`, otherwise return
    /// immediately without calling `f`.
    fn update_with<F>(&self, f: F)
    where
        F: FnOnce(&mut StatsInner),
    {
        if let Some(mtx) = &self.inner {
            f(&mut *mtx.lock());
        }
    }

    pub fn routine_translated(&self) {
        self.update_with(|inner| inner.routines_translated += 1);
    }

    pub fn routine_replaced_ok(&self) {
        self.update_with(|inner| inner.routines_replaced_ok += 1);
    }

    pub fn routine_replaced_err(&self) {
        self.update_with(|inner| inner.routines_replaced_err += 1);
    }

    /// Record the shape of a completed generation.
    pub fn generation_built(&self, gen: usize, records: usize, fixup_passes: usize) {
        self.update_with(|inner| {
            inner.records[gen] = u64::try_from(records).unwrap_or(u64::MAX);
            inner.fixup_passes[gen] = u64::try_from(fixup_passes).unwrap_or(u64::MAX);
        });
    }

    pub fn blocks_profiled(&self, n: usize) {
        self.update_with(|inner| inner.blocks = u64::try_from(n).unwrap_or(u64::MAX));
    }

    pub fn exit_cells(&self, n: usize) {
        self.update_with(|inner| inner.exit_cells = u64::try_from(n).unwrap_or(u64::MAX));
    }

    pub fn devirtualised(&self, n: usize) {
        self.update_with(|inner| inner.devirtualised += u64::try_from(n).unwrap_or(u64::MAX));
    }

    pub fn probe_published(&self) {
        self.update_with(|inner| inner.probes_published += 1);
    }

    /// Change the [TimingState] the current thread is in.
    pub fn timing_state(&self, new_state: TimingState) {
        self.update_with(|inner| {
            let now = Instant::now();
            let (prev_state, then) = PHASE.replace((new_state, now));
            let d = now.saturating_duration_since(then);
            inner.durations[prev_state as usize] =
                inner.durations[prev_state as usize].saturating_add(d);
        });
    }

    /// Output these statistics to the appropriate output path.
    pub(crate) fn output(&self) {
        self.update_with(|inner| inner.output());
    }
}

impl StatsInner {
    fn new(output_path: String) -> Self {
        Self {
            output_path,
            routines_translated: 0,
            routines_replaced_ok: 0,
            routines_replaced_err: 0,
            records: [0; 2],
            fixup_passes: [0; 2],
            blocks: 0,
            exit_cells: 0,
            devirtualised: 0,
            probes_published: 0,
            durations: [Duration::new(0, 0); TimingState::COUNT],
        }
    }

    fn output(&self) {
        let json = self.to_json();
        if self.output_path == "-" {
            eprintln!("{json}");
        } else {
            fs::write(&self.output_path, json).ok();
        }
    }

    /// Turn these statistics into JSON. The output is sorted by field name so that textual
    /// matching of the JSON string is possible.
    fn to_json(&self) -> String {
        fn fmt_duration(d: Duration) -> String {
            format!("{}.{:03}", d.as_secs(), d.subsec_millis())
        }

        let mut fields = vec![
            ("blocks".to_owned(), self.blocks.to_string()),
            ("devirtualised".to_owned(), self.devirtualised.to_string()),
            ("exit_cells".to_owned(), self.exit_cells.to_string()),
            ("fixup_passes_tc1".to_owned(), self.fixup_passes[0].to_string()),
            ("fixup_passes_tc2".to_owned(), self.fixup_passes[1].to_string()),
            (
                "probes_published".to_owned(),
                self.probes_published.to_string(),
            ),
            ("records_tc1".to_owned(), self.records[0].to_string()),
            ("records_tc2".to_owned(), self.records[1].to_string()),
            (
                "routines_replaced_err".to_owned(),
                self.routines_replaced_err.to_string(),
            ),
            (
                "routines_replaced_ok".to_owned(),
                self.routines_replaced_ok.to_string(),
            ),
            (
                "routines_translated".to_owned(),
                self.routines_translated.to_string(),
            ),
        ];
        for v in TimingState::iter() {
            let s = v.to_string();
            if !s.is_empty() {
                fields.push((s, fmt_duration(self.durations[v as usize])));
            }
        }
        fields.sort_unstable_by(|(k1, _), (k2, _)| k1.cmp(k2));
        format!(
            r#"{{
    {}
}}"#,
            fields
                .iter()
                .map(|(x, y)| format!(r#""{x}": {y}"#))
                .collect::<Vec<_>>()
                .join(",\n    ")
        )
    }
}

/// The phases a translating thread can be in.
#[repr(u8)]
#[derive(Copy, Clone, Display, EnumCount, EnumIter)]
// New states:
//   1. must keep `TimingState` convertible `as usize` without loss.
//   2. must not assign explicit discriminants: variants range over `0..TimingState::COUNT`.
//   3. need a `strum` `to_string` naming the JSON key. An empty string hides the state.
pub(crate) enum TimingState {
    /// Not translating. Not reported.
    #[strum(to_string = "")]
    None,
    /// Decoding routines and building records.
    #[strum(to_string = "duration_building")]
    Building,
    /// Running the displacement fixpoint.
    #[strum(to_string = "duration_fixup")]
    Fixup,
    /// Copying bytes and redirecting control flow.
    #[strum(to_string = "duration_committing")]
    Committing,
    /// Reading the profile and rewriting hot indirect transfers.
    #[strum(to_string = "duration_optimising")]
    Optimising,
}

thread_local! {
    static PHASE: Cell<(TimingState, Instant)> = Cell::new((TimingState::None, Instant::now()));
}
