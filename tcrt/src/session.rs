//! A translation session: everything built for one image, from the first generation to teardown.

use crate::{
    chain::{chain, ChainMap},
    codebuf::ExecMemory,
    commit,
    config::Options,
    dump,
    errors::TranslationError,
    exits::ExitTable,
    fixup::fixup,
    host::{Host, Routine},
    instrument::Instrumentor,
    log::{
        stats::{Stats, TimingState},
        Log, Verbosity,
    },
    optimiser,
    profile::ProfileTable,
    record::{InsIdx, RecordKind, RecordStore},
};
use parking_lot::{Condvar, Mutex};
use std::{error::Error, panic::resume_unwind, sync::Arc, thread, thread::JoinHandle};

/// The most records a single program instruction can expand into: a routine head slot, a
/// backward jump slot, a full indirect profiling stub, and the instruction itself.
const RECORD_CAPACITY_FACTOR: usize = 32;

/// One laid out generation of translated code.
pub(crate) struct Generation {
    pub(crate) store: RecordStore,
    /// The address of the generation's first byte.
    pub(crate) start: u64,
    /// The address just beyond the generation's last byte.
    pub(crate) end: u64,
    /// How many fixup passes were needed?
    pub(crate) passes: usize,
}

impl Generation {
    /// Lay `store` out at the next free address of `mem` and claim the space it needs.
    pub(crate) fn lay_out(
        mut store: RecordStore,
        exits: &mut ExitTable,
        mem: &mut ExecMemory,
    ) -> Result<Self, TranslationError> {
        let start = mem.carve(0, 16)?;
        let r = fixup(&mut store, exits, start).and_then(|passes| {
            let end = store.end_addr(start);
            mem.carve(usize::try_from(end - start).unwrap_or(usize::MAX), 1)?;
            Ok((passes, end))
        });
        match r {
            Ok((passes, end)) => Ok(Self {
                store,
                start,
                end,
                passes,
            }),
            Err(e) => {
                mem.release_after(start);
                Err(e)
            }
        }
    }

    /// Copy this generation's bytes into `mem`.
    ///
    /// # Safety
    ///
    /// No thread may be executing this generation's address range.
    pub(crate) unsafe fn copy_to(&self, mem: &ExecMemory) -> Result<(), TranslationError> {
        let end = unsafe { commit::copy(&self.store, mem, self.start)? };
        if end != self.end {
            return Err(TranslationError::Layout {
                expected: self.end,
                actual: end,
            });
        }
        Ok(())
    }

    /// The translated entry of the routine at the program address `addr`.
    fn head(&self, addr: u64) -> Option<InsIdx> {
        self.store
            .iter_enumerated()
            .find(|(_, r)| r.kind == RecordKind::RoutineHead && r.orig_addr == addr)
            .map(|(i, _)| i)
    }
}

/// Everything derived from the first generation.
pub(crate) struct Caches {
    /// Holds the exit table and both generations' code.
    pub(crate) mem: ExecMemory,
    pub(crate) exits: ExitTable,
    /// Updated concurrently by the first generation's profiling stubs.
    pub(crate) profile: ProfileTable,
    /// Program addresses to first generation records.
    pub(crate) map: ChainMap,
    pub(crate) gen1: Generation,
    pub(crate) gen2: Option<Generation>,
}

pub(crate) struct State {
    pub(crate) caches: Option<Caches>,
    /// Set when the session is torn down.
    pub(crate) shutdown: bool,
}

/// What a session shares with its background optimiser.
pub(crate) struct Shared {
    pub(crate) host: Arc<dyn Host>,
    pub(crate) opts: Options,
    pub(crate) log: Log,
    pub(crate) stats: Stats,
    pub(crate) state: Mutex<State>,
    /// Notified when the first generation is committed, or the session shuts down.
    pub(crate) changed: Condvar,
}

/// A translation session for one program image.
///
/// The session owns every record, profile and executable buffer it builds. Executable memory is
/// never released: the program may be running translated code until it exits.
pub struct TranslationSession {
    shared: Arc<Shared>,
    optimiser: Option<JoinHandle<()>>,
}

impl TranslationSession {
    /// Create a session translating `host`'s routines. If `opts` enables the second cache, the
    /// background optimiser is started: it waits until [Self::translate] has committed the first
    /// generation.
    pub fn new(host: Arc<dyn Host>, opts: Options) -> Result<Self, Box<dyn Error>> {
        let mut log = Log::new()?;
        if opts.verbose {
            log.raise_to(Verbosity::Trace);
        }
        if opts.no_code_reorder {
            log.log(Verbosity::Event, "code reordering is not supported: option ignored");
        }
        let shared = Arc::new(Shared {
            host,
            log,
            stats: Stats::new(),
            state: Mutex::new(State {
                caches: None,
                shutdown: false,
            }),
            changed: Condvar::new(),
            opts,
        });
        let optimiser = if shared.opts.create_second_cache {
            Some(optimiser::spawn(Arc::clone(&shared))?)
        } else {
            None
        };
        Ok(Self { shared, optimiser })
    }

    /// Build the first generation and redirect the program's routines into it. On error, no
    /// routine has been redirected.
    pub fn translate(&self) -> Result<(), TranslationError> {
        let sh = &*self.shared;
        let mut lk = sh.state.lock();
        if lk.caches.is_some() {
            return Err(TranslationError::Internal("image already translated".into()));
        }
        let r = first_generation(sh);
        sh.stats.timing_state(TimingState::None);
        match r {
            Ok(caches) => {
                lk.caches = Some(caches);
                sh.changed.notify_all();
                Ok(())
            }
            Err(e) => {
                sh.log.log(Verbosity::Error, &format!("translation failed: {e}"));
                Err(e)
            }
        }
    }

    /// Build and publish the second generation now, without waiting for the warm-up period to
    /// elapse. Does nothing if the second generation already exists.
    pub fn optimise(&self) -> Result<(), TranslationError> {
        let mut lk = self.shared.state.lock();
        optimiser::second_generation(&self.shared, &mut lk)
    }

    /// The first cache's entry for the routine at `addr`.
    pub fn translated_entry(&self, addr: u64) -> Option<u64> {
        let lk = self.shared.state.lock();
        let gen1 = &lk.caches.as_ref()?.gen1;
        gen1.head(addr).map(|i| gen1.store[i].new_addr)
    }

    /// The second cache's entry for the routine at `addr`.
    pub fn optimised_entry(&self, addr: u64) -> Option<u64> {
        let lk = self.shared.state.lock();
        let caches = lk.caches.as_ref()?;
        let idx = caches.gen1.head(addr)?;
        caches.gen2.as_ref().map(|g| g.store[idx].new_addr)
    }

    /// A disassembly of the first cache.
    pub fn first_cache_dump(&self) -> Option<String> {
        let lk = self.shared.state.lock();
        Some(dump::cache("tc1", &lk.caches.as_ref()?.gen1.store))
    }

    /// A disassembly of the second cache.
    pub fn second_cache_dump(&self) -> Option<String> {
        let lk = self.shared.state.lock();
        let gen2 = lk.caches.as_ref()?.gen2.as_ref()?;
        Some(dump::cache("tc2", &gen2.store))
    }

    /// The profile of the first generation, one line per instruction.
    pub fn profile_dump(&self) -> Option<String> {
        let lk = self.shared.state.lock();
        let caches = lk.caches.as_ref()?;
        Some(dump::profile_map(&caches.gen1.store, &caches.profile))
    }

    /// Stop the optimiser, write any requested dumps and statistics.
    pub fn finish(mut self) {
        self.stop_optimiser();
        let sh = &*self.shared;
        {
            let lk = sh.state.lock();
            if let Some(caches) = lk.caches.as_ref() {
                if sh.opts.dump_profile {
                    sh.log
                        .dump(&dump::profile_map(&caches.gen1.store, &caches.profile));
                }
                if sh.opts.dump_block_map {
                    sh.log.dump(&dump::block_map(&caches.profile, &caches.gen1.store));
                }
                if let (true, Some(gen2)) = (sh.opts.dump_tc2, caches.gen2.as_ref()) {
                    sh.log.dump(&dump::cache("tc2", &gen2.store));
                }
            }
        }
        sh.stats.output();
    }

    fn stop_optimiser(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.changed.notify_all();
        if let Some(hdl) = self.optimiser.take() {
            if let Err(e) = hdl.join() {
                if !thread::panicking() {
                    // Despite the name `resume_unwind` will abort if the unwind strategy in Rust is
                    // set to `abort`.
                    eprintln!("tc optimiser thread error");
                    resume_unwind(e);
                }
            }
        }
    }
}

impl Drop for TranslationSession {
    fn drop(&mut self) {
        self.stop_optimiser();
    }
}

/// Build, lay out and commit the first generation.
fn first_generation(sh: &Shared) -> Result<Caches, TranslationError> {
    sh.stats.timing_state(TimingState::Building);
    let routines = sh.host.routines()?;
    if sh.opts.dump_original_code {
        sh.log.dump(&dump::original_code(&routines));
    }
    let ninsts = routines.iter().map(|r| r.insts.len()).sum::<usize>();
    if ninsts == 0 {
        return Err(TranslationError::Internal("no code to translate".into()));
    }
    let (lo, hi) = routines.iter().fold((u64::MAX, 0), |(lo, hi), r| {
        (lo.min(r.addr), hi.max(r.end_addr()))
    });
    let mut mem = ExecMemory::new(ExecMemory::size_for_image(lo, hi), Some(lo))?;
    sh.log.log(
        Verbosity::Event,
        &format!(
            "image 0x{lo:x}-0x{hi:x}: {} routines, {ninsts} instructions, {} byte cache at 0x{:x}",
            routines.len(),
            mem.len(),
            mem.base()
        ),
    );
    // Every exit cell is the target of a direct branch, or the hot target of an indirect one.
    let mut exits = ExitTable::new(mem.carve(ExitTable::size_of(ninsts), 8)?, ninsts);

    let mut store = RecordStore::with_capacity(ninsts * RECORD_CAPACITY_FACTOR);
    let mut profile = ProfileTable::with_capacity(ninsts);
    build(sh, &routines, &mut store, &mut profile)?;
    sh.stats.blocks_profiled(profile.num_blocks());
    let map = ChainMap::build(&store);
    let chained = chain(&mut store, &map);
    sh.log.log(
        Verbosity::Trace,
        &format!("{} records, {chained} branches chained", store.len()),
    );

    sh.stats.timing_state(TimingState::Fixup);
    let gen1 = Generation::lay_out(store, &mut exits, &mut mem)?;
    sh.stats.generation_built(0, gen1.store.len(), gen1.passes);
    sh.stats.exit_cells(exits.len());

    sh.stats.timing_state(TimingState::Committing);
    // SAFETY: nothing can be executing the cache before routines are redirected to it.
    unsafe { gen1.copy_to(&mem)? };
    if sh.opts.do_not_commit {
        sh.log.log(Verbosity::Event, "first cache built but not committed");
    } else {
        let n = commit::replace_routines(&*sh.host, &gen1.store, &sh.log, &sh.stats);
        sh.log.log(
            Verbosity::Event,
            &format!(
                "first cache committed at 0x{:x}-0x{:x}: {n} of {} routines redirected",
                gen1.start,
                gen1.end,
                routines.len()
            ),
        );
    }
    if sh.opts.dump_tc1 {
        sh.log.dump(&dump::cache("tc1", &gen1.store));
    }
    Ok(Caches {
        mem,
        exits,
        profile,
        map,
        gen1,
        gen2: None,
    })
}

fn build(
    sh: &Shared,
    routines: &[Routine],
    store: &mut RecordStore,
    profile: &mut ProfileTable,
) -> Result<(), TranslationError> {
    let mut inst = Instrumentor::new(
        store,
        profile,
        sh.opts.create_second_cache,
        sh.opts.probe_backward_jumps,
    );
    for rtn in routines {
        if sh.log.enabled(Verbosity::Trace) {
            sh.log.log(
                Verbosity::Trace,
                &format!("translating {} at 0x{:x}", rtn.name, rtn.addr),
            );
        }
        inst.routine(rtn)?;
        sh.stats.routine_translated();
    }
    Ok(())
}
