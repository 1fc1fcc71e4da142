//! The background optimiser: once the first generation has gathered a profile, build the second
//! generation and redirect the first into it.
//!
//! The optimiser runs concurrently with program threads executing the first cache. It only
//! touches live code through [crate::patch::publish]: first to skip every profiling stub, then to
//! turn each probe slot into a jump to the second cache.

use crate::{
    chain::chain,
    commit,
    devirt::Devirtualiser,
    errors::TranslationError,
    instrument,
    log::{stats::TimingState, Verbosity},
    session::{Generation, Shared, State},
};
use parking_lot::MutexGuard;
use std::{
    io,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Instant,
};

/// Start the optimiser thread. It waits for the first generation to be committed, lets it run for
/// the warm-up period, then builds the second generation. It gives up as soon as the session
/// shuts down.
pub(crate) fn spawn(shared: Arc<Shared>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("tc-optimiser".to_owned())
        .spawn(move || {
            let mut lk = shared.state.lock();
            while lk.caches.is_none() && !lk.shutdown {
                shared.changed.wait(&mut lk);
            }
            let deadline = Instant::now() + shared.opts.profiling_duration;
            while !lk.shutdown {
                if shared.changed.wait_until(&mut lk, deadline).timed_out() {
                    break;
                }
            }
            if lk.shutdown {
                return;
            }
            if let Err(e) = second_generation(&shared, &mut lk) {
                shared.log.log(
                    Verbosity::Error,
                    &format!("second cache abandoned, first cache stays live: {e}"),
                );
            }
        })
}

/// Build, commit and publish the second generation, unless it already exists.
pub(crate) fn second_generation(
    sh: &Shared,
    state: &mut MutexGuard<'_, State>,
) -> Result<(), TranslationError> {
    if !sh.opts.create_second_cache {
        return Err(TranslationError::Internal("second cache not enabled".into()));
    }
    let Some(caches) = state.caches.as_mut() else {
        return Err(TranslationError::Internal(
            "no first generation to optimise".into(),
        ));
    };
    if caches.gen2.is_some() {
        return Ok(());
    }

    sh.stats.timing_state(TimingState::Optimising);
    if !sh.opts.do_not_commit {
        // SAFETY: the first generation has been committed.
        let n = unsafe { instrument::disable_profiling(&caches.gen1.store)? };
        sh.log.log(
            Verbosity::Event,
            &format!("profiling disabled: {n} stubs skipped"),
        );
    }

    let mut store = caches.gen1.store.derive()?;
    let done = Devirtualiser::new(
        &mut store,
        &caches.profile,
        &caches.map,
        &mut caches.exits,
        sh.opts.jump_count_threshold,
        sh.opts.jump_percent_threshold,
    )
    .run()?;
    if sh.log.enabled(Verbosity::Trace) {
        for b in &done {
            if let Some(t) = caches.profile.info(*b).terminator {
                sh.log.log(
                    Verbosity::Trace,
                    &format!(
                        "devirtualised block {} ending at 0x{:x}",
                        b.index(),
                        store[t].orig_addr
                    ),
                );
            }
        }
    }
    sh.stats.devirtualised(done.len());
    chain(&mut store, &caches.map);

    sh.stats.timing_state(TimingState::Fixup);
    let gen2 = Generation::lay_out(store, &mut caches.exits, &mut caches.mem)?;
    sh.stats.generation_built(1, gen2.store.len(), gen2.passes);
    sh.stats.exit_cells(caches.exits.len());

    sh.stats.timing_state(TimingState::Committing);
    // SAFETY: the second cache's range was carved fresh from the mapping. Nothing jumps into it
    // until the probes are published.
    unsafe { gen2.copy_to(&caches.mem)? };
    if sh.opts.do_not_commit {
        sh.log.log(Verbosity::Event, "second cache built but not committed");
    } else {
        // SAFETY: both generations have been copied to executable memory.
        let n = unsafe { commit::probe(&caches.gen1.store, &gen2.store, &sh.stats)? };
        sh.log.log(
            Verbosity::Event,
            &format!(
                "second cache committed at 0x{:x}-0x{:x}: {n} probes published, {} blocks devirtualised",
                gen2.start,
                gen2.end,
                done.len()
            ),
        );
    }
    caches.gen2 = Some(gen2);
    sh.stats.timing_state(TimingState::None);
    Ok(())
}
