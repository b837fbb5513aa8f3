//! Shared background-maintenance-thread plumbing (`spec.md` §4.6, §6.2),
//! used by the no-hot-spot skip list, the rotating no-hot-spot skip
//! list, and the speculation-friendly AVL tree. Each of those engines
//! supplies its own "one pass" closure; this module owns the
//! start/stop/idempotence and sleep-interval bookkeeping common to all
//! three, so that contract doesn't get re-implemented three times.

use std::sync::atomic::Ordering::{Relaxed, SeqCst};
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, trace};

/// Cumulative counters exposed through `bg_stats` (`spec.md` §6.2).
#[derive(Default)]
pub struct Stats {
    pub loops: AtomicU64,
    pub raises: AtomicU64,
    pub lowers: AtomicU64,
    pub delete_attempts: AtomicU64,
    pub delete_succeeds: AtomicU64,
}

/// A snapshot of [`Stats`], returned by `bg_stats`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub loops: u64,
    pub raises: u64,
    pub lowers: u64,
    pub delete_attempts: u64,
    pub delete_succeeds: u64,
}

impl Stats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            loops: self.loops.load(Relaxed),
            raises: self.raises.load(Relaxed),
            lowers: self.lowers.load(Relaxed),
            delete_attempts: self.delete_attempts.load(Relaxed),
            delete_succeeds: self.delete_succeeds.load(Relaxed),
        }
    }
}

/// One background maintenance thread, with idempotent start/stop and a
/// cumulative [`Stats`] block shared with the caller.
///
/// The thread never holds a node lock across its `sleep`, and responds
/// to `stop()` within one sleep period, per `spec.md` §4.6.
pub struct Background {
    stats: Arc<Stats>,
    finished: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Background {
    pub fn new() -> Background {
        Background {
            stats: Arc::new(Stats::default()),
            finished: Arc::new(AtomicBool::new(true)),
            handle: Mutex::new(None),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn stats_handle(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().unwrap().is_some()
    }

    /// Start the thread if it isn't already running (idempotent
    /// no-op otherwise). `pass` runs once per sleep interval until
    /// `stop()` is called; it should itself enter/exit an epoch
    /// critical section for anything it dereferences or retires.
    pub fn start<F>(&self, sleep: Duration, mut pass: F)
    where
        F: FnMut(&Stats) + Send + 'static,
    {
        let mut guard = self.handle.lock().unwrap();
        if guard.is_some() {
            return;
        }

        self.finished.store(false, SeqCst);
        let finished = self.finished.clone();
        let stats = self.stats.clone();

        let handle = std::thread::Builder::new()
            .name("synchrobench-maintenance".into())
            .spawn(move || {
                debug!("maintenance thread started");
                while !finished.load(SeqCst) {
                    stats.loops.fetch_add(1, Relaxed);
                    pass(&stats);
                    trace!("maintenance pass complete");
                    std::thread::sleep(sleep);
                }
                debug!("maintenance thread stopping");
            })
            .expect("failed to spawn maintenance thread");

        *guard = Some(handle);
    }

    /// Stop the thread if running and join it (idempotent no-op
    /// otherwise).
    pub fn stop(&self) {
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            self.finished.store(true, SeqCst);
            let _ = handle.join();
        }
    }
}

impl Default for Background {
    fn default() -> Background {
        Background::new()
    }
}

impl Drop for Background {
    fn drop(&mut self) {
        // Stop strictly before the engine holding this is dropped,
        // per spec.md §4.6's "stops strictly before the engine is
        // destroyed" — enforced here so every maintained engine's
        // Drop impl gets it for free.
        self.stop();
    }
}

/// Trait implemented by engines that run a background maintenance
/// thread (`spec.md` §6.2).
pub trait BackgroundMaintained {
    fn bg_start(&self, sleep: Duration);
    fn bg_stop(&self);
    fn bg_stats(&self) -> StatsSnapshot;
    fn bg_running(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn start_stop_is_idempotent_and_counts_loops() {
        let bg = Background::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks_cl = ticks.clone();
        bg.start(Duration::from_millis(5), move |_stats| {
            ticks_cl.fetch_add(1, Relaxed);
        });
        bg.start(Duration::from_millis(5), move |_stats| {
            panic!("second start must be a no-op");
        });
        std::thread::sleep(Duration::from_millis(50));
        bg.stop();
        bg.stop();
        assert!(ticks.load(Relaxed) > 0);
        assert!(bg.stats().loops > 0);
        assert!(!bg.is_running());
    }
}
