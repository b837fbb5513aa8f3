//! Process-wide epoch state: the global epoch counter, the three
//! epoch-indexed global garbage bags, and the participant list. A
//! single `EpochState` is shared by every ordered-set engine in the
//! process — the GC runtime is one object, not one per data
//! structure, per `spec.md` §9's "global per-process state" note.

use std::sync::atomic::Ordering::Relaxed;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::OnceLock;

use crate::mem::epoch::garbage;
use crate::mem::epoch::participants::Participants;
use crate::mem::CachePadded;

pub struct EpochState {
    /// Current global epoch, one of `{0, 1, 2}` (mod 3).
    pub epoch: CachePadded<AtomicUsize>,
    /// Set when any participant has outstanding global garbage,
    /// cleared once a collection empties all three bags. Lets
    /// `pin_nogc` skip a migration attempt when there's nothing to do.
    pub do_global: CachePadded<AtomicBool>,
    /// Global garbage, one bag per epoch slot mod 3.
    pub garbage: [CachePadded<garbage::ConcBag>; 3],
    pub participants: Participants,
}

unsafe impl Send for EpochState {}
unsafe impl Sync for EpochState {}

impl EpochState {
    fn new() -> EpochState {
        EpochState {
            epoch: CachePadded::zeroed(),
            do_global: CachePadded::zeroed(),
            garbage: [
                CachePadded::zeroed(),
                CachePadded::zeroed(),
                CachePadded::zeroed(),
            ],
            participants: Participants::new(),
        }
    }

    pub fn has_garbage(&self) -> bool {
        self.garbage.iter().any(|bag| bag.has_garbage())
    }

    /// Updates the global-garbage flag.
    ///
    /// This check-then-set is racy by construction: a thread can miss
    /// a just-inserted item, or flip the flag off just after another
    /// thread added garbage. Both outcomes only delay or trigger one
    /// extra collection attempt elsewhere, never a correctness issue.
    pub fn set_garbage_flag(&self) {
        let has_garbage = self.has_garbage();
        let flag = self.do_global.load(Relaxed);
        if has_garbage != flag {
            self.do_global.store(has_garbage, Relaxed);
        }
    }
}

static GLOBAL: OnceLock<EpochState> = OnceLock::new();

/// Access the process-wide epoch state, initializing it on first call.
pub fn get() -> &'static EpochState {
    GLOBAL.get_or_init(EpochState::new)
}
