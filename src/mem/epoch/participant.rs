//! A single thread's epoch-participation record: its locally observed
//! epoch, critical-section nesting depth, and thread-local garbage.
//! This is where the actual epoch-advance and collection logic lives.

use std::cell::UnsafeCell;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release, SeqCst};
use std::sync::atomic::{self, AtomicBool, AtomicUsize};

use crate::mem::epoch::options::Options;
use crate::mem::epoch::participants::ParticipantNode;
use crate::mem::epoch::{garbage, global, Atomic, Guard};

const GC_THRESH: usize = 32;

pub struct Participant {
    /// This participant's last-observed epoch.
    epoch: AtomicUsize,
    /// Nesting depth of `critical_enter`/`critical_exit`, enabling
    /// reentrant pins.
    in_critical: AtomicUsize,
    /// Thread-local garbage bags.
    garbage: UnsafeCell<garbage::Local>,
    /// Per-thread GC policy knobs.
    pub options: UnsafeCell<Options>,
    /// Whether this thread is still participating. Flipped to `false`
    /// on thread exit so the intrusive participant list can unlink
    /// and reclaim the record.
    pub active: AtomicBool,
    /// The intrusive participant-list `next` pointer.
    pub next: Atomic<ParticipantNode>,
}

// `garbage` and `options` are only ever touched by the owning thread
// (outside of list traversal, which never dereferences them).
unsafe impl Sync for Participant {}

impl Participant {
    pub fn new() -> Participant {
        Participant {
            epoch: AtomicUsize::new(0),
            in_critical: AtomicUsize::new(0),
            active: AtomicBool::new(true),
            garbage: UnsafeCell::new(garbage::Local::new()),
            options: UnsafeCell::new(Options::default()),
            next: Atomic::null(),
        }
    }

    fn opts(&self) -> Options {
        unsafe { *self.options.get() }
    }

    /// Enter a (possibly nested) critical section.
    pub fn enter(&self) {
        let depth = self.in_critical.load(Relaxed) + 1;
        self.in_critical.store(depth, Relaxed);
        if depth > 1 {
            return;
        }

        atomic::fence(SeqCst);

        let global_epoch = global::get().epoch.load(Relaxed);
        if global_epoch != self.epoch.load(Relaxed) {
            self.epoch.store(global_epoch, Relaxed);
            unsafe { (*self.garbage.get()).collect(self.opts().items_per_gc) };
        }
    }

    /// Exit the current (nested) critical section.
    pub fn exit(&self) {
        let depth = self.in_critical.load(Relaxed) - 1;
        self.in_critical
            .store(depth, if depth > 0 { Relaxed } else { Release });
    }

    pub fn in_critical_section(&self) -> bool {
        self.in_critical.load(Relaxed) > 0
    }

    pub fn observed_epoch(&self) -> usize {
        self.epoch.load(Relaxed)
    }

    /// Defer reclamation of `data` until it's safe: every participant
    /// currently in a critical section has moved past the epoch in
    /// which this call happens.
    pub unsafe fn retire<T>(&self, data: *mut T) {
        (*self.garbage.get()).insert(data);
    }

    /// As [`retire`], but for an arbitrary closure rather than a typed
    /// pointer — used for reclamation hooks.
    pub unsafe fn defer<F: FnOnce() + 'static>(&self, f: F) {
        (*self.garbage.get()).insert_deferred(f);
    }

    /// Attempt to advance the global epoch, then run a local and
    /// global collection pass. Returns `true` if the epoch advanced.
    ///
    /// At most one thread succeeds in advancing the epoch at a time:
    /// the CAS on the global counter mutually excludes concurrent
    /// callers.
    pub fn try_collect(&self, guard: &Guard) -> bool {
        let cur_epoch = global::get().epoch.load(SeqCst);

        for p in global::get().participants.iter(guard) {
            if p.in_critical_section() && p.observed_epoch() != cur_epoch {
                return false;
            }
        }

        let new_epoch = cur_epoch.wrapping_add(1) % 3;
        atomic::fence(Acquire);
        if global::get()
            .epoch
            .compare_exchange(cur_epoch, new_epoch, SeqCst, SeqCst)
            .is_err()
        {
            return false;
        }

        self.epoch.store(new_epoch, Relaxed);

        let budget = self.opts().items_per_gc;
        unsafe {
            (*self.garbage.get()).collect(budget);
            global::get().garbage[new_epoch.wrapping_add(1) % 3].collect();
        }

        global::get().set_garbage_flag();
        true
    }

    pub fn needs_gc(&self) -> bool {
        self.garbage_size() > GC_THRESH
            || global::get().do_global.load(Relaxed)
    }

    pub fn gc_if_needed(&self, guard: &Guard) -> bool {
        if self.needs_gc() {
            self.try_collect(guard)
        } else {
            false
        }
    }

    /// Move this thread's garbage into the global chain (used when a
    /// thread wants to avoid running a collection itself, e.g. inside
    /// `pin_nogc`, or on thread exit).
    pub fn migrate_garbage(&self) {
        let cur_epoch = self.epoch.load(Relaxed);
        let local =
            unsafe { std::mem::replace(&mut *self.garbage.get(), garbage::Local::new()) };

        let state = global::get();
        state.garbage[cur_epoch.wrapping_add(2) % 3].insert(local.old);
        state.garbage[cur_epoch % 3].insert(local.cur);
        state.garbage[state.epoch.load(Relaxed) % 3].insert(local.new);
        state.set_garbage_flag();
    }

    pub fn garbage_size(&self) -> usize {
        unsafe { (*self.garbage.get()).size() }
    }
}
