//! Thread-local plumbing that lazily enrolls the current thread as an
//! epoch participant on first use, and hands out a reference to its
//! `Participant` record for the lifetime of the access.

use std::cell::Cell;
use std::sync::atomic::Ordering::Release;

use crate::mem::epoch::global;
use crate::mem::epoch::participant::Participant;

thread_local! {
    static PARTICIPANT: Cell<*const Participant> = Cell::new(std::ptr::null());
}

struct ExitGuard;

impl Drop for ExitGuard {
    fn drop(&mut self) {
        PARTICIPANT.with(|cell| {
            let ptr = cell.get();
            if !ptr.is_null() {
                unsafe { (*ptr).active.store(false, Release) };
            }
        });
    }
}

thread_local! {
    static EXIT_GUARD: ExitGuard = ExitGuard;
}

/// Run `f` with a reference to the calling thread's `Participant`
/// record, enrolling the thread in the global participant list on
/// first call.
#[inline]
pub fn with_participant<R, F: FnOnce(&Participant) -> R>(f: F) -> R {
    let ptr = PARTICIPANT.with(|cell| {
        let mut ptr = cell.get();
        if ptr.is_null() {
            ptr = global::get().participants.enroll();
            cell.set(ptr);
            // Touch the guard so the thread is marked inactive on exit,
            // even for threads that never call `with_participant` again.
            EXIT_GUARD.with(|_| {});
        }
        ptr
    });
    f(unsafe { &*ptr })
}
