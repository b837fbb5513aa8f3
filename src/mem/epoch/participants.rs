//! The global participant list: an intrusive, singly-linked list of
//! `Participant` records, lazily unlinked on traversal once a
//! participant is marked inactive (i.e. its thread has exited).

use std::ops::{Deref, DerefMut};
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release, SeqCst};
use std::sync::atomic::{fence, AtomicBool};

use crate::mem::epoch::participant::Participant;
use crate::mem::epoch::{Atomic, Guard, Owned};
use crate::mem::CachePadded;

pub struct Participants {
    head: Atomic<ParticipantNode>,
    /// Single-writer lock for the lazy-unlink cleanup below, so that
    /// at most one iterator is splicing out dead nodes at a time.
    writable: AtomicBool,
}

pub struct ParticipantNode(CachePadded<Participant>);

impl ParticipantNode {
    fn new() -> ParticipantNode {
        ParticipantNode(CachePadded::new(Participant::new()))
    }
}

impl Deref for ParticipantNode {
    type Target = Participant;
    fn deref(&self) -> &Participant {
        &self.0
    }
}

impl DerefMut for ParticipantNode {
    fn deref_mut(&mut self) -> &mut Participant {
        &mut self.0
    }
}

impl Participants {
    pub fn new() -> Participants {
        Participants {
            head: Atomic::null(),
            writable: AtomicBool::new(false),
        }
    }

    /// Enroll a new thread, publishing a fresh `Participant` record at
    /// the head of the list. Returns a raw pointer valid for the
    /// lifetime of the process (the record is only ever reclaimed
    /// after `active` is observed `false`, which happens no earlier
    /// than thread exit).
    pub fn enroll(&self) -> *const Participant {
        let mut node = Owned::new(ParticipantNode::new());

        // Enrollment happens before this thread has a `Participant` of
        // its own to pin with, so there is no epoch-scoped guard
        // available yet. This is sound because a freshly enrolled node
        // can't be observed as `!active` (hence never unlinked) until
        // some other thread later runs the cleanup traversal — by
        // which point this call has already returned its raw pointer.
        let bootstrap_guard = unsafe { Guard::unpinned() };
        loop {
            let head = self.head.load(Relaxed, &bootstrap_guard);
            node.next.store_shared(head, Relaxed);
            match self.head.cas_and_ref(head, node, Release, &bootstrap_guard) {
                Ok(shared) => {
                    let node: &ParticipantNode = &*shared;
                    return Deref::deref(node) as *const Participant;
                }
                Err(owned) => node = owned,
            }
        }
    }

    pub fn iter<'a>(&'a self, g: &'a Guard) -> Iter<'a> {
        Iter {
            guard: g,
            next: &self.head,
            is_first: true,
            writable: &self.writable,
            can_write: false,
        }
    }
}

pub struct Iter<'a> {
    guard: &'a Guard,
    next: &'a Atomic<ParticipantNode>,
    /// Only the very first read needs `Acquire`; subsequent reads ride
    /// the release sequence established by insertions at the head.
    is_first: bool,
    writable: &'a AtomicBool,
    can_write: bool,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Participant;

    fn next(&mut self) -> Option<&'a Participant> {
        let was_first = self.is_first;
        let mut cur = if self.is_first {
            self.is_first = false;
            self.next.load(Acquire, self.guard)
        } else {
            self.next.load(Relaxed, self.guard)
        };

        while let Some(shared) = cur {
            let n: &'a ParticipantNode = shared.get();
            if !n.active.load(Relaxed) {
                fence(Acquire);
                cur = n.next.load(Relaxed, self.guard);

                // Never unlink the head out from under a concurrent
                // appender; only interior dead nodes are cleaned up.
                if !was_first {
                    if !self.can_write {
                        if self.writable.load(Relaxed) {
                            continue;
                        }
                        self.can_write = self
                            .writable
                            .compare_exchange(false, true, Relaxed, Relaxed)
                            .is_ok();
                        if !self.can_write {
                            continue;
                        }
                    }
                    // We hold the write lock and are the sole deleter
                    // of this edge, so a plain store suffices.
                    self.next.store_shared(cur, SeqCst);
                    unsafe { self.guard.unlinked(shared) };
                }
            } else {
                self.next = &n.next;
                return Some(n);
            }
        }

        if self.can_write {
            self.writable.store(false, Release);
        }
        None
    }
}
