//! Fully lock-free list (`spec.md` §4.3.4), after Fomitchev & Ruppert
//! and Harris.
//!
//! Deletion is two-phase: a node is first marked logically deleted,
//! then physically unlinked by a compare-and-swap against its
//! predecessor's `next` pointer. Any thread that notices a marked node
//! while searching helps finish the physical unlink rather than
//! stepping over it — the defining trick that makes this list
//! lock-free rather than merely non-blocking for one writer at a time.
//!
//! `fomitchev.c` additionally threads a `backlink` through each
//! deleted node so a stalled helper can hop directly to a live
//! predecessor instead of restarting from the head; this port keeps
//! the `backlink` field (useful for diagnosing a stuck helper) but,
//! for a simpler and still-correct recovery path, always restarts a
//! failed help-unlink from the head rather than walking backlinks.
//!
//! A node is also `flagged` for the brief window where it is either
//! being used as the predecessor of a link-in, or is itself being
//! marked and unlinked: `insert_with` flags the predecessor before
//! checking it isn't already marked and performing its CAS, and
//! `remove` flags its target before marking and physically unlinking
//! it. Flagging is a compare-and-swap, so it competes fairly rather
//! than blocking, but only one of "link a new successor in" or
//! "mark and unlink this node" can be mid-flight on a given node at
//! once — without it, a node inserted under a predecessor that is
//! concurrently being removed can end up attached to a node that is no
//! longer reachable from the head.

use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicBool, AtomicUsize};

use crate::mem::epoch::{self, Atomic, Guard, Owned, Shared};
use crate::set::{Key, OrderedSet, SetParams, Value, KEY_MAX, KEY_MIN};

struct Node {
    key: Key,
    value: Value,
    next: Atomic<Node>,
    marked: AtomicBool,
    flagged: AtomicBool,
    backlink: Atomic<Node>,
}

impl Node {
    fn new(key: Key, value: Value) -> Node {
        Node {
            key,
            value,
            next: Atomic::null(),
            marked: AtomicBool::new(false),
            flagged: AtomicBool::new(false),
            backlink: Atomic::null(),
        }
    }
}

/// Claim `node`'s flag. Fails if another insert or removal already
/// holds it.
fn try_flag(node: &Node) -> bool {
    node.flagged
        .compare_exchange(false, true, Acquire, Relaxed)
        .is_ok()
}

fn unflag(node: &Node) {
    node.flagged.store(false, Release);
}

pub struct LockFreeList {
    head: Atomic<Node>,
    len: AtomicUsize,
}

impl LockFreeList {
    /// Find the tightest bracketing window for `key`, helping unlink
    /// any marked node encountered along the way. Always makes
    /// progress system-wide: either this call finishes a pending
    /// unlink, or it returns a window with both nodes unmarked.
    fn search<'g>(&self, key: Key, guard: &'g Guard) -> (Shared<'g, Node>, Shared<'g, Node>) {
        'restart: loop {
            let mut pred = self.head.load(Relaxed, guard).expect("head never null");
            let mut curr = pred.next.load(Acquire, guard).expect("tail never null");
            loop {
                if curr.marked.load(Acquire) {
                    let succ = curr.next.load(Acquire, guard).expect("tail never null");
                    if pred.next.cas_shared(Some(curr), Some(succ), Release) {
                        unsafe { guard.unlinked(curr) };
                        curr = succ;
                        continue;
                    }
                    continue 'restart;
                }
                if curr.key >= key {
                    return (pred, curr);
                }
                pred = curr;
                curr = curr.next.load(Acquire, guard).expect("tail never null");
            }
        }
    }
}

impl OrderedSet for LockFreeList {
    fn new(_params: SetParams) -> LockFreeList {
        let head = Node::new(KEY_MIN, 0);
        let guard = epoch::pin();
        head.next
            .store_and_ref(Owned::new(Node::new(KEY_MAX, 0)), Relaxed, &guard);
        let list = LockFreeList {
            head: Atomic::null(),
            len: AtomicUsize::new(0),
        };
        list.head.store(Some(Owned::new(head)), Release);
        list
    }

    fn contains(&self, key: Key) -> bool {
        let guard = epoch::pin();
        let mut curr = self.head.load(Relaxed, &guard).expect("head never null");
        loop {
            if curr.marked.load(Acquire) {
                curr = curr.next.load(Acquire, &guard).expect("tail never null");
                continue;
            }
            if curr.key >= key {
                return curr.key == key;
            }
            curr = curr.next.load(Acquire, &guard).expect("tail never null");
        }
    }

    fn insert_with(&self, key: Key, value: Value) -> bool {
        let guard = epoch::pin();
        loop {
            let (pred, curr) = self.search(key, &guard);
            if curr.key == key {
                return false;
            }
            if !try_flag(&pred) {
                // A concurrent insert or removal already owns pred;
                // retry with a fresh search rather than spin on it.
                continue;
            }
            if pred.marked.load(Acquire) {
                // pred is being removed out from under us: linking a
                // new node here would make it unreachable the moment
                // the removal completes.
                unflag(&pred);
                continue;
            }
            let node = Owned::new(Node::new(key, value));
            node.next.store_shared(Some(curr), Relaxed);
            let result = pred.next.cas(Some(curr), Some(node), Release);
            unflag(&pred);
            match result {
                Ok(()) => {
                    self.len.fetch_add(1, Relaxed);
                    return true;
                }
                Err(_) => continue,
            }
        }
    }

    fn remove(&self, key: Key) -> bool {
        let guard = epoch::pin();
        loop {
            let (pred, curr) = self.search(key, &guard);
            if curr.key != key {
                return false;
            }
            if !try_flag(&curr) {
                // A concurrent insert is using curr as its predecessor
                // right now; retry once it releases the flag.
                continue;
            }
            if curr
                .marked
                .compare_exchange(false, true, Acquire, Relaxed)
                .is_err()
            {
                // Lost the race to mark it: someone else is deleting
                // this key right now, so this call reports absent.
                unflag(&curr);
                return false;
            }
            curr.backlink.store_shared(Some(pred), Relaxed);
            // curr stays flagged through the physical unlink so no
            // insert can attach under it mid-unlink and be lost.
            let succ = curr.next.load(Acquire, &guard).expect("tail never null");
            if pred.next.cas_shared(Some(curr), Some(succ), Release) {
                unsafe { guard.unlinked(curr) };
            }
            // If the physical CAS lost, a concurrent searcher will
            // finish the unlink (and retire the node) on its own pass.
            unflag(&curr);
            self.len.fetch_sub(1, Relaxed);
            return true;
        }
    }

    fn size(&self) -> usize {
        self.len.load(Relaxed)
    }
}

unsafe impl Send for LockFreeList {}
unsafe impl Sync for LockFreeList {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_contains_remove() {
        let list = LockFreeList::new(SetParams::default());
        assert!(list.insert(1));
        assert!(list.insert(2));
        assert!(!list.insert(1));
        assert!(list.contains(1));
        assert!(list.remove(1));
        assert!(!list.contains(1));
        assert!(list.contains(2));
    }

    #[test]
    fn concurrent_mixed_workload_stays_consistent() {
        use std::sync::Arc;
        use std::thread;

        let list = Arc::new(LockFreeList::new(SetParams::default()));
        for k in 0..500 {
            list.insert(k);
        }
        let mut handles = Vec::new();
        for t in 0..4 {
            let list = list.clone();
            handles.push(thread::spawn(move || {
                for k in (t..500).step_by(4) {
                    assert!(list.remove(k));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(list.size(), 0);
    }
}
