//! Optimistic "lazy" list (`spec.md` §4.3.2), after Heller, Herlihy,
//! Luchangco, Moir, Scherer and Shavit.
//!
//! `contains` never takes a lock: it walks the unsynchronized next
//! chain and trusts a node's `marked` flag. `insert` and `remove`
//! walk unlocked too, then lock just the predecessor and current node
//! and re-validate before committing — if either node was concurrently
//! marked, or the predecessor no longer points at the current node,
//! the whole search restarts.

use std::sync::atomic::Ordering::{Acquire, Relaxed, Release, SeqCst};
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::Mutex;

use crate::mem::epoch::{self, Atomic, Guard, Owned, Shared};
use crate::set::{Key, OrderedSet, SetParams, Value, KEY_MAX, KEY_MIN};

struct Node {
    key: Key,
    value: Value,
    next: Atomic<Node>,
    marked: AtomicBool,
    lock: Mutex<()>,
}

impl Node {
    fn new(key: Key, value: Value) -> Node {
        Node {
            key,
            value,
            next: Atomic::null(),
            marked: AtomicBool::new(false),
            lock: Mutex::new(()),
        }
    }
}

pub struct LazyList {
    head: Atomic<Node>,
    len: AtomicUsize,
}

impl LazyList {
    /// Unsynchronized search for the tightest `(pred, curr)` window
    /// bracketing `key`: `pred.key < key <= curr.key`.
    fn find<'g>(&self, key: Key, guard: &'g Guard) -> (Shared<'g, Node>, Shared<'g, Node>) {
        let mut pred = self.head.load(Relaxed, guard).expect("head never null");
        let mut curr = pred.next.load(Acquire, guard).expect("tail never null");
        while curr.key < key {
            pred = curr;
            curr = curr.next.load(Acquire, guard).expect("tail never null");
        }
        (pred, curr)
    }

    fn validate(pred: Shared<Node>, curr: Shared<Node>, guard: &Guard) -> bool {
        !pred.marked.load(Relaxed)
            && !curr.marked.load(Relaxed)
            && pred.next.load(Relaxed, guard) == Some(curr)
    }
}

impl OrderedSet for LazyList {
    fn new(_params: SetParams) -> LazyList {
        let head = Node::new(KEY_MIN, 0);
        let guard = epoch::pin();
        head.next
            .store_and_ref(Owned::new(Node::new(KEY_MAX, 0)), Relaxed, &guard);
        let list = LazyList {
            head: Atomic::null(),
            len: AtomicUsize::new(0),
        };
        list.head.store(Some(Owned::new(head)), SeqCst);
        list
    }

    fn contains(&self, key: Key) -> bool {
        let guard = epoch::pin();
        let mut curr = self.head.load(Relaxed, &guard).expect("head never null");
        while curr.key < key {
            curr = curr.next.load(Acquire, &guard).expect("tail never null");
        }
        curr.key == key && !curr.marked.load(Relaxed)
    }

    fn insert_with(&self, key: Key, value: Value) -> bool {
        let guard = epoch::pin();
        loop {
            let (pred, curr) = self.find(key, &guard);
            let pred_lock = pred.lock.lock().unwrap();
            let curr_lock = curr.lock.lock().unwrap();
            if !Self::validate(pred, curr, &guard) {
                continue;
            }
            if curr.key == key {
                return false;
            }
            let node = Owned::new(Node::new(key, value));
            node.next.store_shared(Some(curr), Relaxed);
            pred.next.store_and_ref(node, Release, &guard);
            drop(curr_lock);
            drop(pred_lock);
            self.len.fetch_add(1, Relaxed);
            return true;
        }
    }

    fn remove(&self, key: Key) -> bool {
        let guard = epoch::pin();
        loop {
            let (pred, curr) = self.find(key, &guard);
            let pred_lock = pred.lock.lock().unwrap();
            let curr_lock = curr.lock.lock().unwrap();
            if !Self::validate(pred, curr, &guard) {
                continue;
            }
            if curr.key != key {
                return false;
            }
            curr.marked.store(true, Release);
            let next = curr.next.load(Relaxed, &guard).expect("tail never null");
            pred.next.store_shared(Some(next), Release);
            drop(curr_lock);
            drop(pred_lock);
            unsafe { guard.unlinked(curr) };
            self.len.fetch_sub(1, Relaxed);
            return true;
        }
    }

    fn size(&self) -> usize {
        self.len.load(Relaxed)
    }
}

unsafe impl Send for LazyList {}
unsafe impl Sync for LazyList {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_contains_remove() {
        let list = LazyList::new(SetParams::default());
        assert!(list.insert(42));
        assert!(!list.insert(42));
        assert!(list.contains(42));
        assert!(list.remove(42));
        assert!(!list.contains(42));
        assert!(!list.remove(42));
    }

    #[test]
    fn contains_ignores_locks() {
        // contains() must never block behind insert/remove's node
        // locks — it only reads the marked flag.
        let list = LazyList::new(SetParams::default());
        for k in 0..50 {
            list.insert(k);
        }
        assert_eq!(list.size(), 50);
        for k in 0..50 {
            assert!(list.contains(k));
        }
        assert!(!list.contains(50));
    }

    #[test]
    fn concurrent_insert_remove_converges() {
        use std::sync::Arc;
        use std::thread;

        let list = Arc::new(LazyList::new(SetParams::default()));
        for k in 0..100 {
            list.insert(k);
        }
        let mut handles = Vec::new();
        for t in 0..4 {
            let list = list.clone();
            handles.push(thread::spawn(move || {
                for k in (t..100).step_by(4) {
                    list.remove(k);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(list.size(), 0);
        for k in 0..100 {
            assert!(!list.contains(k));
        }
    }
}
