//! Hand-over-hand lock-coupling list (`spec.md` §4.3.1).
//!
//! Every traversal locks a node before following its successor
//! pointer, and never holds more than two node locks (predecessor and
//! current) at once. Readers take locks too — there is no lock-free
//! fast path — which makes this the simplest and most contended of the
//! four list engines, and the baseline the other three are measured
//! against.

use std::sync::atomic::Ordering::{Relaxed, SeqCst};
use std::sync::atomic::AtomicUsize;
use std::sync::Mutex;

use crate::mem::epoch::{self, Atomic, Owned};
use crate::set::{Key, OrderedSet, SetParams, Value, KEY_MAX, KEY_MIN};

struct Node {
    key: Key,
    value: Value,
    next: Atomic<Node>,
    lock: Mutex<()>,
}

impl Node {
    fn new(key: Key, value: Value) -> Node {
        Node {
            key,
            value,
            next: Atomic::null(),
            lock: Mutex::new(()),
        }
    }
}

/// A sorted list guarded end-to-end by per-node mutexes.
pub struct CouplingList {
    head: Atomic<Node>,
    len: AtomicUsize,
}

impl OrderedSet for CouplingList {
    fn new(_params: SetParams) -> CouplingList {
        let head = Node::new(KEY_MIN, 0);
        let guard = epoch::pin();
        head.next
            .store_and_ref(Owned::new(Node::new(KEY_MAX, 0)), Relaxed, &guard);

        let list = CouplingList {
            head: Atomic::null(),
            len: AtomicUsize::new(0),
        };
        list.head.store(Some(Owned::new(head)), SeqCst);
        list
    }

    fn contains(&self, key: Key) -> bool {
        let guard = epoch::pin();
        let pred = self.head.load(Relaxed, &guard).expect("head never null");
        let mut pred_lock = pred.get().lock.lock().unwrap();
        let mut curr = pred.next.load(Relaxed, &guard).expect("tail never null");
        loop {
            let curr_lock = curr.get().lock.lock().unwrap();
            if curr.key >= key {
                return curr.key == key;
            }
            let next = curr.next.load(Relaxed, &guard).expect("tail never null");
            drop(pred_lock);
            pred_lock = curr_lock;
            curr = next;
        }
    }

    fn insert_with(&self, key: Key, value: Value) -> bool {
        let guard = epoch::pin();
        let mut pred = self.head.load(Relaxed, &guard).expect("head never null");
        let mut pred_lock = pred.get().lock.lock().unwrap();
        let mut curr = pred.next.load(Relaxed, &guard).expect("tail never null");
        loop {
            let curr_lock = curr.get().lock.lock().unwrap();
            if curr.key >= key {
                if curr.key == key {
                    return false;
                }
                let node = Owned::new(Node::new(key, value));
                node.next.store_shared(Some(curr), Relaxed);
                pred.next.store_and_ref(node, SeqCst, &guard);
                self.len.fetch_add(1, Relaxed);
                return true;
            }
            let next = curr.next.load(Relaxed, &guard).expect("tail never null");
            drop(pred_lock);
            pred = curr;
            pred_lock = curr_lock;
            curr = next;
        }
    }

    fn remove(&self, key: Key) -> bool {
        let guard = epoch::pin();
        let mut pred = self.head.load(Relaxed, &guard).expect("head never null");
        let mut pred_lock = pred.get().lock.lock().unwrap();
        let mut curr = pred.next.load(Relaxed, &guard).expect("tail never null");
        loop {
            let curr_lock = curr.get().lock.lock().unwrap();
            if curr.key >= key {
                if curr.key != key {
                    return false;
                }
                let next = curr.next.load(Relaxed, &guard).expect("tail never null");
                pred.next.store_shared(Some(next), SeqCst);
                drop(curr_lock);
                drop(pred_lock);
                unsafe { guard.unlinked(curr) };
                self.len.fetch_sub(1, Relaxed);
                return true;
            }
            let next = curr.next.load(Relaxed, &guard).expect("tail never null");
            drop(pred_lock);
            pred = curr;
            pred_lock = curr_lock;
            curr = next;
        }
    }

    fn size(&self) -> usize {
        self.len.load(Relaxed)
    }
}

unsafe impl Send for CouplingList {}
unsafe impl Sync for CouplingList {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_contains_remove() {
        let list = CouplingList::new(SetParams::default());
        assert!(list.insert(5));
        assert!(!list.insert(5));
        assert!(list.contains(5));
        assert!(!list.contains(6));
        assert!(list.remove(5));
        assert!(!list.remove(5));
        assert!(!list.contains(5));
    }

    #[test]
    fn ordered_membership() {
        let list = CouplingList::new(SetParams::default());
        for k in [10, 3, 7, 1, 9] {
            assert!(list.insert(k));
        }
        assert_eq!(list.size(), 5);
        for k in [10, 3, 7, 1, 9] {
            assert!(list.contains(k));
        }
        assert!(!list.contains(4));
    }

    #[test]
    fn concurrent_inserts_all_land() {
        use std::sync::Arc;
        use std::thread;

        let list = Arc::new(CouplingList::new(SetParams::default()));
        let mut handles = Vec::new();
        for t in 0..4 {
            let list = list.clone();
            handles.push(thread::spawn(move || {
                for i in 0..200 {
                    list.insert(t * 1000 + i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(list.size(), 800);
        for t in 0..4 {
            for i in 0..200 {
                assert!(list.contains(t * 1000 + i));
            }
        }
    }
}
