//! Optimistic lock-based skip list (`spec.md` §4.4.1), after Herlihy
//! and Shavit's design: `contains` is lock-free, `insert`/`remove`
//! search unsynchronized, then lock every predecessor the new or
//! removed node touches and validate before committing.
//!
//! The lock granularity is selectable (`spec.md` §9): [`LockGranularity::Coarse`]
//! collapses every node onto one mutex, [`LockGranularity::PerNode`]
//! gives every node its own, and [`LockGranularity::Striped`] sits
//! between the two with a fixed-size table of mutexes assigned by
//! hashing a node's key. All three share one code path — a node's
//! `lock` field is simply a clone of whichever `Arc<Mutex<()>>` the
//! chosen granularity hands out, and predecessor locks are deduped by
//! `Arc` identity before locking.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::mem::epoch::{self, Atomic, Guard, Owned, Shared};
use crate::rng;
use crate::set::skiplist::MAX_LEVELS;
use crate::set::{Key, LockGranularity, OrderedSet, SetParams, Value, KEY_MAX, KEY_MIN};

const STRIPES: usize = 64;

struct Node {
    key: Key,
    value: Value,
    next: Vec<Atomic<Node>>,
    marked: AtomicBool,
    fully_linked: AtomicBool,
    lock: Arc<Mutex<()>>,
}

impl Node {
    fn sentinel(key: Key, height: usize, lock: Arc<Mutex<()>>) -> Node {
        Node {
            key,
            value: 0,
            next: (0..height).map(|_| Atomic::null()).collect(),
            marked: AtomicBool::new(false),
            fully_linked: AtomicBool::new(true),
            lock,
        }
    }

    fn height(&self) -> usize {
        self.next.len()
    }
}

pub struct LockBasedSkipList {
    head: Atomic<Node>,
    len: AtomicUsize,
    granularity: LockGranularity,
    stripes: Vec<Arc<Mutex<()>>>,
    coarse: Arc<Mutex<()>>,
}

impl LockBasedSkipList {
    fn lock_for(&self, key: Key) -> Arc<Mutex<()>> {
        match self.granularity {
            LockGranularity::Coarse => self.coarse.clone(),
            LockGranularity::PerNode => Arc::new(Mutex::new(())),
            LockGranularity::Striped => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                self.stripes[(hasher.finish() as usize) % self.stripes.len()].clone()
            }
        }
    }

    fn find<'g>(
        &self,
        key: Key,
        guard: &'g Guard,
        preds: &mut [Option<Shared<'g, Node>>],
        succs: &mut [Option<Shared<'g, Node>>],
    ) -> i32 {
        let mut lfound: i32 = -1;
        let mut pred = self.head.load(Relaxed, guard).expect("head never null");
        for level in (0..MAX_LEVELS).rev() {
            let mut curr = pred.next[level].load(Acquire, guard).expect("tail never null");
            while curr.key < key {
                pred = curr;
                curr = pred.next[level].load(Acquire, guard).expect("tail never null");
            }
            if lfound == -1 && curr.key == key {
                lfound = level as i32;
            }
            preds[level] = Some(pred);
            succs[level] = Some(curr);
        }
        lfound
    }

    fn dedup_locks(preds: &[Option<Shared<Node>>], top_level: usize) -> Vec<Arc<Mutex<()>>> {
        let mut locks: Vec<Arc<Mutex<()>>> = Vec::with_capacity(top_level + 1);
        for level in 0..=top_level {
            let l = preds[level].expect("populated by find").lock.clone();
            if !locks.iter().any(|existing| Arc::ptr_eq(existing, &l)) {
                locks.push(l);
            }
        }
        locks
    }
}

fn lock_all(locks: &[Arc<Mutex<()>>]) -> Vec<MutexGuard<'_, ()>> {
    locks.iter().map(|l| l.lock().unwrap()).collect()
}

impl OrderedSet for LockBasedSkipList {
    fn new(params: SetParams) -> LockBasedSkipList {
        let coarse = Arc::new(Mutex::new(()));
        let stripes: Vec<Arc<Mutex<()>>> = (0..STRIPES).map(|_| Arc::new(Mutex::new(()))).collect();

        let head = Node::sentinel(KEY_MIN, MAX_LEVELS, coarse.clone());
        let tail = Owned::new(Node::sentinel(KEY_MAX, MAX_LEVELS, coarse.clone()));
        let guard = epoch::pin();
        let tail_ref = head.next[0].store_and_ref(tail, Relaxed, &guard);
        for level in 1..MAX_LEVELS {
            head.next[level].store_shared(Some(tail_ref), Relaxed);
        }

        let list = LockBasedSkipList {
            head: Atomic::null(),
            len: AtomicUsize::new(0),
            granularity: params.skiplist_granularity,
            stripes,
            coarse,
        };
        list.head.store(Some(Owned::new(head)), Release);
        list
    }

    fn contains(&self, key: Key) -> bool {
        let guard = epoch::pin();
        let mut pred = self.head.load(Relaxed, &guard).expect("head never null");
        for level in (0..MAX_LEVELS).rev() {
            let mut curr = pred.next[level].load(Acquire, &guard).expect("tail never null");
            while curr.key < key {
                pred = curr;
                curr = pred.next[level].load(Acquire, &guard).expect("tail never null");
            }
            if curr.key == key {
                return curr.fully_linked.load(Acquire) && !curr.marked.load(Acquire);
            }
        }
        false
    }

    fn insert_with(&self, key: Key, value: Value) -> bool {
        loop {
            let guard = epoch::pin();
            let mut preds: Vec<Option<Shared<Node>>> = vec![None; MAX_LEVELS];
            let mut succs: Vec<Option<Shared<Node>>> = vec![None; MAX_LEVELS];
            let lfound = self.find(key, &guard, &mut preds, &mut succs);

            if lfound != -1 {
                let found = succs[lfound as usize].expect("set by find");
                if !found.marked.load(Acquire) {
                    while !found.fully_linked.load(Acquire) {
                        std::hint::spin_loop();
                    }
                    return false;
                }
                continue;
            }

            let height = rng::random_level(MAX_LEVELS);
            let top_level = height - 1;
            let locks = Self::dedup_locks(&preds, top_level);
            let guards = lock_all(&locks);

            let valid = (0..=top_level).all(|level| {
                let pred = preds[level].expect("set by find");
                let succ = succs[level].expect("set by find");
                !pred.marked.load(Relaxed) && pred.next[level].load(Relaxed, &guard) == Some(succ)
            });
            if !valid {
                drop(guards);
                continue;
            }

            let node = Owned::new(Node {
                key,
                value,
                next: (0..height).map(|_| Atomic::null()).collect(),
                marked: AtomicBool::new(false),
                fully_linked: AtomicBool::new(false),
                lock: self.lock_for(key),
            });
            for level in 0..height {
                node.next[level].store_shared(succs[level], Relaxed);
            }

            let node_shared = preds[0]
                .expect("set by find")
                .next[0]
                .store_and_ref(node, Release, &guard);
            for level in 1..height {
                preds[level].expect("set by find").next[level]
                    .store_shared(Some(node_shared), Release);
            }
            node_shared.fully_linked.store(true, Release);
            drop(guards);
            self.len.fetch_add(1, Relaxed);
            return true;
        }
    }

    fn remove(&self, key: Key) -> bool {
        let mut marked_node: Option<Shared<Node>> = None;
        let guard = epoch::pin();
        loop {
            let mut preds: Vec<Option<Shared<Node>>> = vec![None; MAX_LEVELS];
            let mut succs: Vec<Option<Shared<Node>>> = vec![None; MAX_LEVELS];
            let lfound = self.find(key, &guard, &mut preds, &mut succs);

            let node = match marked_node {
                Some(n) => n,
                None => {
                    if lfound == -1 {
                        return false;
                    }
                    let found = succs[lfound as usize].expect("set by find");
                    if !found.fully_linked.load(Acquire) {
                        continue;
                    }
                    let claim = found.lock.lock().unwrap();
                    if found.marked.load(Acquire) {
                        drop(claim);
                        return false;
                    }
                    found.marked.store(true, Release);
                    drop(claim);
                    marked_node = Some(found);
                    found
                }
            };

            let top_level = node.height() - 1;
            let locks = Self::dedup_locks(&preds, top_level);
            let guards = lock_all(&locks);

            let valid = (0..=top_level).all(|level| {
                let pred = preds[level].expect("set by find");
                !pred.marked.load(Relaxed) && pred.next[level].load(Relaxed, &guard) == Some(node)
            });
            if !valid {
                drop(guards);
                continue;
            }

            for level in (0..=top_level).rev() {
                let pred = preds[level].expect("set by find");
                let succ = node.next[level].load(Relaxed, &guard);
                pred.next[level].store_shared(succ, Release);
            }
            drop(guards);
            unsafe { guard.unlinked(node) };
            self.len.fetch_sub(1, Relaxed);
            return true;
        }
    }

    fn size(&self) -> usize {
        self.len.load(Relaxed)
    }
}

unsafe impl Send for LockBasedSkipList {}
unsafe impl Sync for LockBasedSkipList {}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_granularity(g: LockGranularity) -> LockBasedSkipList {
        LockBasedSkipList::new(SetParams {
            skiplist_granularity: g,
            ..SetParams::default()
        })
    }

    #[test]
    fn coarse_insert_contains_remove() {
        let list = with_granularity(LockGranularity::Coarse);
        assert!(list.insert(5));
        assert!(!list.insert(5));
        assert!(list.contains(5));
        assert!(list.remove(5));
        assert!(!list.contains(5));
    }

    #[test]
    fn per_node_insert_contains_remove() {
        let list = with_granularity(LockGranularity::PerNode);
        for k in 0..100 {
            assert!(list.insert(k));
        }
        assert_eq!(list.size(), 100);
        for k in 0..100 {
            assert!(list.contains(k));
            assert!(list.remove(k));
        }
        assert_eq!(list.size(), 0);
    }

    #[test]
    fn striped_concurrent_inserts() {
        use std::sync::Arc as StdArc;
        use std::thread;

        let list = StdArc::new(with_granularity(LockGranularity::Striped));
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
    }
}
