//! No-hot-spot skip list (`spec.md` §4.4.3).
//!
//! Worker threads touch only level 0, and only through two primitive
//! operations: a CAS to link a freshly allocated node in, and a CAS on
//! a `deleted` flag to log ically remove one. Nothing a worker does
//! ever mutates an index level above 0, and nothing a worker does ever
//! frees memory. A single background thread owns all of that: it
//! physically unlinks logically-deleted nodes (racing workers' inserts
//! at level 0 with the same CAS discipline everyone else uses, since
//! that level is still shared) and it alone raises nodes into higher
//! index levels and lowers deleted ones back out of them — levels ≥ 1
//! never see a second writer, so that part needs no synchronization at
//! all. This is what keeps any one node from becoming a hot spot: the
//! structural bookkeeping that the other three skip-list engines do
//! inline on every insert/remove happens off to the side here, in
//! batches, on one thread.
//!
//! The background thread and the structure it maintains share
//! ownership through an `Arc`, rather than the background closure
//! capturing a raw `&self`: `OrderedSet::new` returns `Self` by value,
//! and a raw pointer captured before that return would dangle the
//! moment the caller moves the returned value (e.g. into its own
//! `Arc`).

use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::Arc;

use crate::maintenance::{self, BackgroundMaintained, StatsSnapshot};
use crate::mem::epoch::{self, Atomic, Guard, Owned, Shared};
use crate::rng;
use crate::set::skiplist::MAX_LEVELS;
use crate::set::{Key, OrderedSet, SetParams, Value, KEY_MAX, KEY_MIN};

struct Node {
    key: Key,
    value: Value,
    next: Vec<Atomic<Node>>,
    deleted: AtomicBool,
    /// How many levels this node was chosen to eventually span.
    target_height: usize,
    /// Highest level this node is currently linked at. Written only by
    /// the background thread.
    raised_level: AtomicUsize,
}

impl Node {
    fn sentinel(key: Key) -> Node {
        Node {
            key,
            value: 0,
            next: (0..MAX_LEVELS).map(|_| Atomic::null()).collect(),
            deleted: AtomicBool::new(false),
            target_height: MAX_LEVELS,
            raised_level: AtomicUsize::new(MAX_LEVELS - 1),
        }
    }
}

struct Inner {
    head: Atomic<Node>,
    len: AtomicUsize,
    bg: maintenance::Background,
}

impl Inner {
    fn find<'g>(&self, key: Key, guard: &'g Guard) -> (Vec<Shared<'g, Node>>, Vec<Shared<'g, Node>>) {
        let mut preds: Vec<Option<Shared<Node>>> = vec![None; MAX_LEVELS];
        let mut succs: Vec<Option<Shared<Node>>> = vec![None; MAX_LEVELS];
        let mut pred = self.head.load(Relaxed, guard).expect("head never null");
        for level in (0..MAX_LEVELS).rev() {
            let mut curr = pred.next[level].load(Acquire, guard).expect("tail never null");
            loop {
                if curr.deleted.load(Acquire) {
                    curr = curr.next[level].load(Acquire, guard).expect("tail never null");
                    continue;
                }
                if curr.key < key {
                    pred = curr;
                    curr = pred.next[level].load(Acquire, guard).expect("tail never null");
                    continue;
                }
                break;
            }
            preds[level] = Some(pred);
            succs[level] = Some(curr);
        }
        (
            preds.into_iter().map(|p| p.expect("filled above")).collect(),
            succs.into_iter().map(|s| s.expect("filled above")).collect(),
        )
    }

    fn contains(&self, key: Key) -> bool {
        let guard = epoch::pin();
        let mut pred = self.head.load(Relaxed, &guard).expect("head never null");
        for level in (0..MAX_LEVELS).rev() {
            let mut curr = pred.next[level].load(Acquire, &guard).expect("tail never null");
            loop {
                if curr.deleted.load(Acquire) {
                    curr = curr.next[level].load(Acquire, &guard).expect("tail never null");
                    continue;
                }
                if curr.key < key {
                    pred = curr;
                    curr = pred.next[level].load(Acquire, &guard).expect("tail never null");
                    continue;
                }
                break;
            }
            if curr.key == key {
                return true;
            }
        }
        false
    }

    fn insert_with(&self, key: Key, value: Value) -> bool {
        let guard = epoch::pin();
        loop {
            let (preds, succs) = self.find(key, &guard);
            if succs[0].key == key {
                return false;
            }
            let height = rng::random_level(MAX_LEVELS);
            let node = Owned::new(Node {
                key,
                value,
                next: (0..MAX_LEVELS).map(|_| Atomic::null()).collect(),
                deleted: AtomicBool::new(false),
                target_height: height,
                raised_level: AtomicUsize::new(0),
            });
            node.next[0].store_shared(Some(succs[0]), Relaxed);
            match preds[0].next[0].cas(Some(succs[0]), Some(node), Release) {
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
        let (_, succs) = self.find(key, &guard);
        let node = succs[0];
        if node.key != key {
            return false;
        }
        if node
            .deleted
            .compare_exchange(false, true, Release, Relaxed)
            .is_err()
        {
            return false;
        }
        self.len.fetch_sub(1, Relaxed);
        true
    }

    fn size(&self) -> usize {
        self.len.load(Relaxed)
    }

    /// Descend the index to find the predecessor/successor of `key`
    /// at exactly `level`, assuming everything at levels >= `level`
    /// is already correctly linked (true by construction, since only
    /// this background thread ever writes those levels).
    fn locate_at_level<'g>(&self, key: Key, level: usize, guard: &'g Guard) -> (Shared<'g, Node>, Shared<'g, Node>) {
        let mut pred = self.head.load(Relaxed, guard).expect("head never null");
        let mut curr = pred.next[MAX_LEVELS - 1].load(Acquire, guard).expect("tail never null");
        for l in (0..MAX_LEVELS).rev() {
            if l < level {
                break;
            }
            curr = pred.next[l].load(Acquire, guard).expect("tail never null");
            while curr.key < key {
                pred = curr;
                curr = pred.next[l].load(Acquire, guard).expect("tail never null");
            }
        }
        (pred, curr)
    }

    fn raise<'g>(&self, node: Shared<'g, Node>, guard: &'g Guard, stats: &maintenance::Stats) {
        let target_level = node.raised_level.load(Relaxed) + 1;
        if target_level >= MAX_LEVELS || target_level >= node.target_height {
            return;
        }
        let (pred, succ) = self.locate_at_level(node.key, target_level, guard);
        if succ.key == node.key || node.deleted.load(Acquire) {
            return;
        }
        node.next[target_level].store_shared(Some(succ), Relaxed);
        pred.next[target_level].store_shared(Some(node), Release);
        node.raised_level.store(target_level, Release);
        stats.raises.fetch_add(1, Relaxed);
    }

    fn unlink_from_level(&self, node: Shared<Node>, level: usize, guard: &Guard) {
        let (pred, _) = self.locate_at_level(node.key, level, guard);
        let succ = node.next[level].load(Relaxed, guard).expect("tail never null");
        pred.next[level].store_shared(Some(succ), Release);
    }

    fn background_pass(&self, stats: &maintenance::Stats) {
        let guard = epoch::pin();
        let mut pred = self.head.load(Relaxed, &guard).expect("head never null");
        loop {
            let curr = pred.next[0].load(Acquire, &guard).expect("tail never null");
            if curr.key == KEY_MAX {
                break;
            }
            if curr.deleted.load(Acquire) {
                stats.delete_attempts.fetch_add(1, Relaxed);
                let succ = curr.next[0].load(Acquire, &guard).expect("tail never null");
                if pred.next[0].cas_shared(Some(curr), Some(succ), Release) {
                    stats.delete_succeeds.fetch_add(1, Relaxed);
                    let top = curr.raised_level.load(Relaxed);
                    for level in 1..=top {
                        self.unlink_from_level(curr, level, &guard);
                        stats.lowers.fetch_add(1, Relaxed);
                    }
                    unsafe { guard.unlinked(curr) };
                }
                // Either we just removed it (pred.next[0] now points
                // past it) or an inserter raced us (retry from the
                // same pred next time around). Either way, re-examine
                // from `pred` without advancing.
                continue;
            }
            if curr.raised_level.load(Relaxed) + 1 < curr.target_height {
                self.raise(curr, &guard, stats);
            }
            pred = curr;
        }
    }
}

/// Skip list whose structural upkeep — physical unlinking and index
/// raising — runs entirely on a background thread.
pub struct NoHotSpotSkipList {
    inner: Arc<Inner>,
}

impl OrderedSet for NoHotSpotSkipList {
    fn new(params: SetParams) -> NoHotSpotSkipList {
        let head = Node::sentinel(KEY_MIN);
        let tail = Owned::new(Node::sentinel(KEY_MAX));
        let guard = epoch::pin();
        let tail_ref = head.next[0].store_and_ref(tail, Relaxed, &guard);
        for level in 1..MAX_LEVELS {
            head.next[level].store_shared(Some(tail_ref), Relaxed);
        }
        drop(guard);

        let inner = Arc::new(Inner {
            head: Atomic::null(),
            len: AtomicUsize::new(0),
            bg: maintenance::Background::new(),
        });
        inner.head.store(Some(Owned::new(head)), Release);

        let set = NoHotSpotSkipList { inner };
        if params.start_bg {
            set.bg_start(params.bg_sleep);
        }
        set
    }

    fn contains(&self, key: Key) -> bool {
        self.inner.contains(key)
    }

    fn insert_with(&self, key: Key, value: Value) -> bool {
        self.inner.insert_with(key, value)
    }

    fn remove(&self, key: Key) -> bool {
        self.inner.remove(key)
    }

    fn size(&self) -> usize {
        self.inner.size()
    }
}

impl BackgroundMaintained for NoHotSpotSkipList {
    fn bg_start(&self, sleep: std::time::Duration) {
        let inner = self.inner.clone();
        self.inner.bg.start(sleep, move |stats| inner.background_pass(stats));
    }

    fn bg_stop(&self) {
        self.inner.bg.stop();
    }

    fn bg_stats(&self) -> StatsSnapshot {
        self.inner.bg.stats()
    }

    fn bg_running(&self) -> bool {
        self.inner.bg.is_running()
    }
}

unsafe impl Send for NoHotSpotSkipList {}
unsafe impl Sync for NoHotSpotSkipList {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn no_bg() -> SetParams {
        SetParams {
            start_bg: false,
            ..SetParams::default()
        }
    }

    #[test]
    fn insert_contains_remove_without_background() {
        let list = NoHotSpotSkipList::new(no_bg());
        assert!(list.insert(10));
        assert!(!list.insert(10));
        assert!(list.contains(10));
        assert!(list.remove(10));
        assert!(!list.contains(10));
    }

    #[test]
    fn background_thread_raises_and_collects() {
        let list = NoHotSpotSkipList::new(SetParams {
            start_bg: true,
            bg_sleep: Duration::from_millis(2),
            ..SetParams::default()
        });
        for k in 0..500 {
            list.insert(k);
        }
        for k in (0..500).step_by(2) {
            list.remove(k);
        }
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(list.size(), 250);
        for k in 0..500 {
            assert_eq!(list.contains(k), k % 2 == 1);
        }
        let stats = list.bg_stats();
        assert!(stats.loops > 0);
        list.bg_stop();
        assert!(!list.bg_running());
    }
}
