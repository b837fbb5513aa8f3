//! Speculation-friendly AVL tree (`spec.md` §4.5.4).
//!
//! Workers never rotate and never unlink. `contains` is a plain
//! unsynchronized walk; `insert` CAS-links a new leaf (or CAS-clears
//! `deleted` on an existing one, un-deleting it); `remove` only ever
//! flips `deleted`. A background thread does everything else: it walks
//! the tree bottom-up recomputing `lefth`/`righth`/`localh`, rotates
//! wherever the cached heights disagree by more than one — allocating
//! replacement nodes and retiring the originals, the same
//! rotation-by-replacement idiom the lock-based trees use — and
//! physically splices out `deleted` nodes once their structural
//! position allows it. A two-children deleted node is spliced by
//! moving its in-order predecessor's key/value into its slot and
//! removing the predecessor's old occurrence, exactly as a sequential
//! BST deletion would, just performed by the maintenance thread rather
//! than by the caller of `remove`.
//!
//! Ownership is shared through `Arc<Inner>` for the same reason the
//! no-hot-spot skip lists are: the background closure cannot safely
//! capture a raw pointer to a struct returned by value from `new`.

use std::cell::Cell;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::Arc;

use crate::maintenance::{self, BackgroundMaintained, StatsSnapshot};
use crate::mem::epoch::{self, Atomic, Guard, Owned, Shared};
use crate::set::{Key, OrderedSet, SetParams, Value, KEY_MIN};

const MIN_BUDGET: usize = 64;
const MAX_BUDGET: usize = 4096;

struct Node {
    key: Key,
    value: AtomicUsize,
    left: Atomic<Node>,
    right: Atomic<Node>,
    deleted: AtomicBool,
    /// Cached subtree heights. The maintenance thread is the only
    /// writer; workers may read stale values.
    lefth: AtomicUsize,
    righth: AtomicUsize,
    localh: AtomicUsize,
}

impl Node {
    fn new(key: Key, value: Value, deleted: bool) -> Node {
        Node {
            key,
            value: AtomicUsize::new(value),
            left: Atomic::null(),
            right: Atomic::null(),
            deleted: AtomicBool::new(deleted),
            lefth: AtomicUsize::new(0),
            righth: AtomicUsize::new(0),
            localh: AtomicUsize::new(1),
        }
    }
}

fn height_of(n: Option<Shared<Node>>) -> usize {
    n.map(|n| n.localh.load(Relaxed)).unwrap_or(0)
}

struct Inner {
    /// Dummy root holder: `.right` is the real root.
    root_holder: Atomic<Node>,
    len: AtomicUsize,
    bg: maintenance::Background,
    budget: AtomicUsize,
}

impl Inner {
    fn contains(&self, key: Key) -> bool {
        let guard = epoch::pin();
        let root_holder = self.root_holder.load(Relaxed, &guard).expect("root holder never null");
        let mut curr = root_holder.right.load(Acquire, &guard);
        while let Some(c) = curr {
            if c.key == key {
                return !c.deleted.load(Acquire);
            }
            curr = if key < c.key {
                c.left.load(Acquire, &guard)
            } else {
                c.right.load(Acquire, &guard)
            };
        }
        false
    }

    fn insert_with(&self, key: Key, value: Value) -> bool {
        loop {
            let guard = epoch::pin();
            let root_holder = self.root_holder.load(Relaxed, &guard).expect("root holder never null");
            let mut parent = root_holder;
            let mut on_left = false;
            let mut curr = parent.right.load(Acquire, &guard);
            while let Some(c) = curr {
                if c.key == key {
                    if !c.deleted.load(Acquire) {
                        return false;
                    }
                    return match c.deleted.compare_exchange(true, false, Release, Relaxed) {
                        Ok(_) => {
                            c.value.store(value, Relaxed);
                            self.len.fetch_add(1, Relaxed);
                            true
                        }
                        Err(_) => false,
                    };
                }
                on_left = key < c.key;
                parent = c;
                curr = if on_left {
                    c.left.load(Acquire, &guard)
                } else {
                    c.right.load(Acquire, &guard)
                };
            }

            let slot = if on_left { &parent.left } else { &parent.right };
            let node = Owned::new(Node::new(key, value, false));
            match slot.cas(None, Some(node), Release) {
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
        let root_holder = self.root_holder.load(Relaxed, &guard).expect("root holder never null");
        let mut curr = root_holder.right.load(Acquire, &guard);
        while let Some(c) = curr {
            if c.key == key {
                return match c.deleted.compare_exchange(false, true, Release, Relaxed) {
                    Ok(_) => {
                        self.len.fetch_sub(1, Relaxed);
                        true
                    }
                    Err(_) => false,
                };
            }
            curr = if key < c.key {
                c.left.load(Acquire, &guard)
            } else {
                c.right.load(Acquire, &guard)
            };
        }
        false
    }

    fn size(&self) -> usize {
        self.len.load(Relaxed)
    }

    /// Splices `node` (a `deleted` leaf or one-child node) out of
    /// `slot`. Safe to call only once a non-two-children shape has
    /// been confirmed.
    fn splice_out(&self, slot: &Atomic<Node>, node: Shared<Node>, guard: &Guard, stats: &maintenance::Stats) {
        let left = node.left.load(Acquire, guard);
        let right = node.right.load(Acquire, guard);
        let child = left.or(right);
        stats.delete_attempts.fetch_add(1, Relaxed);
        if slot.cas_shared(Some(node), child, Release) {
            stats.delete_succeeds.fetch_add(1, Relaxed);
            unsafe { guard.unlinked(node) };
        }
    }

    /// Moves the in-order predecessor of `node` (found by walking the
    /// right spine of `node`'s left subtree) into `node`'s slot, then
    /// removes the predecessor's old occurrence. Both splices are
    /// single CASes; a lock-free reader only ever sees the tree before
    /// or after either one.
    fn splice_two_children(&self, slot: &Atomic<Node>, node: Shared<Node>, guard: &Guard, stats: &maintenance::Stats) {
        let left = node.left.load(Acquire, guard).expect("two children");
        let right = node.right.load(Acquire, guard).expect("two children");

        let mut pred_parent = node;
        let mut pred = left;
        while let Some(next) = pred.right.load(Acquire, guard) {
            pred_parent = pred;
            pred = next;
        }

        let replacement = Owned::new(Node::new(pred.key, pred.value.load(Relaxed), pred.deleted.load(Acquire)));
        if pred_parent == node {
            replacement.left.store_shared(pred.left.load(Acquire, guard), Relaxed);
        } else {
            replacement.left.store_shared(Some(left), Relaxed);
        }
        replacement.right.store_shared(Some(right), Relaxed);

        stats.delete_attempts.fetch_add(1, Relaxed);
        let replacement_ref = match slot.cas_and_ref(Some(node), replacement, Release, guard) {
            Ok(r) => r,
            Err(_) => return,
        };
        stats.delete_succeeds.fetch_add(1, Relaxed);
        unsafe { guard.unlinked(node) };

        if pred_parent != node {
            let pred_left = pred.left.load(Acquire, guard);
            if pred_parent.right.cas_shared(Some(pred), pred_left, Release) {
                unsafe { guard.unlinked(pred) };
            }
        } else {
            unsafe { guard.unlinked(pred) };
        }
        let _ = replacement_ref;
    }

    fn rotate_left_replace<'g>(&self, slot: &Atomic<Node>, x: Shared<'g, Node>, guard: &'g Guard, lh: usize, stats: &maintenance::Stats) -> Option<usize> {
        let y = x.right.load(Acquire, guard)?;
        let t2 = y.left.load(Acquire, guard);

        let new_x_localh = 1 + lh.max(height_of(t2));
        let new_x = Owned::new(Node::new(x.key, x.value.load(Relaxed), x.deleted.load(Acquire)));
        new_x.left.store_shared(x.left.load(Acquire, guard), Relaxed);
        new_x.right.store_shared(t2, Relaxed);
        new_x.lefth.store(lh, Relaxed);
        new_x.righth.store(height_of(t2), Relaxed);
        new_x.localh.store(new_x_localh, Relaxed);

        let y_right = y.right.load(Acquire, guard);
        let new_y_local = 1 + new_x_localh.max(height_of(y_right));
        let new_y = Owned::new(Node::new(y.key, y.value.load(Relaxed), y.deleted.load(Acquire)));
        new_y.left.store_and_ref(new_x, Relaxed, guard);
        new_y.right.store_shared(y_right, Relaxed);
        new_y.lefth.store(new_x_localh, Relaxed);
        new_y.righth.store(height_of(y_right), Relaxed);
        new_y.localh.store(new_y_local, Relaxed);

        match slot.cas(Some(x), Some(new_y), Release) {
            Ok(()) => {
                stats.raises.fetch_add(1, Relaxed);
                unsafe {
                    guard.unlinked(x);
                    guard.unlinked(y);
                }
                Some(new_y_local)
            }
            Err(_) => {
                // Lost the race (a worker attached under x or y
                // concurrently); give up this pass and retry later.
                None
            }
        }
    }

    fn rotate_right_replace<'g>(&self, slot: &Atomic<Node>, x: Shared<'g, Node>, guard: &'g Guard, rh: usize, stats: &maintenance::Stats) -> Option<usize> {
        let y = x.left.load(Acquire, guard)?;
        let t2 = y.right.load(Acquire, guard);

        let new_x_localh = 1 + rh.max(height_of(t2));
        let new_x = Owned::new(Node::new(x.key, x.value.load(Relaxed), x.deleted.load(Acquire)));
        new_x.right.store_shared(x.right.load(Acquire, guard), Relaxed);
        new_x.left.store_shared(t2, Relaxed);
        new_x.righth.store(rh, Relaxed);
        new_x.lefth.store(height_of(t2), Relaxed);
        new_x.localh.store(new_x_localh, Relaxed);

        let y_left = y.left.load(Acquire, guard);
        let new_y_local = 1 + new_x_localh.max(height_of(y_left));
        let new_y = Owned::new(Node::new(y.key, y.value.load(Relaxed), y.deleted.load(Acquire)));
        new_y.right.store_and_ref(new_x, Relaxed, guard);
        new_y.left.store_shared(y_left, Relaxed);
        new_y.righth.store(new_x_localh, Relaxed);
        new_y.lefth.store(height_of(y_left), Relaxed);
        new_y.localh.store(new_y_local, Relaxed);

        match slot.cas(Some(x), Some(new_y), Release) {
            Ok(()) => {
                stats.raises.fetch_add(1, Relaxed);
                unsafe {
                    guard.unlinked(x);
                    guard.unlinked(y);
                }
                Some(new_y_local)
            }
            Err(_) => None,
        }
    }

    /// Recomputes heights bottom-up, rotates where imbalanced, and
    /// splices out `deleted` nodes where structurally safe. Returns
    /// the (possibly just-recomputed) height of whatever now occupies
    /// `slot`, for the caller one level up to use as its own child
    /// height.
    fn propagate<'g>(&self, slot: &Atomic<Node>, guard: &'g Guard, budget: &Cell<usize>, seen: &Cell<usize>, deleted_seen: &Cell<usize>, stats: &maintenance::Stats) -> usize {
        let node = match slot.load(Acquire, guard) {
            Some(n) => n,
            None => return 0,
        };
        seen.set(seen.get() + 1);
        if node.deleted.load(Acquire) {
            deleted_seen.set(deleted_seen.get() + 1);
        }

        let lh = self.propagate(&node.left, guard, budget, seen, deleted_seen, stats);
        let rh = self.propagate(&node.right, guard, budget, seen, deleted_seen, stats);

        // Re-load: the left/right recursion may have replaced `node`'s
        // children, or even `node` itself was spliced out from under
        // us by a concurrent... there is no concurrent maintainer, but
        // a worker's un-delete could have changed `node.deleted`
        // between our read above and now, which is fine to observe
        // either way.
        let node = match slot.load(Acquire, guard) {
            Some(n) => n,
            None => return 0,
        };

        if budget.get() == 0 {
            node.lefth.store(lh, Relaxed);
            node.righth.store(rh, Relaxed);
            node.localh.store(1 + lh.max(rh), Relaxed);
            return node.localh.load(Relaxed);
        }

        if node.deleted.load(Acquire) {
            let left = node.left.load(Acquire, guard);
            let right = node.right.load(Acquire, guard);
            if left.is_none() || right.is_none() {
                budget.set(budget.get() - 1);
                self.splice_out(slot, node, guard, stats);
                return match left.or(right) {
                    Some(c) => c.localh.load(Relaxed),
                    None => 0,
                };
            } else {
                budget.set(budget.get() - 1);
                self.splice_two_children(slot, node, guard, stats);
                return match slot.load(Acquire, guard) {
                    Some(r) => r.localh.load(Relaxed),
                    None => 0,
                };
            }
        }

        if lh > rh + 1 {
            let left = node.left.load(Acquire, guard);
            let left_lh = left.map(|l| l.lefth.load(Relaxed)).unwrap_or(0);
            let left_rh = left.map(|l| l.righth.load(Relaxed)).unwrap_or(0);
            budget.set(budget.get().saturating_sub(1));
            if left_rh > left_lh {
                if let Some(l) = left {
                    self.rotate_left_replace(&node.left, l, guard, left_lh, stats);
                }
            }
            if let Some(h) = self.rotate_right_replace(slot, node, guard, rh, stats) {
                return h;
            }
        } else if rh > lh + 1 {
            let right = node.right.load(Acquire, guard);
            let right_lh = right.map(|r| r.lefth.load(Relaxed)).unwrap_or(0);
            let right_rh = right.map(|r| r.righth.load(Relaxed)).unwrap_or(0);
            budget.set(budget.get().saturating_sub(1));
            if right_lh > right_rh {
                if let Some(r) = right {
                    self.rotate_right_replace(&node.right, r, guard, right_rh, stats);
                }
            }
            if let Some(h) = self.rotate_left_replace(slot, node, guard, lh, stats) {
                return h;
            }
        }

        node.lefth.store(lh, Relaxed);
        node.righth.store(rh, Relaxed);
        let localh = 1 + lh.max(rh);
        node.localh.store(localh, Relaxed);
        localh
    }

    fn background_pass(&self, stats: &maintenance::Stats) {
        let guard = epoch::pin();
        let root_holder = self.root_holder.load(Relaxed, &guard).expect("root holder never null");
        let budget = Cell::new(self.budget.load(Relaxed));
        let seen = Cell::new(0usize);
        let deleted_seen = Cell::new(0usize);
        self.propagate(&root_holder.right, &guard, &budget, &seen, &deleted_seen, stats);

        // Throttle: the more of the tree is logically deleted, the
        // larger next pass's removal budget gets, so a burst of
        // removals doesn't linger as dead weight for many passes.
        let ratio_pct = if seen.get() == 0 { 0 } else { deleted_seen.get() * 100 / seen.get() };
        let next_budget = (MIN_BUDGET + ratio_pct * (MAX_BUDGET - MIN_BUDGET) / 100).clamp(MIN_BUDGET, MAX_BUDGET);
        self.budget.store(next_budget, Relaxed);
    }
}

/// AVL tree whose rebalancing and physical deletion run entirely on a
/// background thread; workers only ever CAS-link, CAS-undelete, or
/// flag-delete.
pub struct SpeculativeAvlTree {
    inner: Arc<Inner>,
}

impl OrderedSet for SpeculativeAvlTree {
    fn new(params: SetParams) -> SpeculativeAvlTree {
        let inner = Arc::new(Inner {
            root_holder: Atomic::null(),
            len: AtomicUsize::new(0),
            bg: maintenance::Background::new(),
            budget: AtomicUsize::new(MIN_BUDGET),
        });
        inner.root_holder.store(Some(Owned::new(Node::new(KEY_MIN, 0, true))), Release);

        let set = SpeculativeAvlTree { inner };
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

impl BackgroundMaintained for SpeculativeAvlTree {
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

unsafe impl Send for SpeculativeAvlTree {}
unsafe impl Sync for SpeculativeAvlTree {}

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
        let tree = SpeculativeAvlTree::new(no_bg());
        assert!(tree.insert(10));
        assert!(!tree.insert(10));
        assert!(tree.contains(10));
        assert!(tree.remove(10));
        assert!(!tree.contains(10));
    }

    #[test]
    fn undelete_restores_a_removed_key() {
        let tree = SpeculativeAvlTree::new(no_bg());
        assert!(tree.insert(7));
        assert!(tree.remove(7));
        assert!(!tree.contains(7));
        assert!(tree.insert(7));
        assert!(tree.contains(7));
    }

    #[test]
    fn background_thread_rebalances_and_collects() {
        let tree = SpeculativeAvlTree::new(SetParams {
            start_bg: true,
            bg_sleep: Duration::from_millis(2),
            ..SetParams::default()
        });
        let keys: Vec<Key> = (0..2000).collect();
        for &k in &keys {
            tree.insert(k);
        }
        for &k in keys.iter().step_by(2) {
            tree.remove(k);
        }
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(tree.size(), 1000);
        for &k in &keys {
            assert_eq!(tree.contains(k), k % 2 == 1);
        }
        let stats = tree.bg_stats();
        assert!(stats.loops > 0);
        tree.bg_stop();
        assert!(!tree.bg_running());
    }
}
