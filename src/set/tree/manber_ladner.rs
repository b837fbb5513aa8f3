//! Manber–Ladner lock-based binary search tree (`spec.md` §4.5.2).
//!
//! Every key lives on an internal node — there is no separate leaf
//! representation. Removing a node with two children uses predecessor
//! substitution: the in-order predecessor `e` (the rightmost node of
//! the left subtree) is found unsynchronized, a copy `f` carrying `e`'s
//! key/value and the original node's children is installed at the
//! parent under lock, the original node is retired, and `e` is flagged
//! `redundant` rather than spliced out in the same step. A small GC
//! hook (`collect_redundant`) finishes the job by unlinking `e` under
//! its own parent's lock; it re-validates before acting so it is safe
//! to call eagerly (as this engine does, right after substitution) or
//! from a later sweep without any other change.

use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::Mutex;

use crate::mem::epoch::{self, Atomic, Guard, Owned, Shared};
use crate::set::{Key, OrderedSet, SetParams, Value, KEY_MIN};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Dir {
    Left,
    Right,
}

struct Node {
    key: Key,
    value: Value,
    left: Atomic<Node>,
    right: Atomic<Node>,
    lock: Mutex<()>,
    redundant: AtomicBool,
}

impl Node {
    fn new(key: Key, value: Value) -> Node {
        Node {
            key,
            value,
            left: Atomic::null(),
            right: Atomic::null(),
            lock: Mutex::new(()),
            redundant: AtomicBool::new(false),
        }
    }

    fn child(&self, dir: Dir) -> &Atomic<Node> {
        match dir {
            Dir::Left => &self.left,
            Dir::Right => &self.right,
        }
    }
}

pub struct ManberLadnerTree {
    root: Atomic<Node>,
    len: AtomicUsize,
}

impl ManberLadnerTree {
    fn locate<'g>(&self, key: Key, guard: &'g Guard) -> Option<(Shared<'g, Node>, Dir, Shared<'g, Node>)> {
        let mut parent = self.root.load(Relaxed, guard).expect("root never null");
        let mut dir = Dir::Right;
        let mut curr = parent.child(dir).load(Acquire, guard)?;
        loop {
            if curr.key == key {
                return Some((parent, dir, curr));
            }
            let next_dir = if key < curr.key { Dir::Left } else { Dir::Right };
            match curr.child(next_dir).load(Acquire, guard) {
                Some(next) => {
                    parent = curr;
                    dir = next_dir;
                    curr = next;
                }
                None => return None,
            }
        }
    }

    /// Unlinks `e` from under `e_parent`'s right pointer if it is still
    /// there and still flagged redundant. Safe to call more than once,
    /// or long after the substitution that flagged `e` — which is the
    /// point of a GC hook.
    fn collect_redundant(&self, e_parent: Shared<Node>, e: Shared<Node>, guard: &Guard) {
        let _lock = e_parent.lock.lock().unwrap();
        if !e.redundant.load(Acquire) || e_parent.right.load(Acquire, guard) != Some(e) {
            return;
        }
        let child = e.left.load(Acquire, guard);
        e_parent.right.store_shared(child, Release);
        drop(_lock);
        unsafe { guard.unlinked(e) };
    }
}

impl OrderedSet for ManberLadnerTree {
    fn new(_params: SetParams) -> ManberLadnerTree {
        let tree = ManberLadnerTree {
            root: Atomic::null(),
            len: AtomicUsize::new(0),
        };
        tree.root.store(Some(Owned::new(Node::new(KEY_MIN, 0))), Release);
        tree
    }

    fn contains(&self, key: Key) -> bool {
        let guard = epoch::pin();
        let root = self.root.load(Relaxed, &guard).expect("root never null");
        let mut curr = match root.right.load(Acquire, &guard) {
            Some(c) => c,
            None => return false,
        };
        loop {
            if curr.key == key {
                return true;
            }
            let next = if key < curr.key {
                curr.left.load(Acquire, &guard)
            } else {
                curr.right.load(Acquire, &guard)
            };
            match next {
                Some(n) => curr = n,
                None => return false,
            }
        }
    }

    fn insert_with(&self, key: Key, value: Value) -> bool {
        loop {
            let guard = epoch::pin();
            let root = self.root.load(Relaxed, &guard).expect("root never null");
            let mut parent = root;
            let mut dir = Dir::Right;
            let mut curr = parent.child(dir).load(Acquire, &guard);
            while let Some(c) = curr {
                if c.key == key {
                    return false;
                }
                dir = if key < c.key { Dir::Left } else { Dir::Right };
                parent = c;
                curr = parent.child(dir).load(Acquire, &guard);
            }

            let _guard_lock = parent.lock.lock().unwrap();
            if parent.child(dir).load(Acquire, &guard).is_some() {
                continue;
            }
            parent.child(dir).store(Some(Owned::new(Node::new(key, value))), Release);
            self.len.fetch_add(1, Relaxed);
            return true;
        }
    }

    fn remove(&self, key: Key) -> bool {
        loop {
            let guard = epoch::pin();
            let (parent, dir, node) = match self.locate(key, &guard) {
                Some(t) => t,
                None => return false,
            };

            let left = node.left.load(Acquire, &guard);
            let right = node.right.load(Acquire, &guard);

            let mut e_parent = node;
            let mut e = left;
            let mut deep = false;
            while let Some(candidate) = e {
                match candidate.right.load(Acquire, &guard) {
                    Some(next) => {
                        e_parent = candidate;
                        e = Some(next);
                        deep = true;
                    }
                    None => break,
                }
            }

            let parent_lock = parent.lock.lock().unwrap();
            if parent.child(dir).load(Acquire, &guard) != Some(node) {
                drop(parent_lock);
                continue;
            }
            let node_lock = node.lock.lock().unwrap();
            if node.left.load(Acquire, &guard) != left || node.right.load(Acquire, &guard) != right {
                drop(node_lock);
                drop(parent_lock);
                continue;
            }

            match (left, right) {
                (None, None) => {
                    parent.child(dir).store_shared(None, Release);
                    drop(node_lock);
                    drop(parent_lock);
                    unsafe { guard.unlinked(node) };
                    self.len.fetch_sub(1, Relaxed);
                    return true;
                }
                (Some(c), None) | (None, Some(c)) => {
                    parent.child(dir).store_shared(Some(c), Release);
                    drop(node_lock);
                    drop(parent_lock);
                    unsafe { guard.unlinked(node) };
                    self.len.fetch_sub(1, Relaxed);
                    return true;
                }
                (Some(_), Some(r)) => {
                    let e = e.expect("a non-empty left subtree always has a predecessor");
                    let e_valid = if deep {
                        e_parent.right.load(Acquire, &guard) == Some(e) && e.right.load(Acquire, &guard).is_none()
                    } else {
                        Some(e) == left
                    };
                    if !e_valid {
                        drop(node_lock);
                        drop(parent_lock);
                        continue;
                    }

                    let f = Owned::new(Node::new(e.key, e.value));
                    if deep {
                        f.left.store_shared(left, Relaxed);
                    } else {
                        f.left.store_shared(e.left.load(Acquire, &guard), Relaxed);
                    }
                    f.right.store_shared(Some(r), Relaxed);
                    parent.child(dir).store(Some(f), Release);
                    drop(node_lock);
                    drop(parent_lock);
                    unsafe { guard.unlinked(node) };
                    self.len.fetch_sub(1, Relaxed);

                    if deep {
                        e.redundant.store(true, Release);
                        self.collect_redundant(e_parent, e, &guard);
                    } else {
                        unsafe { guard.unlinked(e) };
                    }
                    return true;
                }
            }
        }
    }

    fn size(&self) -> usize {
        self.len.load(Relaxed)
    }
}

unsafe impl Send for ManberLadnerTree {}
unsafe impl Sync for ManberLadnerTree {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_contains_remove() {
        let tree = ManberLadnerTree::new(SetParams::default());
        assert!(tree.insert(5));
        assert!(!tree.insert(5));
        assert!(tree.contains(5));
        assert!(tree.remove(5));
        assert!(!tree.contains(5));
    }

    #[test]
    fn predecessor_substitution_keeps_ordering() {
        let tree = ManberLadnerTree::new(SetParams::default());
        for k in [50, 25, 75, 10, 40, 35, 45] {
            assert!(tree.insert(k));
        }
        // Predecessor of 50 is 45 (rightmost of the left subtree, deep case).
        assert!(tree.remove(50));
        for k in [25, 75, 10, 40, 35, 45] {
            assert!(tree.contains(k));
        }
        assert!(!tree.contains(50));
        assert_eq!(tree.size(), 6);
    }

    #[test]
    fn predecessor_is_immediate_left_child() {
        let tree = ManberLadnerTree::new(SetParams::default());
        for k in [50, 25, 75] {
            assert!(tree.insert(k));
        }
        // Predecessor of 50 is 25 itself (shallow case, no right spine).
        assert!(tree.remove(50));
        assert!(tree.contains(25));
        assert!(tree.contains(75));
        assert_eq!(tree.size(), 2);
    }

    #[test]
    fn concurrent_disjoint_inserts_and_removes() {
        use std::sync::Arc;
        use std::thread;

        let tree = Arc::new(ManberLadnerTree::new(SetParams::default()));
        let mut handles = Vec::new();
        for t in 0..4 {
            let tree = tree.clone();
            handles.push(thread::spawn(move || {
                for i in 0..200 {
                    assert!(tree.insert(t * 1000 + i));
                }
                for i in 0..200 {
                    assert!(tree.remove(t * 1000 + i));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(tree.size(), 0);
    }
}
