//! Kung–Lehman lock-based binary search tree (`spec.md` §4.5.1).
//!
//! Searches are lock-free: plain pointer chasing, no locks, no
//! validation. Updates take the parent's lock, re-check that it isn't
//! `blue` and still points at the expected child, then mutate.
//! Deleting a node with two children never touches live pointers in
//! place — a single right-rotation around its left child is performed
//! by allocating two *replacement* nodes, swinging one pointer at the
//! parent to publish them, and marking the two displaced originals
//! `blue` before retiring them. A lock-free reader can only ever see
//! the tree before or after a rotation, never mid-rotation. Repeating
//! this one step at a time (each time landing one level deeper, with
//! a strictly smaller left subtree) is what the spec calls
//! "deletion-by-rotation recurses" — it terminates because the left
//! subtree consumed by each rotation shrinks every time.

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
    blue: AtomicBool,
}

impl Node {
    fn new(key: Key, value: Value) -> Node {
        Node {
            key,
            value,
            left: Atomic::null(),
            right: Atomic::null(),
            lock: Mutex::new(()),
            blue: AtomicBool::new(false),
        }
    }

    fn child(&self, dir: Dir) -> &Atomic<Node> {
        match dir {
            Dir::Left => &self.left,
            Dir::Right => &self.right,
        }
    }
}

pub struct KungLehmanTree {
    root: Atomic<Node>,
    len: AtomicUsize,
}

impl KungLehmanTree {
    fn locate<'g>(&self, key: Key, guard: &'g Guard) -> Option<(Shared<'g, Node>, Dir, Shared<'g, Node>)> {
        let root = self.root.load(Relaxed, guard).expect("root never null");
        let mut parent = root;
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
}

impl OrderedSet for KungLehmanTree {
    fn new(_params: SetParams) -> KungLehmanTree {
        let tree = KungLehmanTree {
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
            if parent.blue.load(Acquire) || parent.child(dir).load(Acquire, &guard).is_some() {
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

            let parent_lock = parent.lock.lock().unwrap();
            if parent.blue.load(Acquire) || parent.child(dir).load(Acquire, &guard) != Some(node) {
                drop(parent_lock);
                continue;
            }
            let node_lock = node.lock.lock().unwrap();
            let left = node.left.load(Acquire, &guard);
            let right = node.right.load(Acquire, &guard);

            match (left, right) {
                (Some(l), Some(r)) => {
                    let l_lock = l.lock.lock().unwrap();
                    let lr = l.right.load(Acquire, &guard);
                    let new_node = Owned::new(Node::new(node.key, node.value));
                    new_node.left.store_shared(lr, Relaxed);
                    new_node.right.store_shared(Some(r), Relaxed);
                    let new_left = Owned::new(Node::new(l.key, l.value));
                    new_left.left.store_shared(l.left.load(Acquire, &guard), Relaxed);
                    new_left.right.store_and_ref(new_node, Relaxed, &guard);
                    parent.child(dir).store(Some(new_left), Release);

                    node.blue.store(true, Release);
                    l.blue.store(true, Release);
                    drop(l_lock);
                    drop(node_lock);
                    drop(parent_lock);
                    unsafe {
                        guard.unlinked(node);
                        guard.unlinked(l);
                    }
                    // The same key now lives one level deeper, as the
                    // right child of `new_left`; loop around and find
                    // it there.
                    continue;
                }
                (Some(c), None) | (None, Some(c)) => {
                    node.blue.store(true, Release);
                    parent.child(dir).store_shared(Some(c), Release);
                    drop(node_lock);
                    drop(parent_lock);
                    unsafe { guard.unlinked(node) };
                    self.len.fetch_sub(1, Relaxed);
                    return true;
                }
                (None, None) => {
                    node.blue.store(true, Release);
                    parent.child(dir).store_shared(None, Release);
                    drop(node_lock);
                    drop(parent_lock);
                    unsafe { guard.unlinked(node) };
                    self.len.fetch_sub(1, Relaxed);
                    return true;
                }
            }
        }
    }

    fn size(&self) -> usize {
        self.len.load(Relaxed)
    }
}

unsafe impl Send for KungLehmanTree {}
unsafe impl Sync for KungLehmanTree {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_contains_remove() {
        let tree = KungLehmanTree::new(SetParams::default());
        assert!(tree.insert(5));
        assert!(!tree.insert(5));
        assert!(tree.contains(5));
        assert!(tree.remove(5));
        assert!(!tree.contains(5));
        assert!(!tree.remove(5));
    }

    #[test]
    fn deletes_two_child_node_via_rotation() {
        let tree = KungLehmanTree::new(SetParams::default());
        for k in [50, 25, 75, 10, 40, 60, 90, 30, 45] {
            assert!(tree.insert(k));
        }
        assert!(tree.remove(50));
        assert!(!tree.contains(50));
        for k in [25, 75, 10, 40, 60, 90, 30, 45] {
            assert!(tree.contains(k));
        }
        assert_eq!(tree.size(), 8);
    }

    #[test]
    fn concurrent_disjoint_inserts() {
        use std::sync::Arc;
        use std::thread;

        let tree = Arc::new(KungLehmanTree::new(SetParams::default()));
        let mut handles = Vec::new();
        for t in 0..4 {
            let tree = tree.clone();
            handles.push(thread::spawn(move || {
                for i in 0..200 {
                    assert!(tree.insert(t * 1000 + i));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(tree.size(), 800);
    }
}
