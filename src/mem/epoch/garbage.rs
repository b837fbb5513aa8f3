//! Data structures for storing garbage to be freed later, once the
//! epochs have sufficiently advanced.
//!
//! Garbage is tracked thread-locally whenever possible: each thread
//! keeps three bags (`old`, `cur`, `new`) that rotate once per local
//! epoch advance. A bag that can't be fully collected within budget is
//! queued as a `PendingBags` entry so a single `reclaim()` call never
//! has unbounded latency. When a thread exits, its bags are migrated
//! into the global, CAS-mutated `ConcBag` chain for any other
//! participant to finish collecting.

use std::cmp;
use std::collections::VecDeque;
use std::mem;
use std::ptr;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use crate::mem::ZerosValid;

/// One item of garbage: enough information to run its destructor and
/// free its allocation without knowing its static type.
struct Item {
    ptr: *mut u8,
    free: unsafe fn(*mut u8),
}

impl std::fmt::Debug for Item {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Item").field("ptr", &self.ptr).finish()
    }
}

/// A single, thread-local bag of garbage.
#[derive(Debug)]
pub struct Bag(Vec<Item>);

/// Bags that didn't fit in one collection pass, queued FIFO.
#[derive(Debug)]
struct PendingBags {
    waiting: VecDeque<VecDeque<Item>>,
    size: usize,
}

impl Bag {
    fn new() -> Bag {
        Bag(Vec::new())
    }

    /// Record a boxed value for deferred deallocation.
    pub fn insert<T>(&mut self, elem: *mut T) {
        if mem::size_of::<T>() > 0 {
            self.0.push(Item {
                ptr: elem as *mut u8,
                free: free::<T>,
            });
        }
        unsafe fn free<T>(raw: *mut u8) {
            drop(Box::from_raw(raw as *mut T));
        }
    }

    /// Record an arbitrary closure for deferred execution — used to
    /// implement reclamation hooks (e.g. the Manber-Ladner BST's
    /// redundancy-removal callback) without baking a single global
    /// hook list into the GC itself.
    pub fn insert_deferred<F: FnOnce() + 'static>(&mut self, f: F) {
        let boxed: Box<dyn FnOnce()> = Box::new(f);
        let raw = Box::into_raw(Box::new(boxed));
        self.0.push(Item {
            ptr: raw as *mut u8,
            free: run_deferred,
        });
        unsafe fn run_deferred(raw: *mut u8) {
            let boxed = Box::from_raw(raw as *mut Box<dyn FnOnce()>);
            (*boxed)()
        }
    }

    fn len(&self) -> usize {
        self.0.len()
    }

    /// Run every item's destructor/closure, emptying the bag.
    pub unsafe fn collect(&mut self) {
        let mut items = mem::take(&mut self.0);
        for item in items.drain(..) {
            (item.free)(item.ptr);
        }
        self.0 = items;
    }
}

// The bags store raw pointers; the pointed-to data's `Send`-ness is
// the caller's responsibility (guaranteed by the engines, which only
// retire nodes that were themselves `Send`).
unsafe impl Send for Bag {}
unsafe impl Sync for Bag {}

impl PendingBags {
    fn new() -> PendingBags {
        PendingBags {
            size: 0,
            waiting: VecDeque::new(),
        }
    }

    fn has_pending(&self) -> bool {
        self.size > 0
    }

    fn size(&self) -> usize {
        self.size
    }

    fn add_bag(&mut self, to_add: Bag) {
        self.size += to_add.len();
        self.waiting.push_back(VecDeque::from(to_add.0));
    }

    unsafe fn collect_pending(&mut self, mut budget: usize) -> usize {
        while budget > 0 && !self.waiting.is_empty() {
            let mut bag = self.waiting.pop_front().unwrap();
            let to_free = cmp::min(budget, bag.len());
            budget -= to_free;
            self.size -= to_free;
            for item in bag.drain(..to_free) {
                (item.free)(item.ptr);
            }
            if !bag.is_empty() {
                self.waiting.push_front(bag);
            }
        }
        budget
    }
}

/// A thread-local set of garbage bags, rotated once per local epoch
/// advance: `old` is at least one epoch behind `cur`, which is at
/// least one epoch behind `new` (the current global epoch).
#[derive(Debug)]
pub struct Local {
    pub old: Bag,
    pub cur: Bag,
    pub new: Bag,
    pending: PendingBags,
}

impl Local {
    pub fn new() -> Local {
        Local {
            old: Bag::new(),
            cur: Bag::new(),
            new: Bag::new(),
            pending: PendingBags::new(),
        }
    }

    pub fn insert<T>(&mut self, elem: *mut T) {
        self.new.insert(elem)
    }

    pub fn insert_deferred<F: FnOnce() + 'static>(&mut self, f: F) {
        self.new.insert_deferred(f)
    }

    /// Collect one epoch's worth of garbage (the `old` bag, which is
    /// now two epochs behind the fresh global epoch) and rotate the
    /// bags forward. Returns the remaining collection budget.
    pub unsafe fn collect(&mut self, mut budget: usize) -> usize {
        if budget >= self.old.len() + self.pending.size() {
            budget -= self.old.len();
            self.old.collect();
        } else {
            let mut old_bag = Bag::new();
            mem::swap(&mut self.old, &mut old_bag);
            self.pending.add_bag(old_bag);
        }
        mem::swap(&mut self.old, &mut self.cur);
        mem::swap(&mut self.cur, &mut self.new);

        self.pending.collect_pending(budget)
    }

    pub unsafe fn collect_pending(&mut self, budget: usize) -> usize {
        if self.pending.has_pending() {
            self.pending.collect_pending(budget)
        } else {
            budget
        }
    }

    pub fn size(&self) -> usize {
        self.old.len() + self.cur.len() + self.new.len()
    }
}

/// A concurrent, Treiber-stack-based bag of `Bag`s, used as the
/// global garbage chain that thread-local garbage migrates into (on
/// thread exit, or when the thread-local `collect()` budget is
/// exhausted).
#[derive(Debug)]
pub struct ConcBag {
    head: AtomicPtr<Node>,
}

unsafe impl ZerosValid for ConcBag {}

#[derive(Debug)]
struct Node {
    data: Bag,
    next: AtomicPtr<Node>,
}

impl ConcBag {
    pub fn insert(&self, bag: Bag) {
        let n = Box::into_raw(Box::new(Node {
            data: bag,
            next: AtomicPtr::new(ptr::null_mut()),
        }));
        loop {
            let head = self.head.load(Acquire);
            unsafe { (*n).next.store(head, Relaxed) };
            if self
                .head
                .compare_exchange_weak(head, n, Release, Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn has_garbage(&self) -> bool {
        !self.head.load(Relaxed).is_null()
    }

    pub unsafe fn collect(&self) {
        let mut head = self.head.load(Relaxed);
        if !head.is_null() {
            head = self.head.swap(ptr::null_mut(), Acquire);
            while !head.is_null() {
                let mut n = Box::from_raw(head);
                n.data.collect();
                head = *n.next.get_mut();
            }
        }
    }
}
