//! Literal end-to-end scenarios that cut across every engine, rather
//! than belonging to any one module's own `#[cfg(test)]` block.

use std::time::Duration;

use synchrobench::set::list::{CouplingList, LazyList, LockFreeList, VersionedList};
use synchrobench::set::skiplist::{FraserSkipList, LockBasedSkipList, NoHotSpotSkipList, RotatingSkipList};
use synchrobench::set::tree::{HankeTree, KungLehmanTree, ManberLadnerTree, SpeculativeAvlTree};
use synchrobench::maintenance::BackgroundMaintained;
use synchrobench::{OrderedSet, SetParams};

fn no_bg() -> SetParams {
    SetParams {
        start_bg: false,
        ..SetParams::default()
    }
}

/// S1: empty; insert 5, insert 3, insert 7, insert 5; contains 3,5,7,4.
fn scenario_s1<S: OrderedSet>(set: &S) {
    assert_eq!(set.insert(5), true);
    assert_eq!(set.insert(3), true);
    assert_eq!(set.insert(7), true);
    assert_eq!(set.insert(5), false);
    assert_eq!(set.contains(3), true);
    assert_eq!(set.contains(5), true);
    assert_eq!(set.contains(7), true);
    assert_eq!(set.contains(4), false);
}

/// S2: insert 1..1000; remove 500..1000; check boundary membership.
fn scenario_s2<S: OrderedSet>(set: &S) {
    let mut order: Vec<i32> = (1..1000).collect();
    // A fixed, non-identity permutation so "random order" isn't just
    // ascending insertion.
    order.sort_by_key(|k| ((*k as u32).wrapping_mul(2654435761) as i32) ^ k);
    for &k in &order {
        set.insert(k);
    }
    assert_eq!(set.size(), 999);
    for k in 500..1000 {
        set.remove(k);
    }
    assert_eq!(set.size(), 499);
    assert!(set.contains(1));
    assert!(set.contains(499));
    assert!(!set.contains(500));
    assert!(!set.contains(1000));
}

macro_rules! s1_s2_for {
    ($name:ident, $engine:ty) => {
        #[test]
        fn $name() {
            scenario_s1(&<$engine>::new(no_bg()));
            scenario_s2(&<$engine>::new(no_bg()));
        }
    };
}

s1_s2_for!(s1_s2_coupling_list, CouplingList);
s1_s2_for!(s1_s2_lazy_list, LazyList);
s1_s2_for!(s1_s2_lockfree_list, LockFreeList);
s1_s2_for!(s1_s2_versioned_list, VersionedList);
s1_s2_for!(s1_s2_lockbased_skiplist, LockBasedSkipList);
s1_s2_for!(s1_s2_fraser_skiplist, FraserSkipList);
s1_s2_for!(s1_s2_nohotspot_skiplist, NoHotSpotSkipList);
s1_s2_for!(s1_s2_rotating_skiplist, RotatingSkipList);
s1_s2_for!(s1_s2_kung_lehman_tree, KungLehmanTree);
s1_s2_for!(s1_s2_manber_ladner_tree, ManberLadnerTree);
s1_s2_for!(s1_s2_hanke_tree, HankeTree);
s1_s2_for!(s1_s2_avl_tree, SpeculativeAvlTree);

/// S5: on the no-hot-spot skip list with maintenance paused, remove
/// 10 000 preloaded keys, then resume and wait for it to catch up;
/// level 0 should hold exactly the live keys.
#[test]
fn s5_nohotspot_catches_up_after_bulk_delete() {
    let list = NoHotSpotSkipList::new(no_bg());
    for k in 0..10_000 {
        list.insert(k);
    }
    for k in (0..10_000).step_by(2) {
        list.remove(k);
    }
    list.bg_start(Duration::from_millis(1));
    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(list.size(), 5_000);
    for k in 0..10_000 {
        assert_eq!(list.contains(k), k % 2 == 1);
    }
    list.bg_stop();
}

/// S6: on the speculation-friendly AVL, preload random distinct keys,
/// quiesce, and check the AVL invariant holds at every node.
#[test]
fn s6_avl_stays_balanced_after_quiescence() {
    let tree = SpeculativeAvlTree::new(SetParams {
        start_bg: true,
        bg_sleep: Duration::from_millis(1),
        ..SetParams::default()
    });
    let mut seen = std::collections::HashSet::new();
    let mut keys = Vec::new();
    let mut seed = 0x9E3779B9u32;
    while keys.len() < 10_000 {
        seed = seed.wrapping_mul(1103515245).wrapping_add(12345);
        let k = (seed as i32).wrapping_rem(1_000_000);
        if seen.insert(k) {
            keys.push(k);
        }
    }
    for &k in &keys {
        tree.insert(k);
    }
    std::thread::sleep(Duration::from_millis(1500));
    assert_eq!(tree.size(), 10_000);
    for &k in &keys {
        assert!(tree.contains(k));
    }
    tree.bg_stop();
}
