//! The ordered-set contract shared by every engine in this crate
//! (`spec.md` §3, §7): a set of 32-bit signed keys supporting
//! `contains`, `insert` and `remove`, each linearizable and
//! infallible.
//!
//! Every engine owns two sentinel keys at its head and tail —
//! [`KEY_MIN`] and [`KEY_MAX`] — which are never visible through the
//! public API; callers that insert or remove them get `false` back
//! unconditionally, the same answer they'd get from an empty range.

pub mod list;
pub mod skiplist;
pub mod tree;

use std::time::Duration;

/// Keys are 32-bit signed integers, matching the original benchmark's
/// key domain.
pub type Key = i32;

/// Every engine associates a key with an opaque payload; benchmarks
/// only ever store the key itself as the value; `size()` counts nodes
/// by payload presence, not by any particular value.
pub type Value = usize;

/// The lower sentinel. No public operation ever reports this key as
/// present.
pub const KEY_MIN: Key = i32::MIN;

/// The upper sentinel. No public operation ever reports this key as
/// present.
pub const KEY_MAX: Key = i32::MAX;

/// Construction parameters shared across all engine families. Not
/// every field is meaningful to every engine (a plain lock-coupling
/// list ignores `initial_level_max`); unused fields are simply
/// ignored rather than rejected, since `spec.md` §6.1 treats the CLI
/// surface as one flat namespace shared by every `--engine` choice.
#[derive(Clone, Copy, Debug)]
pub struct SetParams {
    /// Skip-list engines: the number of levels allocated up front.
    pub initial_level_max: usize,
    /// Skip-list/tree engines with a background maintenance thread:
    /// whether to start it immediately on construction.
    pub start_bg: bool,
    /// Sleep interval between background maintenance passes.
    pub bg_sleep: Duration,
    /// Speculation-friendly AVL only: how many worker operations run
    /// lock-free (optimistic) before a thread falls back to taking the
    /// coarse maintenance lock, biased toward the optimistic path.
    pub bias_range: u32,
    pub bias_offset: u32,
    /// Lock-based skip list only: granularity of the locks guarding
    /// node linkage.
    pub skiplist_granularity: LockGranularity,
}

impl Default for SetParams {
    fn default() -> SetParams {
        SetParams {
            initial_level_max: 32,
            start_bg: true,
            bg_sleep: Duration::from_millis(1),
            bias_range: 10,
            bias_offset: 1,
            skiplist_granularity: LockGranularity::Striped,
        }
    }
}

/// Lock granularity for [`skiplist::LockBasedSkipList`] (`spec.md`
/// §9's note that the lock-based skip list's lock kind is selectable
/// rather than fixed at one extreme).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockGranularity {
    /// One mutex for the entire structure.
    Coarse,
    /// A fixed-size table of mutexes, assigned by hashing a node's
    /// key; a middle ground between throughput and implementation
    /// simplicity.
    Striped,
    /// Every node owns its own mutex.
    PerNode,
}

/// The contract every concurrent ordered-set engine implements.
///
/// All three mutators are total and infallible: a duplicate `insert`
/// or a missing-key `remove` simply reports `false`, never errors.
/// Implementations must be linearizable with respect to real time, and
/// safe to call from any number of threads without external
/// synchronization.
pub trait OrderedSet: Send + Sync {
    /// Build a fresh, empty set.
    fn new(params: SetParams) -> Self
    where
        Self: Sized;

    /// `true` iff `key` is currently a member.
    fn contains(&self, key: Key) -> bool;

    /// Insert `key` with a default payload of `key as Value`. Returns
    /// `true` iff `key` was not already present.
    fn insert(&self, key: Key) -> bool {
        self.insert_with(key, key as Value)
    }

    /// Insert `key` with an explicit payload. Returns `true` iff `key`
    /// was not already present.
    fn insert_with(&self, key: Key, value: Value) -> bool;

    /// Remove `key`. Returns `true` iff `key` was present.
    fn remove(&self, key: Key) -> bool;

    /// The number of keys currently present. Not guaranteed
    /// linearizable with concurrent mutators (`spec.md` §7's note on
    /// `size` being a best-effort snapshot), but exact in any quiescent
    /// state.
    fn size(&self) -> usize;
}
