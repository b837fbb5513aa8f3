//! Synchrobench: a corpus of concurrent ordered-set engines sharing a
//! common epoch-based reclamation runtime.
//!
//! Every engine under [`set`] implements the same abstract contract —
//! `insert`/`contains`/`remove` over an `i32`-keyed set — while
//! internally following a distinct synchronization discipline (lock
//! coupling, optimistic lazy traversal, versioned try-locks, lock-free
//! helping, non-blocking skip lists, or background-rebalanced trees).
//! See `SPEC_FULL.md` for the full design.

pub mod mem;
pub mod rng;
pub mod error;
pub mod maintenance;
pub mod set;

pub use error::BenchError;
pub use set::{Key, Value, OrderedSet, SetParams, KEY_MAX, KEY_MIN};
