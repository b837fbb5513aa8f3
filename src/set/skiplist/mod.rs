//! Skip-list engines (`spec.md` §4.4): a lock-based variant with a
//! selectable granularity, a CAS-only lock-free variant, a no-hot-spot
//! variant backed by a background maintenance thread, and a rotating
//! variant that avoids ever physically shifting a level array.
//!
//! All four share the same maximum tower height and level-selection
//! policy ([`crate::rng::random_level`]); only the per-node and
//! per-operation concurrency discipline differs.

pub mod fraser;
pub mod lockbased;
pub mod nohotspot;
pub mod rotating;

pub use fraser::FraserSkipList;
pub use lockbased::LockBasedSkipList;
pub use nohotspot::NoHotSpotSkipList;
pub use rotating::RotatingSkipList;

/// Hard ceiling on tower height across every skip-list engine. Chosen
/// so that at 2^24 elements the expected top level (log2 n) stays well
/// under the cap.
pub const MAX_LEVELS: usize = 32;
