//! Low-level memory helpers shared by the epoch GC and the engines:
//! cache-line padding to avoid false sharing between per-thread and
//! per-epoch counters, and a size-classed node pool used on allocation
//! hot paths.

use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize};

pub mod epoch;
pub mod pool;

/// Pads and aligns a value to the size of a cache line, to protect
/// against false sharing on multi-core machines.
///
/// Most modern x86-64/aarch64 cores use 64-byte cache lines; padding to
/// that boundary keeps e.g. two threads' independent counters from
/// bouncing the same line between their caches.
#[derive(Debug, Default)]
#[repr(align(64))]
pub struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    pub fn new(t: T) -> CachePadded<T> {
        CachePadded { value: t }
    }
}

impl<T: ZerosValid> CachePadded<T> {
    /// Build a zero-initialized instance, for types where the
    /// all-zeros bit pattern is a valid value (e.g. `AtomicUsize::new(0)`).
    pub fn zeroed() -> CachePadded<T> {
        unsafe { mem::zeroed() }
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for CachePadded<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

/// Marker for types whose all-zero-bytes representation is a valid
/// value, so that `CachePadded::zeroed` and static garbage arrays can
/// be built without running a constructor.
///
/// # Safety
/// Implementors must guarantee `mem::zeroed::<Self>()` is a valid
/// instance.
pub unsafe trait ZerosValid {}

unsafe impl ZerosValid for AtomicUsize {}
unsafe impl ZerosValid for AtomicIsize {}
unsafe impl ZerosValid for AtomicBool {}
unsafe impl<T> ZerosValid for epoch::Atomic<T> {}
