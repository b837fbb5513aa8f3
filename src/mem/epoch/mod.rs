//! Epoch-based memory management.
//!
//! This module provides fast, lock-free-friendly memory reclamation
//! for the ordered-set engines in this crate. It follows Keir
//! Fraser's epoch-based reclamation: a thread that wants to read or
//! unlink nodes from a shared structure first "pins" the current
//! epoch via [`pin`], which returns a [`Guard`]. Pointers extracted
//! from an `Atomic<T>` while a `Guard` is alive are returned as
//! [`Shared<'a, T>`] values whose lifetime is tied to that guard,
//! guaranteeing the pointee cannot be freed while the guard lives.
//!
//! Three pointer types work together:
//!
//! - [`Owned<T>`] — like `Box<T>`: uniquely owned data not yet
//!   published in a shared structure.
//! - [`Shared<'a, T>`] — like `&'a T`: a snapshot of shared data,
//!   valid for at least lifetime `'a`, which may or may not still be
//!   reachable from the structure.
//! - [`Atomic<T>`] — like `AtomicPtr<T>`: atomic access to a nullable
//!   pointer, bridging `Owned` and `Shared`.
//!
//! # Example
//!
//! ```
//! use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
//! use synchrobench::mem::epoch::{self, Atomic, Owned};
//!
//! struct Stack<T> {
//!     head: Atomic<Node<T>>,
//! }
//!
//! struct Node<T> {
//!     data: T,
//!     next: Atomic<Node<T>>,
//! }
//!
//! impl<T> Stack<T> {
//!     fn push(&self, t: T) {
//!         let mut n = Owned::new(Node { data: t, next: Atomic::null() });
//!         let guard = epoch::pin();
//!         loop {
//!             let head = self.head.load(Relaxed, &guard);
//!             n.next.store_shared(head, Relaxed);
//!             match self.head.cas_and_ref(head, n, Release, &guard) {
//!                 Ok(_) => return,
//!                 Err(owned) => n = owned,
//!             }
//!         }
//!     }
//! }
//! ```

use std::marker::PhantomData;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::ptr;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::atomic::{self, Ordering};

mod garbage;
mod global;
mod local;
mod participant;
mod participants;

pub mod options;

use participant::Participant;

/// Like `Box<T>`: owned, heap-allocated data not yet published to a
/// concurrent structure.
pub struct Owned<T> {
    data: Box<T>,
}

impl<T> Owned<T> {
    pub fn new(t: T) -> Owned<T> {
        Owned { data: Box::new(t) }
    }

    fn as_raw(&self) -> *mut T {
        self.deref() as *const _ as *mut _
    }

    /// Move the value out of the owned box.
    pub fn into_inner(self) -> T {
        *self.data
    }
}

impl<T> Deref for Owned<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T> DerefMut for Owned<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

/// Like `&'a T`: a shared reference into a concurrent structure,
/// valid for lifetime `'a`.
pub struct Shared<'a, T: 'a> {
    data: &'a T,
}

impl<'a, T> Copy for Shared<'a, T> {}
impl<'a, T> Clone for Shared<'a, T> {
    fn clone(&self) -> Shared<'a, T> {
        *self
    }
}

impl<'a, T> PartialEq for Shared<'a, T> {
    fn eq(&self, other: &Self) -> bool {
        self.as_raw() == other.as_raw()
    }
}
impl<'a, T> Eq for Shared<'a, T> {}

impl<'a, T> Deref for Shared<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.data
    }
}

impl<'a, T> Shared<'a, T> {
    unsafe fn from_raw(raw: *mut T) -> Option<Shared<'a, T>> {
        if raw.is_null() {
            None
        } else {
            Some(Shared { data: &*raw })
        }
    }

    unsafe fn from_owned(owned: Owned<T>) -> Shared<'a, T> {
        let raw = owned.as_raw();
        mem::forget(owned);
        Shared { data: &*raw }
    }

    pub fn as_raw(&self) -> *mut T {
        self.data as *const _ as *mut _
    }

    /// Re-borrow the pointee for the full `'a` the `Shared` was
    /// created with, rather than the lifetime `Deref::deref` would
    /// give (which is tied to however long this particular `Shared`
    /// value's own binding happens to live).
    pub(crate) fn get(self) -> &'a T {
        self.data
    }
}

/// Like `std::sync::atomic::AtomicPtr`: atomic access to a nullable
/// pointer of type `T`, interfacing with [`Owned`] and [`Shared`].
pub struct Atomic<T> {
    ptr: atomic::AtomicPtr<T>,
    _marker: PhantomData<*const ()>,
}

unsafe impl<T: Sync> Send for Atomic<T> {}
unsafe impl<T: Sync> Sync for Atomic<T> {}

fn opt_shared_as_raw<T>(val: Option<Shared<T>>) -> *mut T {
    val.map(|p| p.as_raw()).unwrap_or(ptr::null_mut())
}

fn opt_owned_as_raw<T>(val: &Option<Owned<T>>) -> *mut T {
    val.as_ref().map(Owned::as_raw).unwrap_or(ptr::null_mut())
}

fn opt_owned_into_raw<T>(val: Option<Owned<T>>) -> *mut T {
    let raw = opt_owned_as_raw(&val);
    mem::forget(val);
    raw
}

impl<T> Atomic<T> {
    /// A new, null atomic pointer.
    pub const fn null() -> Atomic<T> {
        Atomic {
            ptr: atomic::AtomicPtr::new(ptr::null_mut()),
            _marker: PhantomData,
        }
    }

    /// Atomically load the pointer. The returned `Shared`, if any, is
    /// valid for the lifetime of `guard`.
    ///
    /// # Panics
    /// Panics if `ord` is `Release` or `AcqRel`.
    pub fn load<'a>(&self, ord: Ordering, _: &'a Guard) -> Option<Shared<'a, T>> {
        unsafe { Shared::from_raw(self.ptr.load(ord)) }
    }

    /// Atomically store `val`, taking ownership of it.
    ///
    /// # Panics
    /// Panics if `ord` is `Acquire` or `AcqRel`.
    pub fn store(&self, val: Option<Owned<T>>, ord: Ordering) {
        self.ptr.store(opt_owned_into_raw(val), ord)
    }

    /// Store `val` and immediately return a `Shared` to it.
    pub fn store_and_ref<'a>(
        &self,
        val: Owned<T>,
        ord: Ordering,
        _: &'a Guard,
    ) -> Shared<'a, T> {
        unsafe {
            let shared = Shared::from_owned(val);
            self.store_shared(Some(shared), ord);
            shared
        }
    }

    /// Atomically store a `Shared` pointer (no new lifetime information
    /// is produced, so no guard is required).
    pub fn store_shared(&self, val: Option<Shared<T>>, ord: Ordering) {
        self.ptr.store(opt_shared_as_raw(val), ord)
    }

    /// Compare-and-set from `old` to `new` (an `Owned`). Returns the
    /// rejected `Owned` on failure so the caller can retry without
    /// re-allocating.
    pub fn cas(
        &self,
        old: Option<Shared<T>>,
        new: Option<Owned<T>>,
        ord: Ordering,
    ) -> Result<(), Option<Owned<T>>> {
        let old_raw = opt_shared_as_raw(old);
        match self
            .ptr
            .compare_exchange(old_raw, opt_owned_as_raw(&new), ord, Relaxed)
        {
            Ok(_) => {
                mem::forget(new);
                Ok(())
            }
            Err(_) => Err(new),
        }
    }

    /// As [`cas`](Atomic::cas), immediately yielding a `Shared` to the
    /// newly published value on success.
    pub fn cas_and_ref<'a>(
        &self,
        old: Option<Shared<T>>,
        new: Owned<T>,
        ord: Ordering,
        _: &'a Guard,
    ) -> Result<Shared<'a, T>, Owned<T>> {
        let old_raw = opt_shared_as_raw(old);
        match self
            .ptr
            .compare_exchange(old_raw, new.as_raw(), ord, Relaxed)
        {
            Ok(_) => Ok(unsafe { Shared::from_owned(new) }),
            Err(_) => Err(new),
        }
    }

    /// Compare-and-set from one `Shared` to another. Returns `true` on
    /// success.
    pub fn cas_shared(&self, old: Option<Shared<T>>, new: Option<Shared<T>>, ord: Ordering) -> bool {
        self.ptr
            .compare_exchange(opt_shared_as_raw(old), opt_shared_as_raw(new), ord, Relaxed)
            .is_ok()
    }

    /// Atomic swap with an `Owned` pointer, returning the previous
    /// value as a `Shared`.
    pub fn swap<'a>(&self, new: Option<Owned<T>>, ord: Ordering, _: &'a Guard) -> Option<Shared<'a, T>> {
        unsafe { Shared::from_raw(self.ptr.swap(opt_owned_into_raw(new), ord)) }
    }

    /// Atomic swap with a `Shared` pointer.
    pub fn swap_shared<'a>(
        &self,
        new: Option<Shared<T>>,
        ord: Ordering,
        _: &'a Guard,
    ) -> Option<Shared<'a, T>> {
        unsafe { Shared::from_raw(self.ptr.swap(opt_shared_as_raw(new), ord)) }
    }
}

impl<T> Default for Atomic<T> {
    fn default() -> Atomic<T> {
        Atomic::null()
    }
}

/// An RAII guard that temporarily overrides whether the current
/// thread's GC runs, restoring the previous setting on drop.
#[must_use]
pub struct GcScope {
    previous: options::Options,
}

impl Drop for GcScope {
    fn drop(&mut self) {
        local::with_participant(|p| unsafe { *p.options.get() = self.previous });
    }
}

/// Run `f` with this thread's local/global GC flags both set to
/// `enabled`, restoring the previous setting afterwards. Useful for a
/// latency-sensitive section, or to delay reclamation deliberately.
pub fn with_gc_enabled<R>(enabled: bool, f: impl FnOnce() -> R) -> R {
    let previous = local::with_participant(|p| unsafe {
        let prev = *p.options.get();
        let mut next = prev;
        next.local_gc = enabled;
        next.global_gc = enabled;
        *p.options.get() = next;
        prev
    });
    let _scope = GcScope { previous };
    f()
}

/// An RAII guard for a pinned epoch.
///
/// Acquiring a guard is required before reading or publishing through
/// an `Atomic`. Dropping it unpins the epoch. Pinning is reentrant:
/// nested guards on the same thread reuse the outermost pin.
#[must_use]
pub struct Guard {
    /// `true` for guards obtained through `pin`/`pin_nogc`/`pin_waitfree`
    /// (which must call `Participant::exit` on drop); `false` for the
    /// bootstrap guard used only during participant-list enrollment,
    /// before a thread has registered its own `Participant`.
    pinned: bool,
    _marker: PhantomData<*mut ()>, // !Send and !Sync
}

const GC_THRESH: usize = 32;
const GC_MIGRATE_THRESH: usize = GC_THRESH * 4;

/// Pin the current epoch, running a garbage collection pass if the
/// local garbage count warrants it (and this thread's GC is enabled).
///
/// Pinning requires a full memory barrier on first (non-nested) entry,
/// so prefer pinning once around a batch of lock-free operations
/// rather than once per operation when possible.
#[inline]
pub fn pin() -> Guard {
    local::with_participant(|p| {
        p.enter();
        let guard = Guard {
            pinned: true,
            _marker: PhantomData,
        };
        let opts = unsafe { *p.options.get() };
        if opts.will_run_local_gc() && p.garbage_size() > opts.gc_threshold {
            p.try_collect(&guard);
        }
        guard
    })
}

/// Pin the current epoch without attempting a collection. Useful for
/// read-only operations, or anywhere a GC pause would be unwelcome;
/// still migrates garbage to the global chain once a lot has built up
/// locally.
#[inline]
pub fn pin_nogc() -> Guard {
    local::with_participant(|p| {
        p.enter();
        let guard = Guard {
            pinned: true,
            _marker: PhantomData,
        };
        if p.garbage_size() > GC_MIGRATE_THRESH {
            p.migrate_garbage();
        }
        guard
    })
}

/// Pin the current epoch without collecting or migrating garbage at
/// all. For call sites that must stay wait-free.
#[inline]
pub fn pin_waitfree() -> Guard {
    local::with_participant(|p| {
        p.enter();
        Guard {
            pinned: true,
            _marker: PhantomData,
        }
    })
}

impl Guard {
    /// Build a guard that does not correspond to a real pin. Only
    /// valid for the bootstrap path in [`participants::Participants::enroll`],
    /// where no `Participant` record yet exists to pin with, and the
    /// node being published cannot yet be observed as retirable.
    ///
    /// # Safety
    /// The caller must not use the returned guard to read through an
    /// `Atomic` whose pointee could be concurrently reclaimed, and
    /// must not call [`Guard::unlinked`] on anything but a just-enrolled,
    /// unreachable-until-now node.
    pub(crate) unsafe fn unpinned() -> Guard {
        Guard {
            pinned: false,
            _marker: PhantomData,
        }
    }

    /// Assert that `val` is no longer reachable from any shared
    /// structure, and should be reclaimed once every participant has
    /// moved past the current epoch.
    ///
    /// # Safety
    /// The caller must guarantee `val` has genuinely been unlinked and
    /// will never be dereferenced again through the structure.
    pub unsafe fn unlinked<T>(&self, val: Shared<T>) {
        local::with_participant(|p| p.retire(val.as_raw()))
    }

    /// Defer running `f` until every participant has moved past the
    /// current epoch. This is the building block for reclamation
    /// hooks — e.g. the Manber-Ladner BST's redundant-node cleanup —
    /// without the GC needing a dedicated hook registry.
    pub fn defer<F: FnOnce() + 'static>(&self, f: F) {
        local::with_participant(|p| unsafe { p.defer(f) })
    }

    /// Move this thread's garbage into the global chain.
    pub fn migrate_garbage(&self) {
        local::with_participant(|p| p.migrate_garbage());
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        if self.pinned {
            local::with_participant(|p| p.exit());
        }
    }
}

/// Force a collection attempt on the current thread right now,
/// regardless of the local garbage threshold. Returns `true` if the
/// global epoch advanced.
pub fn force_collect() -> bool {
    local::with_participant(|p| {
        let guard = pin_waitfree();
        p.try_collect(&guard)
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn no_premature_drop() {
        static mut DROPS: i32 = 0;
        struct Test;
        impl Drop for Test {
            fn drop(&mut self) {
                unsafe { DROPS += 1 };
            }
        }

        let g = pin();
        let x: Atomic<Test> = Atomic::null();
        x.store(Some(Owned::new(Test)), Ordering::Relaxed);
        x.store_and_ref(Owned::new(Test), Ordering::Relaxed, &g);
        let y = x.load(Ordering::Relaxed, &g);
        let z = x.cas_and_ref(y, Owned::new(Test), Ordering::Relaxed, &g).ok();
        let _ = x.cas(z, Some(Owned::new(Test)), Ordering::Relaxed);
        x.swap(Some(Owned::new(Test)), Ordering::Relaxed, &g);

        unsafe { assert_eq!(DROPS, 0) };
    }

    #[test]
    fn unlinked_node_is_eventually_reclaimed() {
        use std::sync::atomic::AtomicUsize;
        use std::sync::Arc;

        static DROPS: AtomicUsize = AtomicUsize::new(0);
        struct Counted;
        impl Drop for Counted {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::Relaxed);
            }
        }

        let x: Arc<Atomic<Counted>> = Arc::new(Atomic::null());
        {
            let g = pin();
            let shared = x.store_and_ref(Owned::new(Counted), Ordering::Relaxed, &g);
            unsafe { g.unlinked(shared) };
        }
        // Advance the epoch a few times so the retired node crosses
        // the two-epoch grace window.
        for _ in 0..8 {
            force_collect();
        }
        assert_eq!(DROPS.load(Ordering::Relaxed), 1);
    }
}
