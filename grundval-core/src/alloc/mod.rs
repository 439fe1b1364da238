//! ## grundval-core::alloc
//! **Polymorphic allocators and per-thread allocator scoping**
//!
//! Every other component (shared ownership, channel ring buffers, pool tasks)
//! requests memory through the [`Allocator`] trait, so the backing strategy is
//! chosen by the caller rather than hard-wired.
//!
//! ### Key Submodules:
//! - `region/`: Platform reserve/commit/release of virtual address space
//! - `system/`: Page-granular reserve/commit allocator
//! - `linear/`: Bump arena with mark/reset
//! - `heap/`: Process heap adapter and an always-failing stub
//! - `scope/`: Thread-local default/scratch allocator stacks
//! - `stats/`: Allocation counters

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::AllocError;

pub mod heap;
pub mod linear;
pub mod region;
pub mod scope;
pub mod stats;
pub mod system;

pub use heap::{MallocAllocator, NullAllocator};
pub use linear::{ArenaMark, LinearAllocator};
pub use scope::{
    default_allocator, install_root_allocators, scope_depth, scratch_allocator,
    DefaultAllocatorScope, ScratchAllocatorScope,
};
pub use stats::AllocatorStats;
pub use system::SystemMemoryAllocator;

/// Shared handle to a type-erased allocator.
pub type AllocatorRef = Arc<dyn Allocator>;

/// Memory allocation capability shared by all allocator variants.
///
/// # Safety
///
/// Implementors that return `true` from [`Allocator::is_thread_safe`] must be
/// sound to call concurrently from any number of threads through `&self`, and
/// sound to drop on a thread other than the one that created them. Consumers
/// (`Shared<_, Atomic>`, channels, thread creation) rely on this to move
/// allocator handles across threads.
///
/// `allocate` must return a pointer aligned to `layout.align()` that is valid
/// for `layout.size()` bytes until it is freed or the allocator is reset.
pub unsafe trait Allocator {
    /// Allocates a block described by `layout`.
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError>;

    /// Releases a block previously returned by `allocate` on the same instance.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this allocator with the same `layout`, and must not
    /// be used afterwards.
    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout);

    /// Static property: whether this instance may be shared between threads.
    fn is_thread_safe(&self) -> bool;

    /// Debug name.
    fn name(&self) -> &str;
}

/// An [`AllocatorRef`] verified to be thread-safe, and therefore movable
/// into other threads.
#[derive(Clone)]
pub struct ThreadSafeAllocator(AllocatorRef);

impl ThreadSafeAllocator {
    /// Fails with `InvalidArgument` unless `allocator.is_thread_safe()`.
    pub fn new(allocator: AllocatorRef) -> Result<Self, AllocError> {
        if !allocator.is_thread_safe() {
            return Err(AllocError::invalid(format!(
                "allocator `{}` is not thread-safe",
                allocator.name()
            )));
        }
        Ok(Self(allocator))
    }

    #[inline]
    pub fn get(&self) -> &AllocatorRef {
        &self.0
    }

    #[inline]
    pub fn into_inner(self) -> AllocatorRef {
        self.0
    }
}

// SAFETY: construction checked `is_thread_safe`, which the `Allocator`
// contract turns into a promise of concurrent use and cross-thread drop.
unsafe impl Send for ThreadSafeAllocator {}
unsafe impl Sync for ThreadSafeAllocator {}

impl std::fmt::Debug for ThreadSafeAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ThreadSafeAllocator")
            .field(&self.0.name())
            .finish()
    }
}

/// Rounds `value` up to the next multiple of `align` (a power of two).
#[inline(always)]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value.wrapping_add(align).wrapping_sub(1)) & !align.wrapping_sub(1)
}

/// Checked variant of [`align_up`].
#[inline]
pub(crate) fn checked_align_up(value: usize, align: usize) -> Option<usize> {
    Some(value.checked_add(align - 1)? & !(align - 1))
}

/// Well-aligned non-null pointer for zero-sized blocks.
#[inline]
pub(crate) fn dangling_for(layout: Layout) -> NonNull<u8> {
    // Alignment is non-zero, so the address is too.
    NonNull::new(layout.align() as *mut u8).unwrap_or(NonNull::dangling())
}

/// Allocates raw storage from `allocator` and moves `value` into it.
///
/// Fails with `InvalidArgument` when no allocator is supplied.
pub fn new_in<T>(allocator: Option<&dyn Allocator>, value: T) -> Result<NonNull<T>, AllocError> {
    let allocator = allocator.ok_or_else(|| AllocError::invalid("new_in called without an allocator"))?;
    let raw = allocator.allocate(Layout::new::<T>())?.cast::<T>();
    // SAFETY: freshly allocated, properly sized and aligned for `T`.
    unsafe { raw.as_ptr().write(value) };
    Ok(raw)
}

/// Drops the value behind `ptr` in place, then returns its storage to `allocator`.
///
/// # Safety
///
/// `ptr` must have been produced by [`new_in`] (or an equivalent allocation
/// of `Layout::for_value(&*ptr)`) on the same allocator, and must not be used
/// afterwards.
pub unsafe fn delete_in<T: ?Sized>(
    allocator: Option<&dyn Allocator>,
    ptr: NonNull<T>,
) -> Result<(), AllocError> {
    let allocator =
        allocator.ok_or_else(|| AllocError::invalid("delete_in called without an allocator"))?;
    destroy_in(allocator, ptr);
    Ok(())
}

/// [`delete_in`] for callers that already hold an allocator.
///
/// # Safety
///
/// Same contract as [`delete_in`].
pub(crate) unsafe fn destroy_in<T: ?Sized>(allocator: &dyn Allocator, ptr: NonNull<T>) {
    let layout = Layout::for_value(ptr.as_ref());
    std::ptr::drop_in_place(ptr.as_ptr());
    allocator.free(ptr.cast(), layout);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(9, 8), 16);
        assert_eq!(align_up(4097, 4096), 8192);
    }

    #[test]
    fn checked_align_up_detects_overflow() {
        assert_eq!(checked_align_up(usize::MAX, 16), None);
        assert_eq!(checked_align_up(17, 16), Some(32));
    }

    #[test]
    fn new_in_requires_an_allocator() {
        assert!(matches!(
            new_in(None, 5u32),
            Err(AllocError::InvalidArgument(_))
        ));
    }

    #[test]
    fn new_and_delete_round_trip_runs_drop() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);
        struct Tracked(u64);
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let heap = MallocAllocator;
        let ptr = new_in(Some(&heap), Tracked(7)).unwrap();
        assert_eq!(unsafe { ptr.as_ref() }.0, 7);
        assert_eq!(ptr.as_ptr() as usize % std::mem::align_of::<Tracked>(), 0);

        unsafe { delete_in(Some(&heap), ptr).unwrap() };
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn thread_safe_wrapper_checks_the_allocator() {
        let heap: AllocatorRef = Arc::new(MallocAllocator);
        let wrapped = ThreadSafeAllocator::new(heap).unwrap();
        assert_eq!(wrapped.get().name(), "malloc");

        let arena: AllocatorRef = Arc::new(LinearAllocator::new(64).unwrap());
        assert!(matches!(
            ThreadSafeAllocator::new(arena),
            Err(AllocError::InvalidArgument(_))
        ));
    }

    #[test]
    fn new_in_propagates_out_of_memory() {
        let null = NullAllocator;
        assert!(matches!(
            new_in(Some(&null), [0u8; 64]),
            Err(AllocError::OutOfMemory { .. })
        ));
    }
}
