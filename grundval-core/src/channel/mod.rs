//! ## grundval-core::channel
//! **Bounded lock-free ring-buffer channels**
//!
//! Both flavours split into a transmitter and a receiver that share one ring
//! through [`Shared`](crate::shared::Shared), so either side may outlive the
//! other. Capacities are rounded up to a power of two and slot storage comes
//! from the caller's allocator.
//!
//! ### Key Submodules:
//! - `mpmc/`: Ticket/turn ring, cloneable handles
//! - `spsc/`: Two-counter ring, move-only handles
//!
//! Blocking operations spin (with backoff); use the `try_*` variants to apply
//! your own wait strategy.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::AtomicUsize;

use crate::alloc::AllocatorRef;
use crate::error::AllocError;

pub mod mpmc;
pub mod spsc;

/// Cache-line aligned atomic counter to prevent false sharing.
#[repr(align(64))]
pub(crate) struct AlignedCounter(pub(crate) AtomicUsize);

impl AlignedCounter {
    #[inline]
    pub(crate) const fn new(value: usize) -> Self {
        Self(AtomicUsize::new(value))
    }
}

/// Rounds a requested capacity up to the ring size actually used.
pub fn ring_capacity(requested: usize) -> Result<usize, AllocError> {
    if requested == 0 {
        return Err(AllocError::invalid("channel capacity must be non-zero"));
    }
    requested
        .checked_next_power_of_two()
        .ok_or_else(|| AllocError::invalid(format!("channel capacity {requested} is too large")))
}

/// Fixed array of ring slots allocated through an [`Allocator`](crate::alloc::Allocator).
pub(crate) struct RawSlots<S> {
    ptr: NonNull<S>,
    len: usize,
    allocator: AllocatorRef,
}

impl<S> RawSlots<S> {
    pub(crate) fn new(
        len: usize,
        allocator: &AllocatorRef,
        mut init: impl FnMut(usize) -> S,
    ) -> Result<Self, AllocError> {
        if !allocator.is_thread_safe() {
            return Err(AllocError::invalid(format!(
                "channels need a thread-safe allocator, `{}` is not",
                allocator.name()
            )));
        }
        let layout = Self::layout(len)?;
        let ptr = allocator.allocate(layout)?.cast::<S>();
        for i in 0..len {
            // SAFETY: `i < len`, inside the block just allocated for `len` slots.
            unsafe { ptr.as_ptr().add(i).write(init(i)) };
        }
        Ok(Self {
            ptr,
            len,
            allocator: allocator.clone(),
        })
    }

    fn layout(len: usize) -> Result<Layout, AllocError> {
        Layout::array::<S>(len)
            .map_err(|e| AllocError::invalid(format!("{len} channel slots: {e}")))
    }

    #[inline]
    pub(crate) fn get(&self, index: usize) -> &S {
        debug_assert!(index < self.len);
        // SAFETY: callers mask indices into `0..len`; every slot was initialized in `new`.
        unsafe { &*self.ptr.as_ptr().add(index) }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn allocator(&self) -> &AllocatorRef {
        &self.allocator
    }
}

impl<S> Drop for RawSlots<S> {
    fn drop(&mut self) {
        // SAFETY: slots were initialized in `new` and the block came from this
        // allocator with this layout (already validated once).
        unsafe {
            std::ptr::drop_in_place(std::ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.len,
            ));
            if let Ok(layout) = Self::layout(self.len) {
                self.allocator.free(self.ptr.cast(), layout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        assert_eq!(ring_capacity(1).unwrap(), 1);
        assert_eq!(ring_capacity(5).unwrap(), 8);
        assert_eq!(ring_capacity(8).unwrap(), 8);
        assert_eq!(ring_capacity(1000).unwrap(), 1024);
    }

    #[test]
    fn rejects_zero_and_overflowing_capacity() {
        assert!(matches!(ring_capacity(0), Err(AllocError::InvalidArgument(_))));
        assert!(matches!(
            ring_capacity(usize::MAX),
            Err(AllocError::InvalidArgument(_))
        ));
    }

    #[test]
    fn counters_sit_on_their_own_cache_line() {
        assert_eq!(std::mem::align_of::<AlignedCounter>(), 64);
    }
}
