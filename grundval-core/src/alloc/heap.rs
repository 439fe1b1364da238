//! ## grundval-core::alloc::heap
//! **Process heap adapter and the always-failing stub**

use std::alloc::Layout;
use std::ptr::NonNull;

use super::{dangling_for, Allocator};
use crate::error::AllocError;

/// Delegates to the process heap (`std::alloc`). Stateless and thread-safe;
/// every instance is interchangeable with every other.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MallocAllocator;

// SAFETY: the global allocator is callable from any thread.
unsafe impl Allocator for MallocAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        if layout.size() == 0 {
            return Ok(dangling_for(layout));
        }
        // SAFETY: non-zero size checked above.
        NonNull::new(unsafe { std::alloc::alloc(layout) })
            .ok_or_else(|| AllocError::out_of_memory("malloc", layout.size()))
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() != 0 {
            std::alloc::dealloc(ptr.as_ptr(), layout);
        }
    }

    fn is_thread_safe(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "malloc"
    }
}

/// Fails every allocation, zero-sized ones included. Install it to assert
/// that a code path does not allocate.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NullAllocator;

// SAFETY: stateless.
unsafe impl Allocator for NullAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        Err(AllocError::out_of_memory("null", layout.size()))
    }

    unsafe fn free(&self, _ptr: NonNull<u8>, _layout: Layout) {}

    fn is_thread_safe(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "null"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malloc_honours_alignment() {
        let heap = MallocAllocator;
        for align in [1, 8, 64, 4096] {
            let layout = Layout::from_size_align(24, align).unwrap();
            let ptr = heap.allocate(layout).unwrap();
            assert_eq!(ptr.as_ptr() as usize % align, 0);
            unsafe { heap.free(ptr, layout) };
        }
    }

    #[test]
    fn malloc_is_thread_safe_and_value_equal() {
        assert!(MallocAllocator.is_thread_safe());
        assert_eq!(MallocAllocator, MallocAllocator::default());
    }

    #[test]
    fn malloc_zero_sized_is_dangling_and_aligned() {
        let layout = Layout::from_size_align(0, 32).unwrap();
        let ptr = MallocAllocator.allocate(layout).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 32, 0);
        unsafe { MallocAllocator.free(ptr, layout) };
    }

    #[test]
    fn null_always_fails() {
        let layout = Layout::new::<u64>();
        assert!(matches!(
            NullAllocator.allocate(layout),
            Err(AllocError::OutOfMemory { .. })
        ));
        assert!(matches!(
            NullAllocator.allocate(Layout::new::<()>()),
            Err(AllocError::OutOfMemory { requested: 0, .. })
        ));
        assert_eq!(NullAllocator.name(), "null");
    }
}
