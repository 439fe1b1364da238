//! ## grundval-core::alloc::linear
//! **Bump arena with mark/reset**
//!
//! Arena allocators are efficient for allocating many objects with a limited
//! lifetime: individual frees are no-ops and the whole arena (or everything
//! after a [`ArenaMark`]) is released at once.

use std::alloc::Layout;
use std::cell::Cell;
use std::ptr::NonNull;

use super::region::VirtualRegion;
use super::stats::{AllocationCounters, AllocatorStats};
use super::{checked_align_up, dangling_for, Allocator};
use crate::error::AllocError;

/// Alignment of heap-backed arena buffers.
const BUFFER_ALIGN: usize = 64;

enum Backing {
    /// Fixed buffer from the process heap.
    Buffer { ptr: NonNull<u8>, layout: Layout },
    /// Reserved range committed on demand.
    Region {
        region: VirtualRegion,
        commit_step: usize,
    },
}

impl Backing {
    fn base(&self) -> NonNull<u8> {
        match self {
            Backing::Buffer { ptr, .. } => *ptr,
            Backing::Region { region, .. } => region.base(),
        }
    }
}

/// Offset captured by [`LinearAllocator::mark`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ArenaMark(usize);

impl ArenaMark {
    #[inline]
    pub fn offset(self) -> usize {
        self.0
    }
}

/// A bump-pointer arena allocator.
///
/// # Thread Safety
///
/// This arena is NOT thread-safe. Use one arena per thread.
///
/// # Example
///
/// ```rust,ignore
/// let arena = LinearAllocator::new(1024 * 1024)?;
/// let mark = arena.mark();
/// let block = arena.allocate(Layout::new::<[f32; 256]>())?;
/// arena.reset_to(mark)?; // `block` must not be used past this point
/// ```
pub struct LinearAllocator {
    name: String,
    backing: Backing,
    capacity: usize,
    offset: Cell<usize>,
    counters: AllocationCounters,
}

impl LinearAllocator {
    /// Creates an arena over a fixed heap buffer of `capacity` bytes.
    pub fn new(capacity: usize) -> Result<Self, AllocError> {
        if capacity == 0 {
            return Err(AllocError::invalid("arena capacity must be non-zero"));
        }
        let layout = Layout::from_size_align(capacity, BUFFER_ALIGN)
            .map_err(|e| AllocError::invalid(format!("arena capacity {capacity}: {e}")))?;
        // SAFETY: layout has a non-zero size.
        let ptr = NonNull::new(unsafe { std::alloc::alloc(layout) })
            .ok_or_else(|| AllocError::out_of_memory("process heap", capacity))?;

        Ok(Self::with_backing(Backing::Buffer { ptr, layout }, capacity))
    }

    /// Creates an arena over `reserve_bytes` of reserved address space,
    /// committing `commit_step_bytes` at a time as the arena fills.
    pub fn reserved(reserve_bytes: usize, commit_step_bytes: usize) -> Result<Self, AllocError> {
        let region = VirtualRegion::reserve(reserve_bytes)?;
        let capacity = region.reserved();
        Ok(Self::with_backing(
            Backing::Region {
                region,
                commit_step: commit_step_bytes,
            },
            capacity,
        ))
    }

    fn with_backing(backing: Backing, capacity: usize) -> Self {
        Self {
            name: "linear".to_owned(),
            backing,
            capacity,
            offset: Cell::new(0),
            counters: AllocationCounters::default(),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Total capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes consumed so far, including alignment padding.
    #[inline]
    pub fn used(&self) -> usize {
        self.offset.get()
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity - self.used()
    }

    pub fn stats(&self) -> AllocatorStats {
        self.counters.snapshot()
    }

    /// Captures the current offset.
    #[inline]
    pub fn mark(&self) -> ArenaMark {
        ArenaMark(self.offset.get())
    }

    /// Rewinds to `mark`, releasing everything allocated after it.
    ///
    /// Callers promise not to touch blocks allocated after the mark.
    pub fn reset_to(&self, mark: ArenaMark) -> Result<(), AllocError> {
        if mark.0 > self.offset.get() {
            return Err(AllocError::invalid(format!(
                "mark {} is ahead of the arena offset {}",
                mark.0,
                self.offset.get()
            )));
        }
        self.offset.set(mark.0);
        self.counters.record_reset();
        Ok(())
    }

    /// Resets the arena, invalidating all previous allocations.
    ///
    /// This is a **zero-cost** operation - no memory is freed or decommitted.
    #[inline]
    pub fn reset(&self) {
        self.offset.set(0);
        self.counters.record_reset();
    }

    /// Returns a guard that rewinds the arena to the current mark when dropped.
    pub fn scope(&self) -> ArenaScope<'_> {
        ArenaScope {
            arena: self,
            mark: self.mark(),
        }
    }

    fn ensure_committed(&self, end: usize) -> Result<(), AllocError> {
        if let Backing::Region {
            region,
            commit_step,
        } = &self.backing
        {
            let committed = region.committed();
            if end > committed {
                let needed = end - committed;
                let target = checked_align_up((*commit_step).max(needed), region.page_size())
                    .and_then(|growth| committed.checked_add(growth))
                    .filter(|t| *t <= region.commit_limit())
                    .ok_or_else(|| AllocError::out_of_memory(&self.name, needed))?;
                region
                    .commit_to(target)
                    .map_err(|_| AllocError::out_of_memory(&self.name, needed))?;
                self.counters.record_commit();
            }
        }
        Ok(())
    }
}

// SAFETY: never reports itself as thread-safe; blocks stay valid until reset/drop.
unsafe impl Allocator for LinearAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        if layout.size() == 0 {
            return Ok(dangling_for(layout));
        }

        let base = self.backing.base().as_ptr() as usize;
        let start = checked_align_up(base + self.offset.get(), layout.align()).map(|a| a - base);
        let end = start.and_then(|s| s.checked_add(layout.size()));

        let (start, end) = match (start, end) {
            (Some(start), Some(end)) if end <= self.capacity => (start, end),
            _ => {
                self.counters.record_failure();
                return Err(AllocError::out_of_memory(&self.name, layout.size()));
            }
        };
        if let Err(e) = self.ensure_committed(end) {
            self.counters.record_failure();
            return Err(e);
        }

        self.offset.set(end);
        self.counters.record_allocation(layout.size());
        // SAFETY: start < capacity, inside the backing block.
        Ok(unsafe { NonNull::new_unchecked(self.backing.base().as_ptr().add(start)) })
    }

    unsafe fn free(&self, _ptr: NonNull<u8>, _layout: Layout) {}

    fn is_thread_safe(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LinearAllocator {
    fn drop(&mut self) {
        if let Backing::Buffer { ptr, layout } = &self.backing {
            // SAFETY: allocated in `new` with exactly this layout.
            unsafe { std::alloc::dealloc(ptr.as_ptr(), *layout) };
        }
    }
}

impl std::fmt::Debug for LinearAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinearAllocator")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("used", &self.used())
            .finish()
    }
}

/// Rewinds its arena to the mark taken at creation.
pub struct ArenaScope<'a> {
    arena: &'a LinearAllocator,
    mark: ArenaMark,
}

impl Drop for ArenaScope<'_> {
    fn drop(&mut self) {
        // Fails only if the arena was already rewound below the mark, in
        // which case there is nothing left to release.
        let _ = self.arena.reset_to(self.mark);
    }
}
