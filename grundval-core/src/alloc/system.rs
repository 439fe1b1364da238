//! ## grundval-core::alloc::system
//! **Reserve once, commit on demand**
//!
//! A single large address range is reserved up front and backed with pages in
//! `commit_step` increments as the bump offset advances. Blocks are handed out
//! at page granularity; put a [`LinearAllocator`](super::LinearAllocator) on
//! top for small objects.

use std::alloc::Layout;
use std::cell::Cell;
use std::ptr::NonNull;

use tracing::{debug, info};

use super::region::VirtualRegion;
use super::stats::{AllocationCounters, AllocatorStats};
use super::{checked_align_up, dangling_for, Allocator};
use crate::error::AllocError;

/// Page-granular bump allocator over a reserved virtual range.
///
/// # Thread Safety
///
/// NOT thread-safe. Use one instance per thread.
pub struct SystemMemoryAllocator {
    name: String,
    region: VirtualRegion,
    offset: Cell<usize>,
    commit_step: usize,
    counters: AllocationCounters,
}

impl SystemMemoryAllocator {
    /// Reserves `reserve_bytes` and commits the first `initial_commit_bytes`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `reserve_bytes` is zero, if the initial commit
    /// exceeds the reservation, or if the platform refuses the reservation.
    pub fn new(
        reserve_bytes: usize,
        initial_commit_bytes: usize,
        commit_step_bytes: usize,
    ) -> Result<Self, AllocError> {
        if reserve_bytes == 0 {
            return Err(AllocError::invalid("reserve size must be non-zero"));
        }
        if initial_commit_bytes > reserve_bytes {
            return Err(AllocError::invalid(format!(
                "initial commit {initial_commit_bytes} exceeds reserve {reserve_bytes}"
            )));
        }

        let region = VirtualRegion::reserve(reserve_bytes)?;
        region.commit_to(initial_commit_bytes)?;
        info!(
            reserve = region.reserved(),
            committed = region.committed(),
            commit_step = commit_step_bytes,
            "System memory allocator ready"
        );

        Ok(Self {
            name: "system".to_owned(),
            region,
            offset: Cell::new(0),
            commit_step: commit_step_bytes,
            counters: AllocationCounters::default(),
        })
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[inline]
    pub fn reserved_size(&self) -> usize {
        self.region.reserved()
    }

    #[inline]
    pub fn committed_size(&self) -> usize {
        self.region.committed()
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset.get()
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.region.page_size()
    }

    pub fn stats(&self) -> AllocatorStats {
        self.counters.snapshot()
    }

    /// Commits `extra_bytes` (page-rounded) beyond the current commitment.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if that would pass the reservation; nothing is committed.
    pub fn commit(&self, extra_bytes: usize) -> Result<(), AllocError> {
        self.grow_by(extra_bytes, extra_bytes)
    }

    /// Commits `growth` rounded up to whole pages, or fails without touching
    /// the region when the result would pass the reservation.
    fn grow_by(&self, growth: usize, requested: usize) -> Result<(), AllocError> {
        let committed = self.committed_size();
        let target = checked_align_up(growth, self.page_size())
            .and_then(|growth| committed.checked_add(growth))
            .filter(|t| *t <= self.region.commit_limit())
            .ok_or_else(|| AllocError::out_of_memory(&self.name, requested))?;
        self.region
            .commit_to(target)
            .map_err(|_| AllocError::out_of_memory(&self.name, requested))?;
        self.counters.record_commit();
        Ok(())
    }

    /// Rewinds the bump offset to the start of the region.
    ///
    /// Pages stay committed, so the next allocations reuse the same memory.
    pub fn reset(&self) {
        self.offset.set(0);
        self.counters.record_reset();
    }

    /// Makes sure `[0, end)` is committed, growing by
    /// `max(commit_step, end - committed)`.
    fn ensure_committed(&self, end: usize) -> Result<(), AllocError> {
        let committed = self.committed_size();
        if end <= committed {
            return Ok(());
        }
        let needed = end - committed;
        self.grow_by(self.commit_step.max(needed), needed)?;
        debug!(committed = self.committed_size(), "System allocator grew commitment");
        Ok(())
    }
}

// SAFETY: never reports itself as thread-safe; blocks stay valid until reset/drop.
unsafe impl Allocator for SystemMemoryAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        if layout.size() == 0 {
            return Ok(dangling_for(layout));
        }

        let base = self.region.base().as_ptr() as usize;
        let align = layout.align().max(self.page_size());
        let start = base
            .checked_add(self.offset.get())
            .and_then(|addr| checked_align_up(addr, align))
            .map(|addr| addr - base);
        let end = start.and_then(|start| start.checked_add(layout.size()));

        let (start, end) = match (start, end) {
            (Some(start), Some(end)) if end <= self.reserved_size() => (start, end),
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
        // SAFETY: start < reserved, so the address is inside our mapping.
        Ok(unsafe { NonNull::new_unchecked(self.region.base().as_ptr().add(start)) })
    }

    unsafe fn free(&self, _ptr: NonNull<u8>, _layout: Layout) {}

    fn is_thread_safe(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for SystemMemoryAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemMemoryAllocator")
            .field("name", &self.name)
            .field("reserved", &self.reserved_size())
            .field("committed", &self.committed_size())
            .field("offset", &self.offset.get())
            .finish()
    }
}
