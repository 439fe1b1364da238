//! ## grundval-core::alloc::stats
//! **Allocation counters**
//!
//! Relaxed atomics so the counters can be read from a diagnostics thread while
//! the owning thread keeps allocating.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Live counters embedded in an allocator.
#[derive(Debug, Default)]
pub(crate) struct AllocationCounters {
    allocations: AtomicUsize,
    failed_allocations: AtomicUsize,
    bytes_allocated: AtomicUsize,
    resets: AtomicUsize,
    commits: AtomicUsize,
}

impl AllocationCounters {
    #[inline]
    pub(crate) fn record_allocation(&self, bytes: usize) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.bytes_allocated.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_failure(&self) {
        self.failed_allocations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_reset(&self) {
        self.resets.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> AllocatorStats {
        AllocatorStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            failed_allocations: self.failed_allocations.load(Ordering::Relaxed),
            bytes_allocated: self.bytes_allocated.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of an allocator's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub allocations: usize,
    pub failed_allocations: usize,
    /// Requested bytes, excluding alignment padding.
    pub bytes_allocated: usize,
    pub resets: usize,
    /// Number of commit growth steps, including explicit `commit` calls.
    pub commits: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let counters = AllocationCounters::default();
        assert_eq!(counters.snapshot(), AllocatorStats::default());
    }

    #[test]
    fn counters_accumulate() {
        let counters = AllocationCounters::default();
        for _ in 0..100 {
            counters.record_allocation(16);
            counters.record_failure();
            counters.record_reset();
            counters.record_commit();
        }

        let stats = counters.snapshot();
        assert_eq!(stats.allocations, 100);
        assert_eq!(stats.bytes_allocated, 1600);
        assert_eq!(stats.failed_allocations, 100);
        assert_eq!(stats.resets, 100);
        assert_eq!(stats.commits, 100);
    }
}
