//! ## grundval-core::alloc::region
//! **Reserved virtual address ranges with incremental commit**
//!
//! A region claims address space once and backs it with pages on demand.
//! Commitment only grows; pages are returned to the OS when the region drops.

use std::cell::Cell;
use std::ptr::NonNull;
use std::sync::OnceLock;

use tracing::debug;

use super::{align_up, checked_align_up};
use crate::error::AllocError;

/// Platform page size, queried once.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(os::page_size)
}

/// Granularity at which the platform places reservations (64 KiB on Windows,
/// the page size elsewhere).
pub fn allocation_granularity() -> usize {
    static GRANULARITY: OnceLock<usize> = OnceLock::new();
    *GRANULARITY.get_or_init(os::allocation_granularity)
}

/// A reserved range of virtual memory, committed from the bottom up.
///
/// Not thread-safe: commitment is tracked in a `Cell`.
pub struct VirtualRegion {
    base: NonNull<u8>,
    /// Bytes the caller asked for; the usable limit.
    reserved: usize,
    /// Length of the OS mapping, rounded to the allocation granularity.
    mapped: usize,
    committed: Cell<usize>,
    page_size: usize,
}

impl VirtualRegion {
    /// Reserves `bytes` of address space without backing it. The mapping
    /// itself is rounded up to the allocation granularity, but
    /// [`reserved`](Self::reserved) stays at `bytes`.
    pub fn reserve(bytes: usize) -> Result<Self, AllocError> {
        if bytes == 0 {
            return Err(AllocError::invalid("cannot reserve an empty region"));
        }
        let page_size = page_size();
        let mapped = checked_align_up(bytes, allocation_granularity())
            .ok_or_else(|| AllocError::invalid(format!("reserve size {bytes} overflows")))?;

        // SAFETY: plain anonymous reservation, no existing mapping is touched.
        let base = unsafe { os::reserve(mapped) }.ok_or_else(|| {
            AllocError::invalid(format!("platform refused to reserve {bytes} bytes"))
        })?;
        debug!(reserved = bytes, mapped, page_size, "Reserved virtual region");

        Ok(Self {
            base,
            reserved: bytes,
            mapped,
            committed: Cell::new(0),
            page_size,
        })
    }

    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    /// Highest commitment the region accepts: the reservation rounded up to
    /// whole pages.
    #[inline]
    pub fn commit_limit(&self) -> usize {
        align_up(self.reserved, self.page_size)
    }

    #[inline]
    pub fn committed(&self) -> usize {
        self.committed.get()
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Grows commitment so that at least `target` bytes from the base are
    /// usable. The target is rounded up to whole pages. Never shrinks.
    ///
    /// On failure the committed size is left untouched.
    pub fn commit_to(&self, target: usize) -> Result<(), AllocError> {
        let current = self.committed.get();
        if target <= current {
            return Ok(());
        }
        let target = checked_align_up(target, self.page_size)
            .filter(|t| *t <= self.commit_limit())
            .ok_or_else(|| AllocError::out_of_memory("virtual region", target - current))?;

        // SAFETY: [current, target) lies inside our own reservation.
        let ok = unsafe { os::commit(self.base.as_ptr().add(current), target - current) };
        if !ok {
            return Err(AllocError::out_of_memory("virtual region", target - current));
        }
        debug!(from = current, to = target, "Committed pages");
        self.committed.set(target);
        Ok(())
    }
}

// SAFETY: the region exclusively owns its mapping; moving it to another thread
// moves that ownership. `Cell` still keeps it `!Sync`.
unsafe impl Send for VirtualRegion {}

impl Drop for VirtualRegion {
    fn drop(&mut self) {
        // SAFETY: `base` / `mapped` describe the mapping created in `reserve`.
        unsafe { os::release(self.base, self.mapped) };
    }
}

impl std::fmt::Debug for VirtualRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualRegion")
            .field("base", &self.base)
            .field("reserved", &self.reserved)
            .field("mapped", &self.mapped)
            .field("committed", &self.committed.get())
            .finish()
    }
}

#[cfg(unix)]
mod os {
    use std::ptr::NonNull;

    pub(super) fn page_size() -> usize {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            4096
        }
    }

    pub(super) fn allocation_granularity() -> usize {
        page_size()
    }

    #[cfg(target_os = "linux")]
    const RESERVE_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
    #[cfg(not(target_os = "linux"))]
    const RESERVE_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON;

    pub(super) unsafe fn reserve(bytes: usize) -> Option<NonNull<u8>> {
        let ptr = libc::mmap(
            std::ptr::null_mut(),
            bytes,
            libc::PROT_NONE,
            RESERVE_FLAGS,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            return None;
        }
        NonNull::new(ptr.cast())
    }

    pub(super) unsafe fn commit(addr: *mut u8, bytes: usize) -> bool {
        libc::mprotect(addr.cast(), bytes, libc::PROT_READ | libc::PROT_WRITE) == 0
    }

    pub(super) unsafe fn release(base: NonNull<u8>, bytes: usize) {
        libc::munmap(base.as_ptr().cast(), bytes);
    }
}

#[cfg(windows)]
mod os {
    use std::ptr::NonNull;

    use winapi::um::memoryapi::{VirtualAlloc, VirtualFree};
    use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};
    use winapi::um::winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE};

    fn system_info() -> SYSTEM_INFO {
        // SAFETY: GetSystemInfo fills the whole struct.
        unsafe {
            let mut info: SYSTEM_INFO = std::mem::zeroed();
            GetSystemInfo(&mut info);
            info
        }
    }

    pub(super) fn page_size() -> usize {
        system_info().dwPageSize as usize
    }

    pub(super) fn allocation_granularity() -> usize {
        system_info().dwAllocationGranularity as usize
    }

    pub(super) unsafe fn reserve(bytes: usize) -> Option<NonNull<u8>> {
        NonNull::new(VirtualAlloc(std::ptr::null_mut(), bytes, MEM_RESERVE, PAGE_NOACCESS).cast())
    }

    pub(super) unsafe fn commit(addr: *mut u8, bytes: usize) -> bool {
        !VirtualAlloc(addr.cast(), bytes, MEM_COMMIT, PAGE_READWRITE).is_null()
    }

    pub(super) unsafe fn release(base: NonNull<u8>, _bytes: usize) {
        VirtualFree(base.as_ptr().cast(), 0, MEM_RELEASE);
    }
}

#[cfg(not(any(unix, windows)))]
mod os {
    use std::ptr::NonNull;

    pub(super) fn page_size() -> usize {
        4096
    }

    pub(super) fn allocation_granularity() -> usize {
        4096
    }

    pub(super) unsafe fn reserve(_bytes: usize) -> Option<NonNull<u8>> {
        None
    }

    pub(super) unsafe fn commit(_addr: *mut u8, _bytes: usize) -> bool {
        false
    }

    pub(super) unsafe fn release(_base: NonNull<u8>, _bytes: usize) {}
}
