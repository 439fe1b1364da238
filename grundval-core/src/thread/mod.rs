//! ## grundval-core::thread
//! **Thread creation, CPU topology and affinity**
//!
//! [`ThreadBuilder`] wraps `std::thread::Builder` with the runtime's own
//! concerns: an optional default allocator installed for the thread's whole
//! lifetime, and optional pinning to a logical core.
//!
//! ### Key Submodules:
//! - `pool/`: Fixed-size worker pool fed by an MPMC channel

use tracing::debug;

use crate::alloc::{AllocatorRef, DefaultAllocatorScope, ThreadSafeAllocator};
use crate::error::{panic_message, ThreadError};

pub mod pool;

pub use pool::{
    FunctionTask, PoolOptions, Task, TaskContext, TaskHandle, TaskState, ThreadPool,
};

/// Logical/physical core counts of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTopology {
    pub logical_cores: usize,
    pub physical_cores: usize,
}

impl CpuTopology {
    pub fn detect() -> Self {
        Self {
            logical_cores: num_cpus::get(),
            physical_cores: num_cpus::get_physical(),
        }
    }

    /// Whether simultaneous multithreading is active.
    pub fn has_smt(&self) -> bool {
        self.logical_cores > self.physical_cores
    }
}

/// Restricts the calling thread to logical core `core`.
pub fn pin_current_thread(core: usize) -> Result<(), ThreadError> {
    os::pin(core)?;
    debug!(core, "Pinned thread");
    Ok(())
}

/// Logical cores the calling thread may run on.
pub fn current_affinity() -> Result<Vec<usize>, ThreadError> {
    os::affinity()
}

#[cfg(target_os = "linux")]
mod os {
    use super::ThreadError;
    use std::mem;

    pub(super) fn pin(core: usize) -> Result<(), ThreadError> {
        if core >= libc::CPU_SETSIZE as usize {
            return Err(ThreadError::Affinity {
                core,
                reason: "beyond CPU_SETSIZE".to_owned(),
            });
        }
        // SAFETY: `cpu_set_t` is plain data; pid 0 targets the calling thread.
        let rc = unsafe {
            let mut set: libc::cpu_set_t = mem::zeroed();
            libc::CPU_ZERO(&mut set);
            libc::CPU_SET(core, &mut set);
            libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set)
        };
        if rc != 0 {
            return Err(ThreadError::Affinity {
                core,
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        Ok(())
    }

    pub(super) fn affinity() -> Result<Vec<usize>, ThreadError> {
        // SAFETY: as above.
        unsafe {
            let mut set: libc::cpu_set_t = mem::zeroed();
            if libc::sched_getaffinity(0, mem::size_of::<libc::cpu_set_t>(), &mut set) != 0 {
                return Err(ThreadError::AffinityQuery(std::io::Error::last_os_error()));
            }
            Ok((0..libc::CPU_SETSIZE as usize)
                .filter(|core| libc::CPU_ISSET(*core, &set))
                .collect())
        }
    }
}

#[cfg(windows)]
mod os {
    use super::ThreadError;
    use winapi::um::processthreadsapi::{GetCurrentProcess, GetCurrentThread};
    use winapi::um::winbase::{GetProcessAffinityMask, SetThreadAffinityMask};

    pub(super) fn pin(core: usize) -> Result<(), ThreadError> {
        if core >= usize::BITS as usize {
            return Err(ThreadError::Affinity {
                core,
                reason: "beyond the affinity mask width".to_owned(),
            });
        }
        // SAFETY: the pseudo-handle for the current thread is always valid.
        let previous = unsafe { SetThreadAffinityMask(GetCurrentThread(), 1 << core) };
        if previous == 0 {
            return Err(ThreadError::Affinity {
                core,
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        Ok(())
    }

    pub(super) fn affinity() -> Result<Vec<usize>, ThreadError> {
        let mut process = 0;
        let mut system = 0;
        // SAFETY: pseudo-handles are always valid; the masks are out-parameters.
        // Windows only reports a thread's mask when replacing it, so swap in
        // the process mask and immediately restore the original.
        let mask = unsafe {
            if GetProcessAffinityMask(GetCurrentProcess(), &mut process, &mut system) == 0 {
                return Err(ThreadError::AffinityQuery(std::io::Error::last_os_error()));
            }
            let mask = SetThreadAffinityMask(GetCurrentThread(), process);
            if mask == 0 {
                return Err(ThreadError::AffinityQuery(std::io::Error::last_os_error()));
            }
            SetThreadAffinityMask(GetCurrentThread(), mask);
            mask
        };
        Ok((0..usize::BITS as usize)
            .filter(|core| mask & (1 << core) != 0)
            .collect())
    }
}

#[cfg(not(any(target_os = "linux", windows)))]
mod os {
    use super::ThreadError;

    pub(super) fn pin(_core: usize) -> Result<(), ThreadError> {
        Err(ThreadError::Unsupported)
    }

    pub(super) fn affinity() -> Result<Vec<usize>, ThreadError> {
        Err(ThreadError::Unsupported)
    }
}

/// Thread factory.
///
/// ```rust,ignore
/// let handle = ThreadBuilder::new()
///     .name("io")
///     .default_allocator(heap.clone())
///     .spawn(|| Shared::new(42u32).map(|v| *v))?;
/// assert_eq!(handle.join()??, 42);
/// ```
#[derive(Default)]
pub struct ThreadBuilder {
    name: Option<String>,
    pin_to_core: Option<usize>,
    stack_size: Option<usize>,
    default_allocator: Option<AllocatorRef>,
}

impl ThreadBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Pins the thread to a logical core before running the closure. If
    /// pinning fails the closure does not run and `join` reports the error.
    pub fn pin_to_core(mut self, core: usize) -> Self {
        self.pin_to_core = Some(core);
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Installs `allocator` as the thread's default allocator for the whole
    /// closure. It must be thread-safe.
    pub fn default_allocator(mut self, allocator: AllocatorRef) -> Self {
        self.default_allocator = Some(allocator);
        self
    }

    pub fn spawn<F, R>(self, f: F) -> Result<JoinHandle<R>, ThreadError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let allocator = self
            .default_allocator
            .map(ThreadSafeAllocator::new)
            .transpose()?;
        let pin = self.pin_to_core;

        let mut builder = std::thread::Builder::new();
        if let Some(name) = &self.name {
            builder = builder.name(name.clone());
        }
        if let Some(bytes) = self.stack_size {
            builder = builder.stack_size(bytes);
        }

        let inner = builder.spawn(move || -> Result<R, ThreadError> {
            if let Some(core) = pin {
                pin_current_thread(core)?;
            }
            let _scope = allocator
                .map(|a| DefaultAllocatorScope::enter(Some(a.into_inner())))
                .transpose()?;
            Ok(f())
        })?;

        Ok(JoinHandle {
            inner,
            name: self.name.unwrap_or_else(|| "<unnamed>".to_owned()),
        })
    }
}

/// Owned permission to join a thread spawned by [`ThreadBuilder`].
pub struct JoinHandle<R> {
    inner: std::thread::JoinHandle<Result<R, ThreadError>>,
    name: String,
}

impl<R> JoinHandle<R> {
    /// Waits for the thread. A panic in the thread becomes
    /// [`ThreadError::Panicked`].
    pub fn join(self) -> Result<R, ThreadError> {
        match self.inner.join() {
            Ok(result) => result,
            Err(payload) => Err(ThreadError::Panicked {
                name: self.name,
                message: panic_message(&*payload),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    pub fn thread(&self) -> &std::thread::Thread {
        self.inner.thread()
    }
}

impl<R> std::fmt::Debug for JoinHandle<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinHandle")
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}
