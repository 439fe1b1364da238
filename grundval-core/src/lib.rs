//! # grundval-core
//!
//! Allocator framework and lock-free concurrency building blocks for
//! latency-sensitive native runtimes.
//!
//! Everything that needs memory asks an [`alloc::Allocator`] for it:
//! shared ownership, channel ring buffers and thread-pool tasks alike. The
//! allocator in charge is either passed explicitly or taken from the calling
//! thread's scope stack.
//!
//! ### Key Submodules:
//! - `alloc`: Allocator trait, reserve/commit, arena and heap allocators, thread-local scopes
//! - `shared`: Reference-counted ownership with a compile-time counter policy
//! - `channel`: Bounded SPSC/MPMC ring-buffer channels
//! - `thread`: Thread builder, CPU topology/affinity, worker pool
//!
//! ### Expectations:
//! - No locks on channel hot paths
//! - Failed allocations leave allocator state untouched

pub mod alloc;
pub mod channel;
pub mod error;
pub mod shared;
pub mod thread;

pub mod prelude {
    pub use crate::alloc::{
        default_allocator, install_root_allocators, scratch_allocator, Allocator, AllocatorRef,
        DefaultAllocatorScope, LinearAllocator, MallocAllocator, NullAllocator,
        ScratchAllocatorScope, SystemMemoryAllocator, ThreadSafeAllocator,
    };
    pub use crate::channel::{mpmc, spsc};
    pub use crate::error::*;
    pub use crate::make_shared_as;
    pub use crate::shared::{Atomic, PlainCounter, Shared};
    pub use crate::thread::{
        CpuTopology, PoolOptions, Task, TaskContext, TaskHandle, ThreadBuilder, ThreadPool,
    };
}
