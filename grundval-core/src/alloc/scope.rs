//! ## grundval-core::alloc::scope
//! **Per-thread default and scratch allocator stacks**
//!
//! Each thread owns two independent LIFO stacks, lazily created empty on first
//! use. A thread becomes a root owner by calling [`install_root_allocators`];
//! the root entry can never be popped. Everything else goes through the guard
//! types, which push on creation and pop on drop, so the previous top is
//! restored on every exit path, unwinding included.

use std::cell::RefCell;
use std::marker::PhantomData;

use tracing::debug;

use super::AllocatorRef;
use crate::error::AllocError;

struct AllocatorStack {
    root: Option<AllocatorRef>,
    pushed: Vec<AllocatorRef>,
}

impl AllocatorStack {
    const fn new() -> Self {
        Self {
            root: None,
            pushed: Vec::new(),
        }
    }

    fn top(&self) -> Option<&AllocatorRef> {
        self.pushed.last().or(self.root.as_ref())
    }
}

thread_local! {
    static DEFAULT_STACK: RefCell<AllocatorStack> = const { RefCell::new(AllocatorStack::new()) };
    static SCRATCH_STACK: RefCell<AllocatorStack> = const { RefCell::new(AllocatorStack::new()) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StackKind {
    Default,
    Scratch,
}

impl StackKind {
    fn label(self) -> &'static str {
        match self {
            StackKind::Default => "default",
            StackKind::Scratch => "scratch",
        }
    }

    fn with<R>(self, f: impl FnOnce(&mut AllocatorStack) -> R) -> R {
        let key = match self {
            StackKind::Default => &DEFAULT_STACK,
            StackKind::Scratch => &SCRATCH_STACK,
        };
        key.with(|stack| f(&mut stack.borrow_mut()))
    }

    fn top(self) -> Result<AllocatorRef, AllocError> {
        self.with(|stack| stack.top().cloned())
            .ok_or(AllocError::NotInitialized(self.label()))
    }

    /// Pushes `allocator`, or a copy of the root when `None`. Returns the
    /// depth before the push.
    fn push(self, allocator: Option<AllocatorRef>) -> Result<usize, AllocError> {
        self.with(|stack| {
            let entry = match allocator {
                Some(a) => a,
                None => stack
                    .root
                    .clone()
                    .ok_or(AllocError::NotInitialized(self.label()))?,
            };
            let depth = stack.pushed.len();
            stack.pushed.push(entry);
            Ok(depth)
        })
    }

    fn pop_to(self, depth: usize) {
        // A guard dropped during thread teardown may outlive the stack.
        let _ = match self {
            StackKind::Default => &DEFAULT_STACK,
            StackKind::Scratch => &SCRATCH_STACK,
        }
        .try_with(|stack| stack.borrow_mut().pushed.truncate(depth));
    }
}

/// Designates the calling thread as a root owner: `default` and `scratch`
/// become the protected bottom entries of its stacks.
///
/// # Errors
///
/// `InvalidArgument` if this thread already has roots installed.
pub fn install_root_allocators(
    default: AllocatorRef,
    scratch: AllocatorRef,
) -> Result<(), AllocError> {
    let has_root = StackKind::Default.with(|s| s.root.is_some())
        || StackKind::Scratch.with(|s| s.root.is_some());
    if has_root {
        return Err(AllocError::invalid(
            "root allocators are already installed on this thread",
        ));
    }
    debug!(
        default = default.name(),
        scratch = scratch.name(),
        "Installing root allocators"
    );
    StackKind::Default.with(|s| s.root = Some(default));
    StackKind::Scratch.with(|s| s.root = Some(scratch));
    Ok(())
}

/// Top of the calling thread's default stack.
pub fn default_allocator() -> Result<AllocatorRef, AllocError> {
    StackKind::Default.top()
}

/// Top of the calling thread's scratch stack.
pub fn scratch_allocator() -> Result<AllocatorRef, AllocError> {
    StackKind::Scratch.top()
}

/// Number of guard-pushed entries as `(default, scratch)`; roots excluded.
pub fn scope_depth() -> (usize, usize) {
    (
        StackKind::Default.with(|s| s.pushed.len()),
        StackKind::Scratch.with(|s| s.pushed.len()),
    )
}

/// Pushes a default allocator for its lifetime.
#[must_use = "the allocator is popped as soon as the scope is dropped"]
pub struct DefaultAllocatorScope {
    depth: usize,
    _not_send: PhantomData<*const ()>,
}

impl DefaultAllocatorScope {
    /// Pushes `allocator`, or duplicates the thread's root when `None`.
    pub fn enter(allocator: Option<AllocatorRef>) -> Result<Self, AllocError> {
        Ok(Self {
            depth: StackKind::Default.push(allocator)?,
            _not_send: PhantomData,
        })
    }
}

impl Drop for DefaultAllocatorScope {
    fn drop(&mut self) {
        StackKind::Default.pop_to(self.depth);
    }
}

/// Pushes a scratch allocator for its lifetime.
#[must_use = "the allocator is popped as soon as the scope is dropped"]
pub struct ScratchAllocatorScope {
    depth: usize,
    _not_send: PhantomData<*const ()>,
}

impl ScratchAllocatorScope {
    /// Pushes `allocator`, or duplicates the thread's root when `None`.
    pub fn enter(allocator: Option<AllocatorRef>) -> Result<Self, AllocError> {
        Ok(Self {
            depth: StackKind::Scratch.push(allocator)?,
            _not_send: PhantomData,
        })
    }
}

impl Drop for ScratchAllocatorScope {
    fn drop(&mut self) {
        StackKind::Scratch.pop_to(self.depth);
    }
}
