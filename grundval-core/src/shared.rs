//! ## grundval-core::shared
//! **Reference-counted shared ownership over an explicit allocator**
//!
//! `Shared<T, P>` owns a `T` and its reference count, both allocated from the
//! allocator captured at construction and returned to it when the last handle
//! goes away. The counter strategy is chosen at compile time:
//!
//! - [`Atomic`]: atomic count, handles are `Send + Sync`; the allocator must
//!   report itself thread-safe.
//! - [`PlainCounter`]: `Cell` count, handles stay on their thread; any
//!   allocator will do.
//!
//! A handle may be *invalid* (owns nothing); see [`Shared::default`] and
//! [`Shared::take`].

use std::cell::Cell;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{self, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::alloc::{default_allocator, destroy_in, new_in, AllocatorRef};
use crate::error::AllocError;

mod sealed {
    pub trait Sealed {}
}

/// Compile-time reference counting strategy.
pub trait CounterPolicy: sealed::Sealed + 'static {
    type Counter;

    /// Whether the captured allocator must report `is_thread_safe()`.
    const REQUIRES_THREAD_SAFE_ALLOCATOR: bool;

    /// A counter holding 1.
    fn new_counter() -> Self::Counter;

    fn increment(counter: &Self::Counter);

    /// Decrements and returns the value held before the decrement.
    fn decrement(counter: &Self::Counter) -> usize;

    fn load(counter: &Self::Counter) -> usize;
}

/// Atomic reference count.
#[derive(Debug, Clone, Copy)]
pub struct Atomic;

/// Non-atomic reference count for single-threaded sharing.
#[derive(Debug, Clone, Copy)]
pub struct PlainCounter;

impl sealed::Sealed for Atomic {}
impl sealed::Sealed for PlainCounter {}

const MAX_REFCOUNT: usize = isize::MAX as usize;

impl CounterPolicy for Atomic {
    type Counter = AtomicUsize;

    const REQUIRES_THREAD_SAFE_ALLOCATOR: bool = true;

    #[inline]
    fn new_counter() -> AtomicUsize {
        AtomicUsize::new(1)
    }

    #[inline]
    fn increment(counter: &AtomicUsize) {
        // A new handle can only be made from an existing one, which already
        // orders it after construction.
        if counter.fetch_add(1, Ordering::Relaxed) > MAX_REFCOUNT {
            std::process::abort();
        }
    }

    #[inline]
    fn decrement(counter: &AtomicUsize) -> usize {
        let previous = counter.fetch_sub(1, Ordering::Release);
        if previous == 1 {
            // Synchronize with every earlier release so the destroying thread
            // sees all accesses made through other handles.
            atomic::fence(Ordering::Acquire);
        }
        previous
    }

    #[inline]
    fn load(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::Acquire)
    }
}

impl CounterPolicy for PlainCounter {
    type Counter = Cell<usize>;

    const REQUIRES_THREAD_SAFE_ALLOCATOR: bool = false;

    #[inline]
    fn new_counter() -> Cell<usize> {
        Cell::new(1)
    }

    #[inline]
    fn increment(counter: &Cell<usize>) {
        counter.set(counter.get() + 1);
    }

    #[inline]
    fn decrement(counter: &Cell<usize>) -> usize {
        let previous = counter.get();
        counter.set(previous - 1);
        previous
    }

    #[inline]
    fn load(counter: &Cell<usize>) -> usize {
        counter.get()
    }
}

struct Inner<T: ?Sized, P: CounterPolicy> {
    object: NonNull<T>,
    count: NonNull<P::Counter>,
    allocator: AllocatorRef,
}

/// Shared ownership of a `T` allocated through an [`Allocator`](crate::alloc::Allocator).
pub struct Shared<T: ?Sized, P: CounterPolicy = Atomic> {
    inner: Option<Inner<T, P>>,
    _owns: PhantomData<T>,
}

impl<T, P: CounterPolicy> Shared<T, P> {
    /// Allocates `value` from the calling thread's default allocator.
    pub fn new(value: T) -> Result<Self, AllocError> {
        let allocator = default_allocator()?;
        Self::new_in(&allocator, value)
    }

    /// Allocates `value` and its count from `allocator`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the policy is [`Atomic`] and the allocator is
    /// not thread-safe; any allocation failure of `allocator`.
    pub fn new_in(allocator: &AllocatorRef, value: T) -> Result<Self, AllocError> {
        // SAFETY: identity conversion.
        unsafe { Self::new_coerced(allocator, value, |p| p) }
    }
}

impl<T: ?Sized, P: CounterPolicy> Shared<T, P> {
    /// Allocates a concrete `value` and hands ownership back typed as `T`,
    /// usually a trait object. Prefer [`make_shared_as!`](crate::make_shared_as).
    ///
    /// # Safety
    ///
    /// `coerce` must be a pure pointer conversion (an unsizing cast) of the
    /// pointer it receives: same address, metadata valid for the pointee.
    pub unsafe fn new_coerced<U>(
        allocator: &AllocatorRef,
        value: U,
        coerce: impl FnOnce(*mut U) -> *mut T,
    ) -> Result<Self, AllocError> {
        if P::REQUIRES_THREAD_SAFE_ALLOCATOR && !allocator.is_thread_safe() {
            return Err(AllocError::invalid(format!(
                "atomic shared ownership needs a thread-safe allocator, `{}` is not",
                allocator.name()
            )));
        }

        let object = new_in(Some(&**allocator), value)?;
        let count = match new_in(Some(&**allocator), P::new_counter()) {
            Ok(count) => count,
            Err(e) => {
                destroy_in(&**allocator, object);
                return Err(e);
            }
        };

        Ok(Self {
            inner: Some(Inner {
                object: NonNull::new_unchecked(coerce(object.as_ptr())),
                count,
                allocator: Arc::clone(allocator),
            }),
            _owns: PhantomData,
        })
    }

    /// A handle that owns nothing.
    #[inline]
    pub const fn invalid() -> Self {
        Self {
            inner: None,
            _owns: PhantomData,
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.inner.is_some()
    }

    #[inline]
    pub fn get(&self) -> Option<&T> {
        // SAFETY: the object lives as long as any handle points at it.
        self.inner.as_ref().map(|inner| unsafe { inner.object.as_ref() })
    }

    /// Number of handles sharing the object; 0 for an invalid handle.
    pub fn use_count(&self) -> usize {
        self.inner
            .as_ref()
            // SAFETY: the count outlives every handle.
            .map_or(0, |inner| P::load(unsafe { inner.count.as_ref() }))
    }

    /// The allocator the object was allocated from.
    pub fn allocator(&self) -> Option<&AllocatorRef> {
        self.inner.as_ref().map(|inner| &inner.allocator)
    }

    /// Moves ownership out, leaving `self` invalid. The count is untouched.
    #[inline]
    pub fn take(&mut self) -> Self {
        Self {
            inner: self.inner.take(),
            _owns: PhantomData,
        }
    }

    /// Releases this handle's share. The object is destroyed and both blocks
    /// are freed when this was the last handle.
    pub fn reset(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        // SAFETY: our share keeps the count alive until this decrement.
        let previous = P::decrement(unsafe { inner.count.as_ref() });
        if previous == 1 {
            // SAFETY: we were the last handle; nothing else can reach either block.
            unsafe {
                destroy_in(&*inner.allocator, inner.object);
                destroy_in(&*inner.allocator, inner.count);
            }
        }
    }

    /// Whether both handles manage the same object (two invalid handles compare equal).
    #[inline]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.addr() == b.addr()
    }

    fn addr(&self) -> Option<*const u8> {
        self.inner
            .as_ref()
            .map(|inner| inner.object.as_ptr() as *const u8)
    }
}

impl<T: ?Sized, P: CounterPolicy> Clone for Shared<T, P> {
    fn clone(&self) -> Self {
        let Some(inner) = &self.inner else {
            return Self::invalid();
        };
        // SAFETY: our share keeps the count alive.
        P::increment(unsafe { inner.count.as_ref() });
        Self {
            inner: Some(Inner {
                object: inner.object,
                count: inner.count,
                allocator: Arc::clone(&inner.allocator),
            }),
            _owns: PhantomData,
        }
    }
}

impl<T: ?Sized, P: CounterPolicy> Drop for Shared<T, P> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<T: ?Sized, P: CounterPolicy> Default for Shared<T, P> {
    fn default() -> Self {
        Self::invalid()
    }
}

impl<T: ?Sized, P: CounterPolicy> Deref for Shared<T, P> {
    type Target = T;

    /// # Panics
    ///
    /// On an invalid handle.
    fn deref(&self) -> &T {
        match self.get() {
            Some(value) => value,
            None => panic!("dereferenced an invalid Shared handle"),
        }
    }
}

impl<T: ?Sized, P: CounterPolicy> PartialEq for Shared<T, P> {
    fn eq(&self, other: &Self) -> bool {
        Self::ptr_eq(self, other)
    }
}

impl<T: ?Sized, P: CounterPolicy> Eq for Shared<T, P> {}

impl<T: ?Sized + std::fmt::Debug, P: CounterPolicy> std::fmt::Debug for Shared<T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.get() {
            Some(value) => f
                .debug_struct("Shared")
                .field("value", &value)
                .field("use_count", &self.use_count())
                .finish(),
            None => f.write_str("Shared(<invalid>)"),
        }
    }
}

// SAFETY: the count is atomic and construction verified that the allocator is
// thread-safe, so handles may be cloned, dropped and dereferenced anywhere.
unsafe impl<T: ?Sized + Send + Sync> Send for Shared<T, Atomic> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for Shared<T, Atomic> {}

/// Builds a `Shared` of a concrete value typed as one of its unsized forms,
/// e.g. a trait object.
///
/// ```rust,ignore
/// let shape: Shared<dyn Shape> = make_shared_as!(&allocator, Circle::new(1.0) => dyn Shape)?;
/// let local = make_shared_as!(&arena, Circle::new(1.0) => dyn Shape, PlainCounter)?;
/// ```
#[macro_export]
macro_rules! make_shared_as {
    ($allocator:expr, $value:expr => $target:ty) => {
        $crate::make_shared_as!($allocator, $value => $target, $crate::shared::Atomic)
    };
    ($allocator:expr, $value:expr => $target:ty, $policy:ty) => {{
        // SAFETY: the closure is a plain unsizing cast of the pointer it receives.
        unsafe {
            $crate::shared::Shared::<$target, $policy>::new_coerced(
                $allocator,
                $value,
                |p| p as *mut $target,
            )
        }
    }};
}
