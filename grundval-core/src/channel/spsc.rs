//! Bounded single-producer single-consumer channel.
//!
//! The write index belongs to the producer and the read index to the
//! consumer; each side publishes its own index with release and reads the
//! other's with acquire. Handles are move-only and take `&mut self`, so the
//! single-producer/single-consumer contract holds at the type level.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::Ordering;

use crossbeam::utils::Backoff;
use tracing::debug;

use super::{ring_capacity, AlignedCounter, RawSlots};
use crate::alloc::AllocatorRef;
use crate::error::AllocError;
use crate::shared::Shared;

struct Ring<T> {
    write: AlignedCounter,
    read: AlignedCounter,
    slots: RawSlots<UnsafeCell<MaybeUninit<T>>>,
    mask: usize,
}

// SAFETY: exclusive write access ensured by the index counters; only the
// producer writes a slot between `read` and `write`, only the consumer reads it.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    #[inline]
    fn slot(&self, index: usize) -> *mut MaybeUninit<T> {
        self.slots.get(index & self.mask).get()
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn len(&self) -> usize {
        let write = self.write.0.load(Ordering::Acquire);
        let read = self.read.0.load(Ordering::Acquire);
        write.wrapping_sub(read).min(self.capacity())
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        let write = *self.write.0.get_mut();
        let mut read = *self.read.0.get_mut();
        while read != write {
            // SAFETY: every index in `read..write` holds a published item.
            unsafe { (*self.slot(read)).assume_init_drop() };
            read = read.wrapping_add(1);
        }
    }
}

/// Creates a bounded SPSC channel holding at least `capacity` items, with
/// slot storage taken from `allocator`.
///
/// # Errors
///
/// `InvalidArgument` for a zero capacity or a non-thread-safe allocator;
/// any allocation failure of `allocator`.
pub fn channel<T>(
    capacity: usize,
    allocator: &AllocatorRef,
) -> Result<(Transmitter<T>, Receiver<T>), AllocError> {
    let capacity = ring_capacity(capacity)?;
    let slots = RawSlots::new(capacity, allocator, |_| {
        UnsafeCell::new(MaybeUninit::uninit())
    })?;
    let ring = Shared::new_in(
        allocator,
        Ring {
            write: AlignedCounter::new(0),
            read: AlignedCounter::new(0),
            slots,
            mask: capacity - 1,
        },
    )?;
    debug!(capacity, allocator = allocator.name(), "Created SPSC channel");

    Ok((
        Transmitter {
            ring: ring.clone(),
            cached_read: 0,
        },
        Receiver {
            ring,
            cached_write: 0,
        },
    ))
}

/// The producing half of an SPSC channel.
pub struct Transmitter<T> {
    ring: Shared<Ring<T>>,
    /// Last read index observed; refreshed only when the ring looks full.
    cached_read: usize,
}

impl<T> Transmitter<T> {
    /// Enqueues `value`, spinning while the channel is full.
    pub fn push(&mut self, value: T) {
        self.emplace_with(move || value)
    }

    /// Enqueues `value` unless the channel is full, in which case it is handed back.
    pub fn try_push(&mut self, value: T) -> Result<(), T> {
        self.try_emplace_with(move || value).map_err(|make| make())
    }

    /// Waits for a free slot, then builds the item directly in it.
    pub fn emplace_with(&mut self, make: impl FnOnce() -> T) {
        let write = self.ring.write.0.load(Ordering::Relaxed);
        let backoff = Backoff::new();
        while !self.has_room(write) {
            backoff.snooze();
        }
        self.commit(write, make());
    }

    /// Builds the item directly in a free slot; hands `make` back untouched
    /// when the channel is full.
    pub fn try_emplace_with<F: FnOnce() -> T>(&mut self, make: F) -> Result<(), F> {
        let write = self.ring.write.0.load(Ordering::Relaxed);
        if !self.has_room(write) {
            return Err(make);
        }
        self.commit(write, make());
        Ok(())
    }

    #[inline]
    fn has_room(&mut self, write: usize) -> bool {
        if write.wrapping_sub(self.cached_read) < self.ring.capacity() {
            return true;
        }
        self.cached_read = self.ring.read.0.load(Ordering::Acquire);
        write.wrapping_sub(self.cached_read) < self.ring.capacity()
    }

    #[inline]
    fn commit(&mut self, write: usize, value: T) {
        // SAFETY: the slot is outside `read..write`, so the consumer is not touching it.
        unsafe { (*self.ring.slot(write)).write(value) };
        self.ring
            .write
            .0
            .store(write.wrapping_add(1), Ordering::Release);
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Number of queued items as seen from the producer.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The consuming half of an SPSC channel.
pub struct Receiver<T> {
    ring: Shared<Ring<T>>,
    /// Last write index observed; refreshed only when the ring looks empty.
    cached_write: usize,
}

impl<T> Receiver<T> {
    /// Dequeues the next item, spinning while the channel is empty.
    pub fn pop(&mut self) -> T {
        let read = self.ring.read.0.load(Ordering::Relaxed);
        let backoff = Backoff::new();
        while !self.has_item(read) {
            backoff.snooze();
        }
        self.take(read)
    }

    pub fn try_pop(&mut self) -> Option<T> {
        let read = self.ring.read.0.load(Ordering::Relaxed);
        if !self.has_item(read) {
            return None;
        }
        Some(self.take(read))
    }

    #[inline]
    fn has_item(&mut self, read: usize) -> bool {
        if read != self.cached_write {
            return true;
        }
        self.cached_write = self.ring.write.0.load(Ordering::Acquire);
        read != self.cached_write
    }

    #[inline]
    fn take(&mut self, read: usize) -> T {
        // SAFETY: `read < write`, the producer published this slot with release.
        let value = unsafe { (*self.ring.slot(read)).assume_init_read() };
        self.ring
            .read
            .0
            .store(read.wrapping_add(1), Ordering::Release);
        value
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Number of queued items as seen from the consumer.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> std::fmt::Debug for Transmitter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("spsc::Transmitter")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

impl<T> std::fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("spsc::Receiver")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{LinearAllocator, MallocAllocator};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn heap() -> AllocatorRef {
        Arc::new(MallocAllocator)
    }

    #[test]
    fn rounds_capacity_up() {
        let (tx, _rx) = channel::<u8>(3, &heap()).unwrap();
        assert_eq!(tx.capacity(), 4);
    }

    #[test]
    fn rejects_zero_capacity_and_unsafe_allocator() {
        assert!(matches!(
            channel::<u8>(0, &heap()),
            Err(AllocError::InvalidArgument(_))
        ));
        let arena: AllocatorRef = Arc::new(LinearAllocator::new(4096).unwrap());
        assert!(matches!(
            channel::<u8>(4, &arena),
            Err(AllocError::InvalidArgument(_))
        ));
    }

    #[test]
    fn signals_queue_full() {
        let (mut tx, mut rx) = channel::<u32>(2, &heap()).unwrap();
        tx.try_push(1).unwrap();
        tx.try_push(2).unwrap();
        assert_eq!(tx.try_push(3), Err(3));
        assert_eq!(rx.try_pop(), Some(1));
        tx.try_push(3).unwrap();
        assert_eq!(tx.len(), 2);
    }

    #[test]
    fn try_emplace_hands_the_constructor_back_when_full() {
        let (mut tx, mut rx) = channel::<String>(1, &heap()).unwrap();
        tx.emplace_with(|| "first".to_owned());
        let rejected = tx.try_emplace_with(|| "second".to_owned()).unwrap_err();
        assert_eq!(rx.pop(), "first");
        assert!(tx.try_emplace_with(rejected).is_ok());
        assert_eq!(rx.pop(), "second");
        assert_eq!(rx.try_pop(), None);
    }

    #[test]
    fn wraps_buffer_correctly() {
        let (mut tx, mut rx) = channel::<u64>(4, &heap()).unwrap();
        for cycle in 0..3 {
            for i in 0..4 {
                tx.push(i + cycle * 4);
            }
            for i in 0..4 {
                assert_eq!(rx.pop(), i + cycle * 4);
            }
        }
        assert!(rx.is_empty());
    }

    #[test]
    fn threaded_fifo_across_many_wraps() {
        const ITEMS: u64 = 100_000;
        let (mut tx, mut rx) = channel::<u64>(16, &heap()).unwrap();
        let producer = std::thread::spawn(move || {
            for i in 0..ITEMS {
                tx.push(i);
            }
        });
        for i in 0..ITEMS {
            assert_eq!(rx.pop(), i);
        }
        producer.join().unwrap();
    }

    #[test]
    fn remaining_items_are_dropped() {
        let marker = Arc::new(());
        let (mut tx, rx) = channel::<Arc<()>>(8, &heap()).unwrap();
        for _ in 0..5 {
            tx.push(marker.clone());
        }
        drop(rx);
        assert_eq!(Arc::strong_count(&marker), 6);
        drop(tx);
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    proptest! {
        #[test]
        fn receives_in_push_order(items in prop::collection::vec(any::<u32>(), 0..64), capacity in 1usize..8) {
            let (mut tx, mut rx) = channel::<u32>(capacity, &heap()).unwrap();
            let expected = items.clone();
            let producer = std::thread::spawn(move || {
                for item in items {
                    tx.push(item);
                }
            });
            let received: Vec<u32> = (0..expected.len()).map(|_| rx.pop()).collect();
            producer.join().unwrap();
            prop_assert_eq!(received, expected);
        }
    }
}
