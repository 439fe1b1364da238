//! Bounded multi-producer multi-consumer channel.
//!
//! Every slot carries a `turn` counter. Ticket `i` maps to slot `i % capacity`
//! in cycle `i / capacity`; the slot is writable for that cycle while
//! `turn == 2 * cycle` and readable while `turn == 2 * cycle + 1`. Producers
//! take tickets from the write index, consumers from the read index, so each
//! slot has at most one writer and one reader at a time.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::{Backoff, CachePadded};
use tracing::debug;

use super::{ring_capacity, AlignedCounter, RawSlots};
use crate::alloc::AllocatorRef;
use crate::error::AllocError;
use crate::shared::Shared;

struct Slot<T> {
    turn: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

struct Ring<T> {
    write: AlignedCounter,
    read: AlignedCounter,
    slots: RawSlots<CachePadded<Slot<T>>>,
    mask: usize,
    shift: u32,
}

// SAFETY: a value is only ever accessed by the thread holding its slot's
// ticket, and the turn counter hands it over with release/acquire.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    #[inline]
    fn slot(&self, ticket: usize) -> &Slot<T> {
        self.slots.get(ticket & self.mask)
    }

    #[inline]
    fn cycle(&self, ticket: usize) -> usize {
        ticket >> self.shift
    }

    #[inline]
    fn writable_turn(&self, ticket: usize) -> usize {
        self.cycle(ticket).wrapping_mul(2)
    }

    #[inline]
    fn readable_turn(&self, ticket: usize) -> usize {
        self.writable_turn(ticket).wrapping_add(1)
    }

    /// # Safety
    ///
    /// The caller owns `ticket` on the write side and has observed the slot writable.
    #[inline]
    unsafe fn publish(&self, ticket: usize, value: T) {
        let slot = self.slot(ticket);
        (*slot.value.get()).write(value);
        slot.turn.store(self.readable_turn(ticket), Ordering::Release);
    }

    /// # Safety
    ///
    /// The caller owns `ticket` on the read side and has observed the slot readable.
    #[inline]
    unsafe fn consume(&self, ticket: usize) -> T {
        let slot = self.slot(ticket);
        let value = (*slot.value.get()).assume_init_read();
        slot.turn
            .store(self.readable_turn(ticket).wrapping_add(1), Ordering::Release);
        value
    }

    fn push(&self, value: T) {
        let ticket = self.write.0.fetch_add(1, Ordering::Relaxed);
        let want = self.writable_turn(ticket);
        let backoff = Backoff::new();
        while self.slot(ticket).turn.load(Ordering::Acquire) != want {
            backoff.snooze();
        }
        // SAFETY: ticket claimed by fetch_add, slot observed writable.
        unsafe { self.publish(ticket, value) }
    }

    fn try_push(&self, value: T) -> Result<(), T> {
        let mut ticket = self.write.0.load(Ordering::Acquire);
        loop {
            if self.slot(ticket).turn.load(Ordering::Acquire) == self.writable_turn(ticket) {
                match self.write.0.compare_exchange(
                    ticket,
                    ticket.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        // SAFETY: ticket claimed by the CAS, slot observed writable.
                        unsafe { self.publish(ticket, value) };
                        return Ok(());
                    }
                    Err(current) => ticket = current,
                }
            } else {
                // Slot still occupied; if nobody moved the index meanwhile the
                // ring is full.
                let previous = ticket;
                ticket = self.write.0.load(Ordering::Acquire);
                if ticket == previous {
                    return Err(value);
                }
            }
        }
    }

    fn pop(&self) -> T {
        let ticket = self.read.0.fetch_add(1, Ordering::Relaxed);
        let want = self.readable_turn(ticket);
        let backoff = Backoff::new();
        while self.slot(ticket).turn.load(Ordering::Acquire) != want {
            backoff.snooze();
        }
        // SAFETY: ticket claimed by fetch_add, slot observed readable.
        unsafe { self.consume(ticket) }
    }

    fn try_pop(&self) -> Option<T> {
        let mut ticket = self.read.0.load(Ordering::Acquire);
        loop {
            if self.slot(ticket).turn.load(Ordering::Acquire) == self.readable_turn(ticket) {
                match self.read.0.compare_exchange(
                    ticket,
                    ticket.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    // SAFETY: ticket claimed by the CAS, slot observed readable.
                    Ok(_) => return Some(unsafe { self.consume(ticket) }),
                    Err(current) => ticket = current,
                }
            } else {
                let previous = ticket;
                ticket = self.read.0.load(Ordering::Acquire);
                if ticket == previous {
                    return None;
                }
            }
        }
    }

    fn len(&self) -> usize {
        let write = self.write.0.load(Ordering::Acquire);
        let read = self.read.0.load(Ordering::Acquire);
        // Blocked consumers may have taken tickets ahead of the producers.
        if write > read {
            (write - read).min(self.slots.len())
        } else {
            0
        }
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        for i in 0..self.slots.len() {
            let slot = self.slots.get(i);
            if slot.turn.load(Ordering::Relaxed) & 1 == 1 {
                // SAFETY: odd turn means published and never consumed; no
                // handle is left to race with.
                unsafe { (*slot.value.get()).assume_init_drop() };
            }
        }
    }
}

/// Creates a bounded MPMC channel holding at least `capacity` items, with
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
        CachePadded::new(Slot {
            turn: AtomicUsize::new(0),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        })
    })?;
    let ring = Shared::new_in(
        allocator,
        Ring {
            write: AlignedCounter::new(0),
            read: AlignedCounter::new(0),
            slots,
            mask: capacity - 1,
            shift: capacity.trailing_zeros(),
        },
    )?;
    debug!(capacity, allocator = allocator.name(), "Created MPMC channel");

    Ok((Transmitter { ring: ring.clone() }, Receiver { ring }))
}

/// Sending half of an MPMC channel. Clone it to add producers.
pub struct Transmitter<T> {
    ring: Shared<Ring<T>>,
}

impl<T> Transmitter<T> {
    /// Enqueues `value`, spinning while the channel is full.
    #[inline]
    pub fn push(&self, value: T) {
        self.ring.push(value)
    }

    /// Enqueues `value` unless the channel is full, in which case it is handed back.
    #[inline]
    pub fn try_push(&self, value: T) -> Result<(), T> {
        self.ring.try_push(value)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.ring.slots.len()
    }

    /// Approximate number of queued items.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn allocator(&self) -> &AllocatorRef {
        self.ring.slots.allocator()
    }
}

impl<T> Clone for Transmitter<T> {
    fn clone(&self) -> Self {
        Self {
            ring: self.ring.clone(),
        }
    }
}

/// Receiving half of an MPMC channel. Clone it to add consumers.
pub struct Receiver<T> {
    ring: Shared<Ring<T>>,
}

impl<T> Receiver<T> {
    /// Dequeues the next item, spinning while the channel is empty.
    #[inline]
    pub fn pop(&self) -> T {
        self.ring.pop()
    }

    #[inline]
    pub fn try_pop(&self) -> Option<T> {
        self.ring.try_pop()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.ring.slots.len()
    }

    /// Approximate number of queued items.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Self {
            ring: self.ring.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Transmitter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("mpmc::Transmitter")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

impl<T> std::fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("mpmc::Receiver")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{LinearAllocator, MallocAllocator, NullAllocator};
    use std::sync::Arc;

    fn heap() -> AllocatorRef {
        Arc::new(MallocAllocator)
    }

    #[test]
    fn rounds_capacity_up() {
        let (tx, rx) = channel::<u32>(5, &heap()).unwrap();
        assert_eq!(tx.capacity(), 8);
        assert_eq!(rx.capacity(), 8);
    }

    #[test]
    fn rejects_zero_capacity() {
        assert!(matches!(
            channel::<u32>(0, &heap()),
            Err(AllocError::InvalidArgument(_))
        ));
    }

    #[test]
    fn rejects_thread_unsafe_allocator() {
        let arena: AllocatorRef = Arc::new(LinearAllocator::new(64 * 1024).unwrap());
        assert!(matches!(
            channel::<u32>(8, &arena),
            Err(AllocError::InvalidArgument(_))
        ));
    }

    #[test]
    fn allocation_failure_propagates() {
        let null: AllocatorRef = Arc::new(NullAllocator);
        assert!(matches!(
            channel::<u32>(8, &null),
            Err(AllocError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn try_push_on_full_channel_hands_value_back() {
        let (tx, rx) = channel::<u32>(5, &heap()).unwrap();
        let mut pushed = 0;
        while tx.try_push(pushed).is_ok() {
            pushed += 1;
        }
        assert_eq!(pushed, 8);
        assert_eq!(tx.try_push(99), Err(99));
        assert_eq!(rx.len(), 8);

        assert_eq!(rx.try_pop(), Some(0));
        tx.try_push(8).unwrap();
    }

    #[test]
    fn try_pop_on_empty_channel() {
        let (tx, rx) = channel::<u32>(4, &heap()).unwrap();
        assert_eq!(rx.try_pop(), None);
        tx.push(1);
        assert_eq!(rx.pop(), 1);
        assert!(rx.is_empty());
    }

    #[test]
    fn single_thread_order_with_wraparound() {
        let (tx, rx) = channel::<usize>(4, &heap()).unwrap();
        for cycle in 0..5 {
            for i in 0..4 {
                tx.push(cycle * 4 + i);
            }
            for i in 0..4 {
                assert_eq!(rx.pop(), cycle * 4 + i);
            }
        }
    }

    fn producers_deliver_everything(producers: usize) {
        const PER_PRODUCER: usize = 10_000;
        let (tx, rx) = channel::<usize>(64, &heap()).unwrap();

        let mut received = std::thread::scope(|s| {
            for p in 0..producers {
                let tx = tx.clone();
                s.spawn(move || {
                    for i in 0..PER_PRODUCER {
                        tx.push(p * PER_PRODUCER + i);
                    }
                });
            }
            (0..producers * PER_PRODUCER)
                .map(|_| rx.pop())
                .collect::<Vec<_>>()
        });

        received.sort_unstable();
        let expected: Vec<usize> = (0..producers * PER_PRODUCER).collect();
        assert_eq!(received, expected);
        assert!(rx.try_pop().is_none());
    }

    #[test]
    fn one_producer_no_loss_or_duplication() {
        producers_deliver_everything(1);
    }

    #[test]
    fn two_producers_no_loss_or_duplication() {
        producers_deliver_everything(2);
    }

    #[test]
    fn four_producers_no_loss_or_duplication() {
        producers_deliver_everything(4);
    }

    #[test]
    fn many_consumers_share_the_stream() {
        const TOTAL: usize = 40_000;
        let (tx, rx) = channel::<usize>(32, &heap()).unwrap();

        let mut received = std::thread::scope(|s| {
            let consumers: Vec<_> = (0..4)
                .map(|_| {
                    let rx = rx.clone();
                    s.spawn(move || (0..TOTAL / 4).map(|_| rx.pop()).collect::<Vec<_>>())
                })
                .collect();
            for i in 0..TOTAL {
                tx.push(i);
            }
            consumers
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        });

        received.sort_unstable();
        assert_eq!(received, (0..TOTAL).collect::<Vec<_>>());
    }

    #[test]
    fn non_blocking_stress_delivers_everything() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: usize = 5_000;
        let (tx, rx) = channel::<usize>(8, &heap()).unwrap();
        let taken = AtomicUsize::new(0);

        let mut received = std::thread::scope(|s| {
            for p in 0..PRODUCERS {
                let tx = tx.clone();
                s.spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let mut item = p * PER_PRODUCER + i;
                        let backoff = Backoff::new();
                        while let Err(back) = tx.try_push(item) {
                            item = back;
                            backoff.snooze();
                        }
                    }
                });
            }
            let consumers: Vec<_> = (0..CONSUMERS)
                .map(|_| {
                    let rx = rx.clone();
                    let taken = &taken;
                    s.spawn(move || {
                        let mut local = Vec::new();
                        while taken.load(Ordering::Relaxed) < PRODUCERS * PER_PRODUCER {
                            match rx.try_pop() {
                                Some(v) => {
                                    local.push(v);
                                    taken.fetch_add(1, Ordering::Relaxed);
                                }
                                None => std::hint::spin_loop(),
                            }
                        }
                        local
                    })
                })
                .collect();
            consumers
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        });

        received.sort_unstable();
        assert_eq!(received, (0..PRODUCERS * PER_PRODUCER).collect::<Vec<_>>());
    }

    #[test]
    fn remaining_items_are_dropped_with_the_last_handle() {
        let marker = Arc::new(());
        let (tx, rx) = channel::<Arc<()>>(4, &heap()).unwrap();
        for _ in 0..3 {
            tx.push(marker.clone());
        }
        drop(rx.pop());
        assert_eq!(Arc::strong_count(&marker), 3);

        drop(tx);
        assert_eq!(Arc::strong_count(&marker), 3);
        drop(rx);
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn either_side_may_outlive_the_other() {
        let (tx, rx) = channel::<String>(2, &heap()).unwrap();
        drop(rx);
        tx.push("kept".to_owned());
        assert_eq!(tx.len(), 1);
        assert_eq!(tx.allocator().name(), "malloc");
    }
}
