//! Inbound task queues for the task-parallel schedulers.
//!
//! Both scheduler variants share one FIFO contract: bounded enqueue
//! and blocking dequeue, with the dispatcher as sole producer per
//! queue. The contract is a trait so the scheduler is independent of
//! the queue implementation:
//!
//! - [`LockingQueue`]: a `Mutex<VecDeque>` guarded by a producer and
//!   a consumer condvar. Simple, works for any number of producers.
//! - [`SpscRing`]: a bounded single-producer/single-consumer ring.
//!   Publication is a release store of the tail index, consumption a
//!   release store of the head index; the only lock is a parking gate
//!   the consumer falls back to after a bounded spin when the ring
//!   runs dry.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crossbeam_utils::CachePadded;

/// How many times the consumer spins on an empty ring before parking.
const SPIN_BEFORE_PARK: usize = 1024;

/// A FIFO with bounded enqueue and blocking dequeue.
///
/// Implementations must preserve strict FIFO order per
/// (producer, consumer) pair. `push` may block (or spin) only when the
/// queue is at capacity; `pop` blocks until an element is available.
pub trait TaskQueue<T: Send>: Send + Sync + Sized {
    /// Creates a queue holding at least `capacity` elements.
    fn with_capacity(capacity: usize) -> Self;

    /// Enqueues a value, waiting if the queue is full.
    fn push(&self, value: T);

    /// Dequeues the oldest value, waiting if the queue is empty.
    fn pop(&self) -> T;
}

/// Recovers a usable guard from a possibly poisoned lock.
///
/// A panicking worker already trips the scheduler's poisoned flag;
/// losing the queue contents on top of that would just turn one
/// diagnostic into a hang for whoever is still draining.
fn recover<'a, T>(
    result: Result<MutexGuard<'a, T>, PoisonError<MutexGuard<'a, T>>>,
) -> MutexGuard<'a, T> {
    result.unwrap_or_else(|poison| {
        libc_print::libc_eprintln!("[parbit] warning: recovering from poisoned queue lock");
        poison.into_inner()
    })
}

/// Mutex + condition variable FIFO.
///
/// Producers wait on `producer_cv` while the queue is full; consumers
/// wait on `consumer_cv` while it is empty. Each side notifies one
/// waiter on the opposite condvar after mutating the deque.
pub struct LockingQueue<T> {
    inner: Mutex<std::collections::VecDeque<T>>,
    capacity: usize,
    producer_cv: Condvar,
    consumer_cv: Condvar,
}

impl<T: Send> LockingQueue<T> {
    /// Number of queued elements right now.
    #[must_use]
    pub fn len(&self) -> usize {
        recover(self.inner.lock()).len()
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send> TaskQueue<T> for LockingQueue<T> {
    fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be at least 1");
        Self {
            inner: Mutex::new(std::collections::VecDeque::with_capacity(capacity)),
            capacity,
            producer_cv: Condvar::new(),
            consumer_cv: Condvar::new(),
        }
    }

    fn push(&self, value: T) {
        let mut guard = recover(self.inner.lock());
        while guard.len() == self.capacity {
            guard = recover(self.producer_cv.wait(guard));
        }
        guard.push_back(value);
        drop(guard);
        self.consumer_cv.notify_one();
    }

    fn pop(&self) -> T {
        let mut guard = recover(self.inner.lock());
        while guard.is_empty() {
            guard = recover(self.consumer_cv.wait(guard));
        }
        let value = guard.pop_front().expect("queue checked non-empty");
        drop(guard);
        self.producer_cv.notify_one();
        value
    }
}

/// Parking gate for the ring consumer.
///
/// The ordering dance between `parked` and the ring's tail index is
/// the classic one: the consumer publishes `parked = true` and then
/// re-checks the tail; the producer publishes the tail and then checks
/// `parked`. Both sides use `SeqCst` on those four accesses so one of
/// them is guaranteed to see the other: either the consumer notices
/// the new element and skips parking, or the producer notices the
/// parked flag and rings the condvar.
struct Sleeper {
    parked: AtomicBool,
    lock: Mutex<()>,
    cv: Condvar,
}

impl Sleeper {
    fn new() -> Self {
        Self {
            parked: AtomicBool::new(false),
            lock: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    /// Wakes the consumer if it is parked (or about to park).
    fn wake(&self) {
        if self.parked.load(Ordering::SeqCst) {
            // Taking the lock serializes with the consumer between its
            // recheck and its wait, so the notify cannot be lost.
            let _guard = recover(self.lock.lock());
            self.cv.notify_one();
        }
    }
}

/// Bounded single-producer / single-consumer ring with blocking pop.
///
/// Capacity is rounded up to a power of two. `head` and `tail` are
/// monotonically increasing counters; the slot index is the counter
/// masked by `capacity - 1`. The producer owns `tail`, the consumer
/// owns `head`, and each reads the other side's counter with acquire
/// ordering to pair with the release store that published it.
///
/// `push` spins when the ring is full. The schedulers size their rings
/// past the worst-case batch backlog, so a full ring means the caller
/// broke the sizing contract, not a normal wait state.
pub struct SpscRing<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    sleeper: Sleeper,
}

// SAFETY: the slots are only touched through the head/tail protocol
// below, which hands each slot to exactly one side at a time. The ring
// is safe to share as long as at most one thread pushes and one pops,
// which is the documented SPSC contract.
unsafe impl<T: Send> Sync for SpscRing<T> {}
unsafe impl<T: Send> Send for SpscRing<T> {}

impl<T: Send> SpscRing<T> {
    fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Number of elements currently queued (approximate from outside
    /// the producer/consumer threads).
    #[must_use]
    pub fn len(&self) -> usize {
        self.tail
            .load(Ordering::Acquire)
            .wrapping_sub(self.head.load(Ordering::Acquire))
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send> TaskQueue<T> for SpscRing<T> {
    fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be at least 1");
        let capacity = capacity.next_power_of_two();
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            mask: capacity - 1,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            sleeper: Sleeper::new(),
        }
    }

    fn push(&self, value: T) {
        let tail = self.tail.load(Ordering::Relaxed);

        // Full ring: wait for the consumer to free a slot. The sizing
        // contract makes this a cold path.
        while tail.wrapping_sub(self.head.load(Ordering::Acquire)) == self.capacity() {
            std::hint::spin_loop();
        }

        // SAFETY: slot `tail & mask` is outside [head, tail), so the
        // consumer will not touch it until the tail store below.
        unsafe {
            (*self.slots[tail & self.mask].get()).write(value);
        }

        // SeqCst rather than plain release: see Sleeper.
        self.tail.store(tail.wrapping_add(1), Ordering::SeqCst);
        self.sleeper.wake();
    }

    fn pop(&self) -> T {
        let head = self.head.load(Ordering::Relaxed);

        let mut spins = 0;
        while self.tail.load(Ordering::Acquire) == head {
            spins += 1;
            if spins < SPIN_BEFORE_PARK {
                std::hint::spin_loop();
                continue;
            }

            // Park until the producer publishes something.
            let guard = recover(self.sleeper.lock.lock());
            self.sleeper.parked.store(true, Ordering::SeqCst);
            if self.tail.load(Ordering::SeqCst) != head {
                self.sleeper.parked.store(false, Ordering::SeqCst);
                break;
            }
            let guard = recover(self.sleeper.cv.wait(guard));
            drop(guard);
            self.sleeper.parked.store(false, Ordering::SeqCst);
            spins = 0;
        }

        // SAFETY: the tail load above observed tail > head, so slot
        // `head & mask` holds an initialized value published by the
        // producer's release/SeqCst tail store.
        let value = unsafe { (*self.slots[head & self.mask].get()).assume_init_read() };

        self.head.store(head.wrapping_add(1), Ordering::Release);
        value
    }
}

impl<T> Drop for SpscRing<T> {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        for pos in head..tail {
            // SAFETY: &mut self gives exclusive access; slots in
            // [head, tail) are initialized and not yet consumed.
            unsafe {
                (*self.slots[pos & self.mask].get()).assume_init_drop();
            }
        }
    }
}


// =============================================================================
// KANI PROOFS
// =============================================================================

#[cfg(kani)]
mod kani_proofs {
    /// Proof: masked slot indices stay in bounds for any power-of-two
    /// capacity and any (possibly wrapped) position counter.
    #[kani::proof]
    fn masked_index_in_bounds() {
        let shift: u32 = kani::any();
        kani::assume(shift < usize::BITS);
        let capacity = 1_usize << shift;
        let pos: usize = kani::any();
        kani::assert(pos & (capacity - 1) < capacity, "slot index out of bounds");
    }

    /// Proof: the wrapping occupancy count is exact across counter
    /// wraparound as long as the true occupancy fits the capacity.
    #[kani::proof]
    fn wrapped_occupancy_is_exact() {
        let head: usize = kani::any();
        let queued: usize = kani::any();
        kani::assume(queued <= 1 << 20);
        let tail = head.wrapping_add(queued);
        kani::assert(
            tail.wrapping_sub(head) == queued,
            "occupancy must survive counter wrap",
        );
    }
}
