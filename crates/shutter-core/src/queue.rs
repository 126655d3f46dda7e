// crates/shutter-core/src/queue.rs
//
// The two primitives the worker hand-off is built on:
//
//   AsyncStream<T>: a bounded single-producer/single-consumer FIFO. Push
//   and pull never block; flow control lives in the paired semaphores, so
//   pushing when full or pulling when empty is a programming error, not a
//   runtime condition.
//
//   Semaphore: a counting semaphore with an observable count and a hard
//   maximum. Release wakes exactly one waiter.
//
// The stream is a power-of-two ring with monotonically increasing atomic
// head/tail indices (slot = index & mask). The producer owns tail, the
// consumer owns head; each side only stores its own index with Release
// after touching the slot, and loads the other side's with Acquire before
// touching it. That pairing is the entire correctness argument: there is
// exactly one producer and one consumer by contract.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

pub struct AsyncStream<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    /// Next index the consumer will read. Only the consumer stores this.
    head: AtomicUsize,
    /// Next index the producer will write. Only the producer stores this.
    tail: AtomicUsize,
}

// One thread pushes, one thread pulls; the atomics order the slot accesses.
unsafe impl<T: Send> Send for AsyncStream<T> {}
unsafe impl<T: Send> Sync for AsyncStream<T> {}

impl<T> AsyncStream<T> {
    /// Capacity is rounded up to a power of two so advancing is a mask.
    pub fn with_capacity(capacity: usize) -> Self {
        let cap = capacity.max(1).next_power_of_two();
        let slots = (0..cap)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { slots, mask: cap - 1, head: AtomicUsize::new(0), tail: AtomicUsize::new(0) }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Items currently queued. Exact when called from either endpoint
    /// thread, a snapshot otherwise.
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Producer side. The caller must have established free space (via the
    /// paired semaphore); pushing into a full stream is a bug.
    pub fn push(&self, item: T) {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        assert!(
            tail.wrapping_sub(head) < self.capacity(),
            "push into a full AsyncStream"
        );

        let slot = &self.slots[tail & self.mask];
        // Safety: the capacity check above proves the consumer is done with
        // this slot, and only this thread writes at tail.
        unsafe { (*slot.get()).write(item) };
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
    }

    /// Consumer side. Returns None when empty; callers that have acquired
    /// the paired semaphore may treat None as a bug.
    pub fn pull(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }

        let slot = &self.slots[head & self.mask];
        // Safety: head != tail proves the producer published this slot, and
        // only this thread reads at head.
        let item = unsafe { (*slot.get()).assume_init_read() };
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(item)
    }

    /// Drop everything queued and return both indices to zero. Requires
    /// exclusive access, so it can only happen between recordings when the
    /// worker is down.
    pub fn reset(&mut self) {
        while self.pull().is_some() {}
        *self.head.get_mut() = 0;
        *self.tail.get_mut() = 0;
    }
}

impl<T> Drop for AsyncStream<T> {
    fn drop(&mut self) {
        while self.pull().is_some() {}
    }
}

/// Counting semaphore over Mutex + Condvar. `release` never grows the count
/// past `max_count` and wakes exactly one waiter.
pub struct Semaphore {
    count: Mutex<u32>,
    max_count: u32,
    cv: Condvar,
}

impl Semaphore {
    pub fn new(initial: u32, max_count: u32) -> Self {
        assert!(initial <= max_count);
        Self { count: Mutex::new(initial), max_count, cv: Condvar::new() }
    }

    /// Block until the count is positive, then take one.
    pub fn acquire(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cv.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// Give one back (saturating at the maximum) and wake one waiter.
    pub fn release(&self) {
        let mut count = self.count.lock().unwrap();
        if *count < self.max_count {
            *count += 1;
        }
        drop(count);
        self.cv.notify_one();
    }

    pub fn count(&self) -> u32 {
        *self.count.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order_and_capacity_rounding() {
        let q = AsyncStream::with_capacity(3);
        assert_eq!(q.capacity(), 4);

        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.len(), 3);
        assert_eq!(q.pull(), Some(1));
        assert_eq!(q.pull(), Some(2));
        assert_eq!(q.pull(), Some(3));
        assert_eq!(q.pull(), None);
    }

    #[test]
    #[should_panic(expected = "full AsyncStream")]
    fn push_when_full_is_a_bug() {
        let q = AsyncStream::with_capacity(2);
        q.push(1);
        q.push(2);
        q.push(3);
    }

    #[test]
    fn reset_clears_and_rewinds() {
        let mut q = AsyncStream::with_capacity(4);
        q.push(String::from("a"));
        q.push(String::from("b"));
        q.reset();
        assert!(q.is_empty());
        q.push(String::from("c"));
        assert_eq!(q.pull().as_deref(), Some("c"));
    }

    #[test]
    fn drops_queued_items() {
        let item = Arc::new(());
        {
            let q = AsyncStream::with_capacity(2);
            q.push(Arc::clone(&item));
            q.push(Arc::clone(&item));
        }
        assert_eq!(Arc::strong_count(&item), 1);
    }

    /// Under SPSC with capacity K and the two-semaphore
    /// protocol, the stream never exceeds K, pushes never hit a full
    /// stream, pulls after an acquire never come up empty, and order is
    /// preserved.
    #[test]
    fn spsc_stress_with_semaphore_pairing() {
        const K: usize = 8;
        const N: u64 = 200_000;

        let q = Arc::new(AsyncStream::with_capacity(K));
        let free = Arc::new(Semaphore::new(K as u32, K as u32));
        let filled = Arc::new(Semaphore::new(0, K as u32));

        let producer = {
            let q = Arc::clone(&q);
            let free = Arc::clone(&free);
            let filled = Arc::clone(&filled);
            thread::spawn(move || {
                for i in 0..N {
                    free.acquire();
                    q.push(i);
                    filled.release();
                }
            })
        };

        let consumer = {
            let q = Arc::clone(&q);
            let free = Arc::clone(&free);
            let filled = Arc::clone(&filled);
            thread::spawn(move || {
                for expect in 0..N {
                    filled.acquire();
                    let got = q.pull().expect("semaphore said an item is queued");
                    assert_eq!(got, expect);
                    assert!(q.len() <= K);
                    free.release();
                }
            })
        };

        producer.join().unwrap();
        consumer.join().unwrap();
        assert!(q.is_empty());
        assert_eq!(free.count(), K as u32);
        assert_eq!(filled.count(), 0);
    }

    #[test]
    fn semaphore_caps_at_max() {
        let s = Semaphore::new(2, 2);
        s.release();
        s.release();
        assert_eq!(s.count(), 2);
        s.acquire();
        assert_eq!(s.count(), 1);
    }
}
