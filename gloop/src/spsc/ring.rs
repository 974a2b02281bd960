//! Bounded lock-free SPSC ring.
//!
//! The producer owns `head` and the consumer owns `tail`; each side keeps a
//! private copy of the other's index and only reloads it when the ring looks
//! full (or empty). Indices grow without bound and wrap on overflow, so
//! `head - tail` is always the number of occupied slots.
//!
//! # Safety
//!
//! `push` and `pop` are unsafe: the caller guarantees that at most one
//! thread or process pushes and at most one pops.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr::addr_of_mut;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One side's public index plus its private view of the other side's.
#[repr(C, align(64))]
pub(crate) struct Side {
    index: AtomicUsize,
    /// Last observed value of the opposite index. Touched by this side only.
    peer_seen: UnsafeCell<usize>,
}

impl Side {
    const fn new() -> Self {
        Self {
            index: AtomicUsize::new(0),
            peer_seen: UnsafeCell::new(0),
        }
    }
}

// SAFETY: `index` is atomic and `peer_seen` is only ever touched by the side
// that owns this struct.
unsafe impl Sync for Side {}

#[repr(C)]
pub(crate) struct Ring<T, const N: usize> {
    producer: Side,
    consumer: Side,
    slots: [UnsafeCell<MaybeUninit<T>>; N],
}

// SAFETY: every slot is owned by exactly one side at a time, handed over by
// the Release store of head (to the consumer) or tail (to the producer).
unsafe impl<T: Send, const N: usize> Sync for Ring<T, N> {}
unsafe impl<T: Send, const N: usize> Send for Ring<T, N> {}

impl<T, const N: usize> Ring<T, N> {
    /// Writes empty indices into `ring`; slots stay uninitialized.
    ///
    /// # Safety
    ///
    /// `ring` must be valid for writes and not yet visible to either side.
    pub(crate) unsafe fn init_in_place(ring: *mut Self) {
        // SAFETY: forwarded from the caller.
        unsafe {
            addr_of_mut!((*ring).producer).write(Side::new());
            addr_of_mut!((*ring).consumer).write(Side::new());
        }
    }

    /// Enqueues `item`, or hands it back when the ring is full.
    ///
    /// # Safety
    ///
    /// Single producer; the ring was initialized with [`init_in_place`](Self::init_in_place).
    pub(crate) unsafe fn push(&self, item: T) -> Result<(), T> {
        let head = self.producer.index.load(Ordering::Relaxed);
        // SAFETY: peer_seen of the producer side is producer-private.
        let seen_tail = unsafe { &mut *self.producer.peer_seen.get() };

        if head.wrapping_sub(*seen_tail) >= N {
            *seen_tail = self.consumer.index.load(Ordering::Acquire);
            if head.wrapping_sub(*seen_tail) >= N {
                return Err(item);
            }
        }

        // SAFETY: head - tail < N, so the consumer is not looking at this slot
        // and will not until the Release store below publishes it.
        unsafe { (*self.slots[head % N].get()).write(item) };
        self.producer
            .index
            .store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Dequeues the oldest item, if any.
    ///
    /// # Safety
    ///
    /// Single consumer; the ring was initialized with [`init_in_place`](Self::init_in_place).
    pub(crate) unsafe fn pop(&self) -> Option<T> {
        let tail = self.consumer.index.load(Ordering::Relaxed);
        // SAFETY: peer_seen of the consumer side is consumer-private.
        let seen_head = unsafe { &mut *self.consumer.peer_seen.get() };

        if *seen_head == tail {
            *seen_head = self.producer.index.load(Ordering::Acquire);
            if *seen_head == tail {
                return None;
            }
        }

        // SAFETY: tail != head, so the producer finished writing this slot
        // (Acquire above) and will not reuse it before tail moves on.
        let item = unsafe { (*self.slots[tail % N].get()).assume_init_read() };
        self.consumer
            .index
            .store(tail.wrapping_add(1), Ordering::Release);
        Some(item)
    }

    /// Items currently queued, as seen by an outside observer.
    pub(crate) fn len(&self) -> usize {
        let tail = self.consumer.index.load(Ordering::Acquire);
        let head = self.producer.index.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn ring<const N: usize>() -> Box<Ring<u64, N>> {
        let mut boxed = Box::<Ring<u64, N>>::new_uninit();
        // SAFETY: fresh allocation; indices written, slots may stay uninit.
        unsafe {
            Ring::init_in_place(boxed.as_mut_ptr());
            boxed.assume_init()
        }
    }

    #[test]
    fn sides_live_on_their_own_cache_lines() {
        assert_eq!(align_of::<Side>(), 64);
        assert_eq!(std::mem::offset_of!(Ring<u64, 4>, consumer), 64);
        assert_eq!(std::mem::offset_of!(Ring<u64, 4>, slots), 128);
    }

    #[test]
    fn fifo_until_full_then_rejects() {
        let r = ring::<4>();
        unsafe {
            for i in 0..4 {
                assert!(r.push(i).is_ok());
            }
            assert_eq!(r.push(99), Err(99));
            assert_eq!(r.len(), 4);
            assert_eq!(r.pop(), Some(0));
            assert!(r.push(4).is_ok());
            for i in 1..=4 {
                assert_eq!(r.pop(), Some(i));
            }
            assert_eq!(r.pop(), None);
        }
    }

    #[test]
    fn wraps_many_times() {
        let r = ring::<3>();
        unsafe {
            for round in 0..10u64 {
                for i in 0..3 {
                    r.push(round * 10 + i).unwrap();
                }
                for i in 0..3 {
                    assert_eq!(r.pop(), Some(round * 10 + i));
                }
            }
        }
        assert_eq!(r.len(), 0);
    }

    #[test]
    fn threads_see_every_item_in_order() {
        let r: Arc<Ring<u64, 16>> = Arc::from(ring::<16>());
        let total = 10_000u64;

        let producer = {
            let r = Arc::clone(&r);
            thread::spawn(move || {
                for i in 0..total {
                    // SAFETY: only this thread pushes.
                    while unsafe { r.push(i) }.is_err() {
                        thread::yield_now();
                    }
                }
            })
        };

        let mut expected = 0;
        while expected < total {
            // SAFETY: only this thread pops.
            match unsafe { r.pop() } {
                Some(v) => {
                    assert_eq!(v, expected);
                    expected += 1;
                }
                None => thread::yield_now(),
            }
        }
        producer.join().unwrap();
    }
}
