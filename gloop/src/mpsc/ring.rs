//! Bounded MPSC ring with per-slot sequence numbers (Vyukov).
//!
//! A slot at position `pos` is free for a producer when `seq == pos`,
//! holds data when `seq == pos + 1`, and is released by the consumer by
//! setting `seq = pos + N`. Producers claim positions with a CAS on `head`.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

#[repr(C, align(64))]
struct Slot<T> {
    seq: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

#[repr(C, align(64))]
struct Cursor(AtomicUsize);

pub(crate) struct Ring<T, const N: usize> {
    head: Cursor,
    tail: Cursor,
    slots: Box<[Slot<T>]>,
}

// SAFETY: a slot's value is written by the one producer whose CAS claimed it
// and read by the single consumer after the Acquire of its sequence number.
unsafe impl<T: Send, const N: usize> Sync for Ring<T, N> {}
unsafe impl<T: Send, const N: usize> Send for Ring<T, N> {}

impl<T, const N: usize> Ring<T, N> {
    const MIN_SLOTS: () = assert!(N >= 2, "ring needs at least two slots");

    pub(crate) fn new() -> Self {
        let () = Self::MIN_SLOTS;
        Self {
            head: Cursor(AtomicUsize::new(0)),
            tail: Cursor(AtomicUsize::new(0)),
            slots: (0..N)
                .map(|i| Slot {
                    seq: AtomicUsize::new(i),
                    value: UnsafeCell::new(MaybeUninit::uninit()),
                })
                .collect(),
        }
    }

    /// Enqueues from any thread; hands `item` back when full.
    pub(crate) fn push(&self, item: T) -> Result<(), T> {
        let mut pos = self.head.0.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos % N];
            let seq = slot.seq.load(Ordering::Acquire);
            match seq.wrapping_sub(pos) as isize {
                0 => match self.head.0.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the CAS made this producer the slot's only writer.
                        unsafe { (*slot.value.get()).write(item) };
                        slot.seq.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                },
                d if d < 0 => return Err(item),
                _ => pos = self.head.0.load(Ordering::Relaxed),
            }
        }
    }

    /// Dequeues the oldest published item.
    ///
    /// # Safety
    ///
    /// Only one thread may pop.
    pub(crate) unsafe fn pop(&self) -> Option<T> {
        let tail = self.tail.0.load(Ordering::Relaxed);
        let slot = &self.slots[tail % N];
        if slot.seq.load(Ordering::Acquire) != tail.wrapping_add(1) {
            return None;
        }
        // SAFETY: seq == tail + 1 means the producer's write is complete and visible.
        let item = unsafe { (*slot.value.get()).assume_init_read() };
        slot.seq.store(tail.wrapping_add(N), Ordering::Release);
        self.tail.0.store(tail.wrapping_add(1), Ordering::Relaxed);
        Some(item)
    }
}

impl<T, const N: usize> Drop for Ring<T, N> {
    fn drop(&mut self) {
        // SAFETY: &mut self, so no other consumer exists.
        while unsafe { self.pop() }.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn rejects_when_full_and_recovers() {
        let ring: Ring<u32, 2> = Ring::new();
        assert!(ring.push(1).is_ok());
        assert!(ring.push(2).is_ok());
        assert_eq!(ring.push(3), Err(3));
        unsafe {
            assert_eq!(ring.pop(), Some(1));
            assert!(ring.push(3).is_ok());
            assert_eq!(ring.pop(), Some(2));
            assert_eq!(ring.pop(), Some(3));
            assert_eq!(ring.pop(), None);
        }
    }

    #[test]
    fn drop_releases_queued_items() {
        let marker = Arc::new(());
        {
            let ring: Ring<Arc<()>, 4> = Ring::new();
            ring.push(Arc::clone(&marker)).unwrap();
            ring.push(Arc::clone(&marker)).unwrap();
            assert_eq!(Arc::strong_count(&marker), 3);
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        let ring: Arc<Ring<u64, 32>> = Arc::new(Ring::new());
        let producers: Vec<_> = (0..4u64)
            .map(|p| {
                let ring = Arc::clone(&ring);
                thread::spawn(move || {
                    for i in 0..500 {
                        while ring.push(p * 1000 + i).is_err() {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let mut seen = Vec::with_capacity(2000);
        while seen.len() < 2000 {
            match unsafe { ring.pop() } {
                Some(v) => seen.push(v),
                None => thread::yield_now(),
            }
        }
        for p in producers {
            p.join().unwrap();
        }

        seen.sort_unstable();
        let expected: Vec<u64> = (0..4u64)
            .flat_map(|p| (0..500).map(move |i| p * 1000 + i))
            .collect();
        assert_eq!(seen, expected);
    }
}
