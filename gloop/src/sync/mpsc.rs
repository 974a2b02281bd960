//! Bounded in-process MPSC channel.
//!
//! Session workers use it to hand watchdog requests to the event loop
//! without taking a lock on the hot path.
//!
//! ```
//! use gloop::sync::mpsc;
//!
//! let (tx, rx) = mpsc::channel::<u32, 8>();
//! let tx2 = tx.clone();
//! tx.try_send(1).unwrap();
//! tx2.try_send(2).unwrap();
//! assert_eq!(rx.drain().collect::<Vec<_>>(), vec![1, 2]);
//! ```

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::mpsc::ring::Ring;

struct CapacityCheck<const N: usize>;

impl<const N: usize> CapacityCheck<N> {
    // With one slot, "full" and "free for the next lap" share a sequence number.
    const OK: () = assert!(N >= 2, "Queue capacity must be at least 2");
}

/// Creates a channel holding at most `N` undelivered items.
#[must_use]
pub fn channel<T: Send, const N: usize>() -> (Sender<T, N>, Receiver<T, N>) {
    let () = CapacityCheck::<N>::OK;
    let ring = Arc::new(Ring::new());
    (
        Sender {
            ring: Arc::clone(&ring),
        },
        Receiver {
            ring,
            _unsync: PhantomData,
        },
    )
}

/// Cloneable send half.
pub struct Sender<T: Send, const N: usize> {
    ring: Arc<Ring<T, N>>,
}

impl<T: Send, const N: usize> Clone for Sender<T, N> {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
        }
    }
}

impl<T: Send, const N: usize> Sender<T, N> {
    /// # Errors
    ///
    /// Hands `item` back when the channel is full.
    pub fn try_send(&self, item: T) -> Result<(), T> {
        self.ring.push(item)
    }
}

/// Marker type to opt-out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Receive half. `Send` but not `Sync`: exactly one thread consumes.
pub struct Receiver<T: Send, const N: usize> {
    ring: Arc<Ring<T, N>>,
    _unsync: PhantomUnsync,
}

impl<T: Send, const N: usize> Receiver<T, N> {
    #[must_use]
    pub fn try_recv(&self) -> Option<T> {
        // SAFETY: Receiver is neither Clone nor Sync, so this is the only consumer.
        unsafe { self.ring.pop() }
    }

    /// Everything queued right now, oldest first.
    pub fn drain(&self) -> impl Iterator<Item = T> + '_ {
        std::iter::from_fn(|| self.try_recv())
    }
}
