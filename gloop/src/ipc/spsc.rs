//! Lock-free SPSC queue over POSIX shared memory.
//!
//! Each session owns two of these: requests flow client to monitor, replies
//! flow back. Whichever side creates a queue owns its name; the other side
//! opens it and waits until the creator has published the ring.
//!
//! ```no_run
//! use gloop::ipc::shmem::ShmPath;
//! use gloop::ipc::spsc::{Consumer, Producer};
//!
//! let path = ShmPath::new("/gloop-doc-queue")?;
//! let inbox = Consumer::<u64, 64, _>::create_fresh(path.clone())?;
//! let outbox = Producer::<u64, 64, _>::open(path)?;
//! outbox.push(42).expect("queue has room");
//! assert_eq!(inbox.pop(), Some(42));
//! # Ok::<(), gloop::ipc::shmem::ShmError>(())
//! ```
//!
//! # Layout
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ InitMarker     (64 bytes)    │
//! ├──────────────────────────────┤
//! │ producer Side  (64 bytes)    │
//! │ consumer Side  (64 bytes)    │
//! ├──────────────────────────────┤
//! │ slots: [T; N]                │
//! └──────────────────────────────┘
//! ```

use std::cell::Cell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr::addr_of_mut;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use minstant::Instant;

use super::shmem::{Creator, Opener, Shm, ShmError, ShmMode, ShmPath};
use crate::SharedMemorySafe;
use crate::spsc::ring::{Ring, Side};
use crate::sync::Backoff;

const INIT_MAGIC: u64 = 0x474C_4F4F_5051_5545; // "GLOOPQUE"
const INIT_TIMEOUT: Duration = Duration::from_secs(1);

// SAFETY: Side is repr(C) and holds only integers; each field is written by one side.
unsafe impl SharedMemorySafe for Side {}

// SAFETY: Ring is repr(C) over Sides and slots of T: SharedMemorySafe;
// slot ownership follows the SPSC protocol.
unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for Ring<T, N> {}

#[derive(SharedMemorySafe)]
#[repr(C, align(64))]
struct InitMarker(AtomicU64);

#[repr(C)]
struct IpcQueue<T: SharedMemorySafe, const N: usize> {
    init: InitMarker,
    ring: Ring<T, N>,
}

// SAFETY: all fields are SharedMemorySafe.
unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for IpcQueue<T, N> {}

impl<T: SharedMemorySafe, const N: usize> IpcQueue<T, N> {
    fn init_shared(uninit: &mut MaybeUninit<Self>) {
        let ptr = uninit.as_mut_ptr();
        // SAFETY: the creator has exclusive access until the marker is published.
        unsafe {
            addr_of_mut!((*ptr).init).write(InitMarker(AtomicU64::new(0)));
            Ring::init_in_place(addr_of_mut!((*ptr).ring));
            (*ptr).init.0.store(INIT_MAGIC, Ordering::Release);
        }
    }

    /// Waits for the creator's Release store of the marker.
    fn wait_for_init(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut backoff = Backoff::new();
        while self.init.0.load(Ordering::Acquire) != INIT_MAGIC {
            if Instant::now() >= deadline {
                return false;
            }
            backoff.snooze(timeout);
        }
        true
    }
}

struct CapacityCheck<const N: usize>;

impl<const N: usize> CapacityCheck<N> {
    const OK: () = assert!(N > 0, "Queue capacity must be greater than 0");
}

fn create_queue<T: SharedMemorySafe, const N: usize>(
    path: ShmPath,
) -> Result<Shm<IpcQueue<T, N>, Creator>, ShmError> {
    let () = CapacityCheck::<N>::OK;
    Shm::create_fresh(path, IpcQueue::<T, N>::init_shared)
}

fn open_queue<T: SharedMemorySafe, const N: usize>(
    path: ShmPath,
) -> Result<Shm<IpcQueue<T, N>, Opener>, ShmError> {
    let () = CapacityCheck::<N>::OK;
    let shm = Shm::<IpcQueue<T, N>, Opener>::open(path)?;
    if shm.wait_for_init(INIT_TIMEOUT) {
        Ok(shm)
    } else {
        Err(ShmError::InitTimeout {
            path: shm.path().to_string(),
        })
    }
}

/// Marker type to opt-out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Write end of a queue. `Send` but not `Sync`, so one thread pushes at a time.
///
/// Nothing stops a second process from opening the same end; callers keep
/// to one producer per queue.
pub struct Producer<T: SharedMemorySafe, const N: usize, Mode: ShmMode> {
    shm: Shm<IpcQueue<T, N>, Mode>,
    _unsync: PhantomUnsync,
}

/// Read end of a queue. Same threading rules as [`Producer`].
pub struct Consumer<T: SharedMemorySafe, const N: usize, Mode: ShmMode> {
    shm: Shm<IpcQueue<T, N>, Mode>,
    _unsync: PhantomUnsync,
}

impl<T: SharedMemorySafe, const N: usize> Producer<T, N, Creator> {
    /// Creates the queue, replacing any stale object at `path`.
    ///
    /// # Errors
    ///
    /// Any [`ShmError`] from unlinking, creating or mapping the object.
    pub fn create_fresh(path: ShmPath) -> Result<Self, ShmError> {
        Ok(Self {
            shm: create_queue(path)?,
            _unsync: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe, const N: usize> Producer<T, N, Opener> {
    /// Opens a queue created by the consumer side.
    ///
    /// # Errors
    ///
    /// `ENOENT`, a size mismatch, or [`ShmError::InitTimeout`] if the creator
    /// never finished initializing within a second.
    pub fn open(path: ShmPath) -> Result<Self, ShmError> {
        Ok(Self {
            shm: open_queue(path)?,
            _unsync: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe, const N: usize, Mode: ShmMode> Producer<T, N, Mode> {
    /// Enqueues without waiting.
    ///
    /// # Errors
    ///
    /// Hands `item` back when the queue is full.
    #[inline]
    pub fn push(&self, item: T) -> Result<(), T> {
        // SAFETY: this handle is the only producer and is not Sync.
        unsafe { self.shm.ring.push(item) }
    }

    /// Retries [`push`](Self::push) with back-off until it succeeds or `timeout` passes.
    ///
    /// # Errors
    ///
    /// Hands `item` back on timeout.
    pub fn push_timeout(&self, mut item: T, timeout: Duration) -> Result<(), T> {
        let deadline = Instant::now() + timeout;
        let mut backoff = Backoff::new();
        loop {
            match self.push(item) {
                Ok(()) => return Ok(()),
                Err(back) => item = back,
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(item);
            }
            backoff.snooze(deadline - now);
        }
    }
}

impl<T: SharedMemorySafe, const N: usize> Consumer<T, N, Creator> {
    /// Creates the queue, replacing any stale object at `path`.
    ///
    /// # Errors
    ///
    /// See [`Producer::create_fresh`].
    pub fn create_fresh(path: ShmPath) -> Result<Self, ShmError> {
        Ok(Self {
            shm: create_queue(path)?,
            _unsync: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe, const N: usize> Consumer<T, N, Opener> {
    /// Opens a queue created by the producer side.
    ///
    /// # Errors
    ///
    /// See [`Producer::open`].
    pub fn open(path: ShmPath) -> Result<Self, ShmError> {
        Ok(Self {
            shm: open_queue(path)?,
            _unsync: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe, const N: usize, Mode: ShmMode> Consumer<T, N, Mode> {
    #[inline]
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        // SAFETY: this handle is the only consumer and is not Sync.
        unsafe { self.shm.ring.pop() }
    }

    /// Waits up to `timeout` for an item, backing off instead of spinning.
    #[must_use]
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut backoff = Backoff::new();
        loop {
            if let Some(item) = self.pop() {
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            backoff.snooze(deadline - now);
        }
    }

    /// Items waiting to be popped.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shm.ring.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
