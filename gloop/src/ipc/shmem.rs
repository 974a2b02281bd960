//! Typed POSIX shared memory with typestate-based cleanup.
//!
//! - [`Shm<T, Mode>`] maps one `T` and dereferences to it
//! - [`SharedMemorySafe`] marks types that may live in such a mapping
//! - [`Creator`] creates the object and unlinks its name on drop
//! - [`Opener`] maps an existing object and leaves the name alone
//!
//! ```no_run
//! use gloop::SharedMemorySafe;
//! use gloop::ipc::shmem::{Creator, Opener, Shm, ShmPath};
//! use std::sync::atomic::{AtomicU64, Ordering};
//!
//! #[derive(SharedMemorySafe)]
//! #[repr(C)]
//! struct Counter {
//!     value: AtomicU64,
//! }
//!
//! let path = ShmPath::new("/gloop-counter")?;
//! let counter = Shm::<Counter, Creator>::create(path.clone(), |slot| {
//!     slot.write(Counter { value: AtomicU64::new(7) });
//! })?;
//!
//! let view = Shm::<Counter, Opener>::open(path)?;
//! assert_eq!(view.value.load(Ordering::Acquire), 7);
//! # drop(counter);
//! # Ok::<(), gloop::ipc::shmem::ShmError>(())
//! ```
//!
//! A monitor restarted after a crash may find names left behind by the
//! previous run; [`Shm::create_fresh`] unlinks such a name before creating.

use std::fmt;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ops::Deref;
use std::ptr::{NonNull, null_mut};
use std::sync::atomic::{
    AtomicBool, AtomicI8, AtomicI16, AtomicI32, AtomicI64, AtomicIsize, AtomicU8, AtomicU16,
    AtomicU32, AtomicU64, AtomicUsize,
};

use rustix::fs::{Mode, fstat, ftruncate};
use rustix::io::Errno;
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::shm;

pub type Result<T> = std::result::Result<T, ShmError>;

#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("invalid shared memory path `{path}`: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    #[error("{op} failed for `{path}`: {source}")]
    Posix {
        op: &'static str,
        path: String,
        source: Errno,
    },
    #[error("shared memory `{path}` is {actual} bytes, expected {expected}")]
    SizeMismatch {
        path: String,
        expected: usize,
        actual: i64,
    },
    #[error("shared memory `{path}` was never initialized by its creator")]
    InitTimeout { path: String },
}

impl ShmError {
    fn posix(op: &'static str, path: &ShmPath, source: Errno) -> Self {
        Self::Posix {
            op,
            path: path.to_string(),
            source,
        }
    }

    /// The errno behind a failed syscall, if any.
    #[must_use]
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::Posix { source, .. } => Some(*source),
            _ => None,
        }
    }
}

const POSIX_NAME_MAX: usize = 255;

/// A validated `shm_open` name: one leading `/`, no other `/`, at most 255 bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShmPath(String);

impl ShmPath {
    /// # Errors
    ///
    /// [`ShmError::InvalidPath`] describing the first rule the name breaks.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let reason = if !path.starts_with('/') {
            Some("path must start with '/'")
        } else if path[1..].contains('/') {
            Some("path must not contain additional '/' characters")
        } else if path.len() == 1 {
            Some("path must name an object after the '/'")
        } else if path.len() > POSIX_NAME_MAX {
            Some("path length must be <= 255 bytes")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(ShmError::InvalidPath { path, reason }),
            None => Ok(Self(path)),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShmPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<ShmPath> for String {
    fn from(path: ShmPath) -> Self {
        path.0
    }
}

/// Cleanup policy of a mapping, selected by the [`Creator`] / [`Opener`] markers.
pub trait ShmMode {
    const SHOULD_UNLINK: bool;
}

/// Created the object; unmaps and unlinks on drop.
pub struct Creator;
impl ShmMode for Creator {
    const SHOULD_UNLINK: bool = true;
}

/// Opened an existing object; only unmaps on drop.
pub struct Opener;
impl ShmMode for Opener {
    const SHOULD_UNLINK: bool = false;
}

/// Types that may be placed in memory shared between processes.
///
/// Prefer `#[derive(SharedMemorySafe)]`, which checks the first three rules.
///
/// # Safety
///
/// Implementers guarantee that the type
/// - has a stable layout (`repr(C)`, `repr(transparent)` or an integer repr),
/// - holds no pointers or references, since addresses differ per process,
/// - contains only fields that are themselves `SharedMemorySafe`,
/// - stays sound when its destructor never runs (a peer may be killed), and
/// - synchronizes all shared mutation through atomics.
///
/// ```compile_fail
/// # use gloop::ipc::shmem::SharedMemorySafe;
/// use std::rc::Rc;
/// struct NotSync { data: Rc<u32> }
/// unsafe impl SharedMemorySafe for NotSync {}
/// ```
pub unsafe trait SharedMemorySafe: Send + Sync {}

macro_rules! impl_shared_memory_safe {
    ($($t:ty),* $(,)?) => {
        $( unsafe impl SharedMemorySafe for $t {} )*
    };
}

impl_shared_memory_safe! {
    i8, i16, i32, i64, isize,
    u8, u16, u32, u64, usize,
    bool,
    AtomicBool,
    AtomicI8, AtomicI16, AtomicI32, AtomicI64, AtomicIsize,
    AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize,
}

unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for [T; N] {}

/// One `T` mapped from a POSIX shared memory object.
///
/// `Mode` decides whether dropping the handle also removes the name.
pub struct Shm<T: SharedMemorySafe, Mode: ShmMode> {
    ptr: NonNull<T>,
    path: ShmPath,
    _mode: PhantomData<Mode>,
}

// SAFETY: the mapping is process-wide, and T: SharedMemorySafe implies Send + Sync.
unsafe impl<T: SharedMemorySafe, Mode: ShmMode> Send for Shm<T, Mode> {}
// SAFETY: shared access only hands out &T, and T is Sync.
unsafe impl<T: SharedMemorySafe, Mode: ShmMode> Sync for Shm<T, Mode> {}

/// Maps `size_of::<T>()` bytes of `fd` read-write.
fn map<T>(fd: &rustix::fd::OwnedFd, path: &ShmPath) -> Result<NonNull<T>> {
    // SAFETY: a fresh shared mapping that aliases no Rust object. The object
    // is at least size_of::<T>() bytes (checked or truncated by the caller)
    // and mmap returns page-aligned memory, which satisfies T's alignment.
    let raw = unsafe {
        mmap(
            null_mut(),
            size_of::<T>(),
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
    }
    .map_err(|err| ShmError::posix("mmap", path, err))?;
    NonNull::new(raw.cast::<T>()).ok_or_else(|| ShmError::posix("mmap", path, Errno::FAULT))
}

impl<T: SharedMemorySafe> Shm<T, Creator> {
    /// Creates a new object at `path` and lets `init` write the initial `T`.
    ///
    /// The object is zero-filled before `init` runs. `init` must leave the
    /// value fully initialized; peers may map it as soon as the name exists,
    /// so types that need a handshake carry their own ready marker.
    ///
    /// # Errors
    ///
    /// `EEXIST` if the name is taken, plus any `shm_open`, `ftruncate` or
    /// `mmap` failure. Nothing is left behind on error.
    pub fn create(path: ShmPath, init: impl FnOnce(&mut MaybeUninit<T>)) -> Result<Self> {
        let fd = shm::open(
            path.as_str(),
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|err| ShmError::posix("shm_open", &path, err))?;

        let mapped = ftruncate(&fd, size_of::<T>() as u64)
            .map_err(|err| ShmError::posix("ftruncate", &path, err))
            .and_then(|()| map::<T>(&fd, &path));
        let ptr = match mapped {
            Ok(ptr) => ptr,
            Err(err) => {
                let _ = shm::unlink(path.as_str());
                return Err(err);
            }
        };

        // Owning the mapping first means a panicking `init` still unmaps and unlinks.
        let this = Self {
            ptr,
            path,
            _mode: PhantomData,
        };
        // SAFETY: the mapping is exclusively ours until `this` is returned, and
        // MaybeUninit<T> has the layout of T.
        init(unsafe { &mut *this.ptr.as_ptr().cast::<MaybeUninit<T>>() });
        Ok(this)
    }

    /// Like [`create`](Self::create), but first unlinks any object left at `path`.
    ///
    /// # Errors
    ///
    /// See [`create`](Self::create).
    pub fn create_fresh(path: ShmPath, init: impl FnOnce(&mut MaybeUninit<T>)) -> Result<Self> {
        match shm::unlink(path.as_str()) {
            Ok(()) | Err(Errno::NOENT) => {}
            Err(err) => return Err(ShmError::posix("shm_unlink", &path, err)),
        }
        Self::create(path, init)
    }
}

impl<T: SharedMemorySafe> Shm<T, Opener> {
    /// Maps an object created elsewhere. Its size must equal `size_of::<T>()`.
    ///
    /// # Errors
    ///
    /// `ENOENT` if nothing exists at `path`, [`ShmError::SizeMismatch`] if
    /// the creator used a different type, or any `fstat` / `mmap` failure.
    pub fn open(path: ShmPath) -> Result<Self> {
        let fd = shm::open(path.as_str(), shm::OFlags::RDWR, Mode::empty())
            .map_err(|err| ShmError::posix("shm_open", &path, err))?;

        let stat = fstat(&fd).map_err(|err| ShmError::posix("fstat", &path, err))?;
        if stat.st_size != size_of::<T>() as i64 {
            return Err(ShmError::SizeMismatch {
                path: path.into(),
                expected: size_of::<T>(),
                actual: stat.st_size,
            });
        }

        let ptr = map::<T>(&fd, &path)?;
        Ok(Self {
            ptr,
            path,
            _mode: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Shm<T, Mode> {
    #[must_use]
    pub fn path(&self) -> &ShmPath {
        &self.path
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Deref for Shm<T, Mode> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the mapping lives as long as self and was initialized by its creator.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Drop for Shm<T, Mode> {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe exactly the mapping made in `map`.
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast(), size_of::<T>());
        }
        if Mode::SHOULD_UNLINK {
            let _ = shm::unlink(self.path.as_str());
        }
    }
}

/// Returns true when the sandbox forbids POSIX shared memory altogether.
#[cfg(test)]
pub(crate) fn denied(err: &ShmError) -> bool {
    err.errno() == Some(Errno::ACCESS) || err.errno() == Some(Errno::PERM)
}
