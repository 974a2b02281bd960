//! The IPC resources of one session and how both sides find them.
//!
//! Every session owns three named objects, derived from the monitor's
//! namespace and the session id handed out during the handshake:
//!
//! | kind       | name                      | direction        |
//! |------------|---------------------------|------------------|
//! | `request`  | `/{ns}-request-{id}`      | client → monitor |
//! | `response` | `/{ns}-response-{id}`     | monitor → client |
//! | `memory`   | `/{ns}-memory-{id}`       | shared region    |
//!
//! The monitor creates all three (replacing leftovers of the same name)
//! before it answers the handshake, so the client can open them right away.

use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use super::shmem::{Creator, Opener, Shm, ShmError, ShmPath};
use super::spsc::{Consumer, Producer};
use crate::SharedMemorySafe;
use crate::command::Command;
use crate::config::{QUEUE_DEPTH, SHARED_MEMORY_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Request,
    Response,
    Memory,
}

impl ChannelKind {
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Name of one session resource.
///
/// # Errors
///
/// [`ShmError::InvalidPath`] when `namespace` contains `/` or the name gets too long.
pub fn channel_path(namespace: &str, kind: ChannelKind, id: u32) -> Result<ShmPath, ShmError> {
    ShmPath::new(format!("/{namespace}-{kind}-{id}"))
}

/// Word at offset 0 of a session's region; non-zero asks the running kernel to stop.
#[derive(SharedMemorySafe)]
#[repr(transparent)]
pub struct AbortSignal(AtomicU32);

impl AbortSignal {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Asks the holder to abort. Release pairs with the poller's Acquire.
    pub fn raise(&self) {
        self.0.store(1, Ordering::Release);
    }

    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire) != 0
    }

    pub fn clear(&self) {
        self.0.store(0, Ordering::Release);
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

const SCRATCH_OFFSET: usize = 64;
pub const SCRATCH_SIZE: usize = SHARED_MEMORY_SIZE - SCRATCH_OFFSET;

/// The per-session shared region: abort word first, payload scratch after.
#[derive(SharedMemorySafe)]
#[repr(C)]
pub struct SharedRegion {
    pub abort: AbortSignal,
    _reserved: [u8; SCRATCH_OFFSET - size_of::<AbortSignal>()],
    scratch: [AtomicU8; SCRATCH_SIZE],
}

const _: () = assert!(size_of::<SharedRegion>() == SHARED_MEMORY_SIZE);

impl SharedRegion {
    fn init(slot: &mut MaybeUninit<Self>) {
        slot.write(Self {
            abort: AbortSignal::new(),
            _reserved: [0; SCRATCH_OFFSET - size_of::<AbortSignal>()],
            scratch: [const { AtomicU8::new(0) }; SCRATCH_SIZE],
        });
    }

    /// Copies `src` into the scratch area at `offset`, truncating at its end.
    /// Returns the number of bytes written.
    pub fn write_scratch(&self, offset: usize, src: &[u8]) -> usize {
        let dst = self.scratch.get(offset..).unwrap_or_default();
        for (cell, byte) in dst.iter().zip(src) {
            cell.store(*byte, Ordering::Relaxed);
        }
        std::sync::atomic::fence(Ordering::Release);
        dst.len().min(src.len())
    }

    /// Fills `dst` from the scratch area at `offset`. Returns the bytes read.
    pub fn read_scratch(&self, offset: usize, dst: &mut [u8]) -> usize {
        std::sync::atomic::fence(Ordering::Acquire);
        let src = self.scratch.get(offset..).unwrap_or_default();
        for (byte, cell) in dst.iter_mut().zip(src) {
            *byte = cell.load(Ordering::Relaxed);
        }
        dst.len().min(src.len())
    }
}

pub type RequestQueue<Mode> = Consumer<Command, QUEUE_DEPTH, Mode>;
pub type ResponseQueue<Mode> = Producer<Command, QUEUE_DEPTH, Mode>;

/// Monitor-side resources of a session; dropping them unlinks every name.
pub struct SessionChannels {
    pub requests: RequestQueue<Creator>,
    pub responses: ResponseQueue<Creator>,
    pub region: Shm<SharedRegion, Creator>,
}

impl SessionChannels {
    /// Creates the queue pair and the region for session `id`.
    ///
    /// # Errors
    ///
    /// The first [`ShmError`] hit; objects created before it are unlinked again.
    pub fn create(namespace: &str, id: u32) -> Result<Self, ShmError> {
        let requests = Consumer::create_fresh(channel_path(namespace, ChannelKind::Request, id)?)?;
        let responses =
            Producer::create_fresh(channel_path(namespace, ChannelKind::Response, id)?)?;
        let region = Shm::create_fresh(
            channel_path(namespace, ChannelKind::Memory, id)?,
            SharedRegion::init,
        )?;
        Ok(Self {
            requests,
            responses,
            region,
        })
    }
}

/// Client-side view of a session's resources.
pub struct ClientChannels {
    pub requests: Producer<Command, QUEUE_DEPTH, Opener>,
    pub responses: Consumer<Command, QUEUE_DEPTH, Opener>,
    pub region: Shm<SharedRegion, Opener>,
}

impl ClientChannels {
    /// Opens what the monitor created for session `id`.
    ///
    /// # Errors
    ///
    /// `ENOENT` if the monitor has not (or no longer) created them, or any
    /// other [`ShmError`] from opening.
    pub fn open(namespace: &str, id: u32) -> Result<Self, ShmError> {
        Ok(Self {
            requests: Producer::open(channel_path(namespace, ChannelKind::Request, id)?)?,
            responses: Consumer::open(channel_path(namespace, ChannelKind::Response, id)?)?,
            region: Shm::open(channel_path(namespace, ChannelKind::Memory, id)?)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::shmem::denied;
    use std::mem::offset_of;

    fn namespace(tag: &str) -> String {
        format!("gloop_chan_{tag}_{}", std::process::id())
    }

    #[test]
    fn names_follow_prefix_and_id() {
        let path = channel_path("gloop", ChannelKind::Response, 12).unwrap();
        assert_eq!(path.as_str(), "/gloop-response-12");
        assert!(channel_path("bad/ns", ChannelKind::Memory, 1).is_err());
    }

    #[test]
    fn abort_word_sits_at_offset_zero() {
        assert_eq!(offset_of!(SharedRegion, abort), 0);
        assert_eq!(offset_of!(SharedRegion, scratch), SCRATCH_OFFSET);
        assert_eq!(size_of::<AbortSignal>(), 4);
    }

    #[test]
    fn abort_signal_round_trip() {
        let signal = AbortSignal::new();
        assert!(!signal.is_raised());
        signal.raise();
        assert!(signal.is_raised());
        signal.clear();
        assert!(!signal.is_raised());
    }

    #[test]
    fn both_sides_see_the_same_resources() {
        let ns = namespace("pair");
        let server = match SessionChannels::create(&ns, 3) {
            Ok(c) => c,
            Err(err) if denied(&err) => {
                eprintln!("Skipping both_sides_see_the_same_resources: {err}");
                return;
            }
            Err(err) => panic!("{err}"),
        };
        let client = ClientChannels::open(&ns, 3).unwrap();

        client.requests.push(Command::lock()).unwrap();
        assert_eq!(server.requests.pop(), Some(Command::lock()));
        server.responses.push(Command::lock()).unwrap();
        assert_eq!(client.responses.pop(), Some(Command::lock()));

        server.region.abort.raise();
        assert!(client.region.abort.is_raised());

        assert_eq!(client.region.write_scratch(0, b"kernel"), 6);
        let mut buf = [0u8; 6];
        assert_eq!(server.region.read_scratch(0, &mut buf), 6);
        assert_eq!(&buf, b"kernel");
        assert_eq!(server.region.write_scratch(SCRATCH_SIZE - 2, b"xyz"), 2);

        drop(client);
        drop(server);
        assert!(ClientChannels::open(&ns, 3).is_err(), "creator unlinks on drop");
    }
}
