//! The fixed-size message shared by the handshake socket and the session queues.
//!
//! A [`Command`] has the same 16 bytes on both paths: the TCP handshake
//! copies [`Command::to_bytes`] onto the stream, and the shared-memory
//! queues store the struct itself.

use crate::SharedMemorySafe;

/// What a [`Command`] asks of its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CommandKind {
    /// Handshake only: create the session's channels; the reply carries its id.
    Initialize = 0,
    /// Accepted without a reply; executed outside the scheduler.
    Operation = 1,
    /// Block until the kernel lock is granted, then reply.
    Lock = 2,
    /// Release the kernel lock. Payload `1` requests an immediate re-acquire.
    Unlock = 3,
    /// Host IO request; never valid at the scheduler.
    Io = 4,
}

impl TryFrom<u32> for CommandKind {
    type Error = CommandError;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        Ok(match raw {
            0 => Self::Initialize,
            1 => Self::Operation,
            2 => Self::Lock,
            3 => Self::Unlock,
            4 => Self::Io,
            other => return Err(CommandError::UnknownKind(other)),
        })
    }
}

/// A command carried a discriminant outside [`CommandKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command kind {0}")]
    UnknownKind(u32),
}

/// One request or reply.
///
/// The layout is `repr(C)` and fully explicit, so the bytes a client writes
/// are the bytes the worker reads regardless of which side built it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, SharedMemorySafe)]
#[repr(C)]
pub struct Command {
    kind: u32,
    _reserved: u32,
    /// Session id on `Initialize`, re-acquire flag on `Unlock`, otherwise free.
    pub payload: u64,
}

const _: () = assert!(size_of::<Command>() == Command::WIRE_SIZE);

impl Command {
    /// Bytes per command on every channel.
    pub const WIRE_SIZE: usize = 16;

    #[must_use]
    pub const fn new(kind: CommandKind, payload: u64) -> Self {
        Self {
            kind: kind as u32,
            _reserved: 0,
            payload,
        }
    }

    #[must_use]
    pub const fn initialize() -> Self {
        Self::new(CommandKind::Initialize, 0)
    }

    #[must_use]
    pub const fn lock() -> Self {
        Self::new(CommandKind::Lock, 0)
    }

    /// Builds an `Unlock`; with `reacquire` the session goes straight back to contending.
    #[must_use]
    pub const fn unlock(reacquire: bool) -> Self {
        Self::new(CommandKind::Unlock, reacquire as u64)
    }

    #[must_use]
    pub const fn operation(payload: u64) -> Self {
        Self::new(CommandKind::Operation, payload)
    }

    /// Decodes the discriminant.
    ///
    /// # Errors
    ///
    /// [`CommandError::UnknownKind`] when the peer sent a value this build
    /// does not know.
    pub fn kind(&self) -> Result<CommandKind, CommandError> {
        CommandKind::try_from(self.kind)
    }

    /// Raw discriminant, for logging commands that failed to decode.
    #[must_use]
    pub const fn raw_kind(&self) -> u32 {
        self.kind
    }

    #[must_use]
    pub const fn reacquire(&self) -> bool {
        self.payload != 0
    }

    /// Native-endian image of the struct, as sent on the handshake socket.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        out[0..4].copy_from_slice(&self.kind.to_ne_bytes());
        out[4..8].copy_from_slice(&self._reserved.to_ne_bytes());
        out[8..16].copy_from_slice(&self.payload.to_ne_bytes());
        out
    }

    #[must_use]
    pub fn from_bytes(bytes: &[u8; Self::WIRE_SIZE]) -> Self {
        let word = |range: std::ops::Range<usize>| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes[range]);
            u32::from_ne_bytes(buf)
        };
        let mut payload = [0u8; 8];
        payload.copy_from_slice(&bytes[8..16]);
        Self {
            kind: word(0..4),
            _reserved: word(4..8),
            payload: u64::from_ne_bytes(payload),
        }
    }
}

impl Default for Command {
    fn default() -> Self {
        Self::operation(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, offset_of};

    #[test]
    fn layout_is_fixed() {
        assert_eq!(size_of::<Command>(), 16);
        assert_eq!(align_of::<Command>(), 8);
        assert_eq!(offset_of!(Command, kind), 0);
        assert_eq!(offset_of!(Command, payload), 8);
    }

    #[test]
    fn wire_bytes_match_memory_image() {
        let cmd = Command::new(CommandKind::Unlock, 0x0102_0304_0506_0708);
        let bytes = cmd.to_bytes();
        // SAFETY: Command is repr(C) with no padding bytes left implicit.
        let image: [u8; 16] = unsafe { std::mem::transmute(cmd) };
        assert_eq!(bytes, image);
        assert_eq!(Command::from_bytes(&bytes), cmd);
    }

    #[test]
    fn unknown_kind_is_reported() {
        let mut bytes = Command::lock().to_bytes();
        bytes[0..4].copy_from_slice(&99u32.to_ne_bytes());
        let cmd = Command::from_bytes(&bytes);
        assert_eq!(cmd.kind(), Err(CommandError::UnknownKind(99)));
        assert_eq!(cmd.raw_kind(), 99);
    }

    #[test]
    fn unlock_carries_reacquire_flag() {
        assert!(Command::unlock(true).reacquire());
        assert!(!Command::unlock(false).reacquire());
        assert_eq!(Command::unlock(true).kind(), Ok(CommandKind::Unlock));
    }
}
