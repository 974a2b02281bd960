//! Client side of a session.
//!
//! ```no_run
//! use std::time::Duration;
//! use gloop::Client;
//!
//! let mut client = Client::connect("127.0.0.1:7171", "gloop")?;
//! client.lock(Some(Duration::from_secs(1)))?;
//! while !client.should_abort() {
//!     // launch a slice of work
//! #   break;
//! }
//! client.unlock(false)?;
//! # Ok::<(), gloop::ClientError>(())
//! ```

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use minstant::Instant;

use crate::command::{Command, CommandError, CommandKind};
use crate::ipc::channel::{ClientChannels, SharedRegion};
use crate::ipc::shmem::ShmError;
use crate::trace::debug;

/// Queue poll granularity while waiting for a reply.
const REPLY_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("handshake: {0}")]
    Handshake(#[from] io::Error),
    #[error("monitor answered the handshake with {0:?}")]
    UnexpectedReply(CommandKind),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("session id {0} out of range")]
    BadSessionId(u64),
    #[error("opening session channels: {0}")]
    Channels(#[from] ShmError),
    #[error("request queue stayed full")]
    QueueFull,
    #[error("timed out waiting for the lock")]
    Timeout,
}

pub struct Client {
    // Closing the connection ends the session.
    handshake: TcpStream,
    id: u32,
    channels: ClientChannels,
    lock_pending: bool,
}

impl Client {
    /// Performs the `Initialize` handshake and opens the session's channels.
    ///
    /// # Errors
    ///
    /// A failed connection, an unexpected reply, or channels that cannot be
    /// opened under `namespace`.
    pub fn connect(addr: impl ToSocketAddrs, namespace: &str) -> Result<Self, ClientError> {
        let mut handshake = TcpStream::connect(addr)?;
        handshake.set_nodelay(true)?;
        handshake.write_all(&Command::initialize().to_bytes())?;
        let mut frame = [0u8; Command::WIRE_SIZE];
        handshake.read_exact(&mut frame)?;

        let reply = Command::from_bytes(&frame);
        match reply.kind()? {
            CommandKind::Initialize => {}
            other => return Err(ClientError::UnexpectedReply(other)),
        }
        let id = u32::try_from(reply.payload)
            .ok()
            .filter(|&id| id != 0)
            .ok_or(ClientError::BadSessionId(reply.payload))?;
        let channels = ClientChannels::open(namespace, id)?;
        debug!(session = id, "connected");
        Ok(Self {
            handshake,
            id,
            channels,
            lock_pending: false,
        })
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Requests the launch slot and blocks until it is granted, or until
    /// `timeout` passes. After a timeout the request stays queued and the
    /// next call keeps waiting for the same grant.
    ///
    /// # Errors
    ///
    /// [`ClientError::Timeout`] or [`ClientError::QueueFull`].
    pub fn lock(&mut self, timeout: Option<Duration>) -> Result<(), ClientError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        if !self.lock_pending {
            self.send(Command::lock(), deadline)?;
            self.lock_pending = true;
        }
        loop {
            let wait = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(ClientError::Timeout);
                    }
                    left.min(REPLY_POLL)
                }
                None => REPLY_POLL,
            };
            if let Some(reply) = self.channels.responses.recv_timeout(wait)
                && reply.kind() == Ok(CommandKind::Lock)
            {
                self.lock_pending = false;
                return Ok(());
            }
        }
    }

    /// Gives the slot back. With `reacquire` the session keeps contending
    /// and may be chosen as the next holder right away.
    ///
    /// # Errors
    ///
    /// [`ClientError::QueueFull`].
    pub fn unlock(&mut self, reacquire: bool) -> Result<(), ClientError> {
        self.send(Command::unlock(reacquire), None)
    }

    /// Sends a command the monitor executes without answering.
    ///
    /// # Errors
    ///
    /// [`ClientError::QueueFull`].
    pub fn operation(&mut self, payload: u64) -> Result<(), ClientError> {
        self.send(Command::operation(payload), None)
    }

    /// Whether the watchdog asked the current holder to stop.
    #[must_use]
    pub fn should_abort(&self) -> bool {
        self.channels.region.abort.is_raised()
    }

    /// The session's shared region.
    #[must_use]
    pub fn region(&self) -> &SharedRegion {
        &self.channels.region
    }

    /// Whether the handshake connection is still open from this side.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.handshake.peer_addr().is_ok()
    }

    fn send(&mut self, command: Command, deadline: Option<Instant>) -> Result<(), ClientError> {
        let wait = deadline.map_or(Duration::from_secs(1), |d| {
            d.saturating_duration_since(Instant::now())
        });
        self.channels
            .requests
            .push_timeout(command, wait)
            .map_err(|_| ClientError::QueueFull)
    }
}
