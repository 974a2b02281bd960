//! The monitor thread: accepts handshake connections, drives the watchdog
//! wheel and applies used-time decay.
//!
//! Every connection owns one [`Session`]. The protocol is strictly
//! request/response on fixed-size frames: read one command, handle it,
//! write it back, repeat. Closing the socket ends the session.

use std::collections::HashMap;
use std::io::{self, ErrorKind, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use minstant::Instant;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};

use super::MonitorError;
use super::server::Server;
use super::session::Session;
use super::watchdog::{Expiry, Watchdog, WatchdogRequests};
use crate::command::Command;
use crate::config::{WHEEL_CAPACITY, WHEEL_SLOTS};
use crate::timing::{TICK, with_wheel};
use crate::trace::{debug, error, trace, warn};

const LISTENER: Token = Token(0);
const EVENTS_CAPACITY: usize = 128;

type Frame = [u8; Command::WIRE_SIZE];

enum Progress {
    Open,
    Closed,
}

struct Connection {
    stream: TcpStream,
    session: Session,
    frame: Frame,
    filled: usize,
    /// Bytes of `frame` already written back; `None` while reading.
    written: Option<usize>,
}

impl Connection {
    fn new(stream: TcpStream, session: Session) -> Self {
        Self {
            stream,
            session,
            frame: [0; Command::WIRE_SIZE],
            filled: 0,
            written: None,
        }
    }

    // Alternates between reading one frame and writing its answer until the
    // socket would block.
    fn drive(&mut self) -> Result<Progress, MonitorError> {
        loop {
            if let Some(written) = self.written {
                match self.stream.write(&self.frame[written..]) {
                    Ok(0) => return Ok(Progress::Closed),
                    Ok(n) if written + n == self.frame.len() => {
                        self.written = None;
                        self.filled = 0;
                    }
                    Ok(n) => self.written = Some(written + n),
                    Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(Progress::Open),
                    Err(err) if err.kind() == ErrorKind::Interrupted => {}
                    Err(err) => return Ok(self.closed_by(&err)),
                }
                continue;
            }

            match self.stream.read(&mut self.frame[self.filled..]) {
                Ok(0) => return Ok(Progress::Closed),
                Ok(n) => self.filled += n,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(Progress::Open),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Ok(self.closed_by(&err)),
            }
            if self.filled < self.frame.len() {
                continue;
            }

            let mut command = Command::from_bytes(&self.frame);
            trace!(session = %self.session.id(), ?command, "handshake command");
            match self.session.handle(&mut command) {
                Ok(_) => {
                    self.frame = command.to_bytes();
                    self.written = Some(0);
                }
                Err(err) if err.is_fatal() => return Err(MonitorError::Setup(err)),
                Err(err) => {
                    warn!(session = %self.session.id(), %err, "closing connection");
                    return Ok(Progress::Closed);
                }
            }
        }
    }

    fn closed_by(&self, err: &io::Error) -> Progress {
        debug!(session = %self.session.id(), %err, "connection failed");
        Progress::Closed
    }
}

pub(super) struct EventLoop {
    poll: Poll,
    listener: TcpListener,
    server: Arc<Server>,
    requests: WatchdogRequests,
    shutdown: Arc<AtomicBool>,
    connections: HashMap<Token, Connection>,
    next_token: usize,
}

impl EventLoop {
    pub(super) fn new(
        listener: TcpListener,
        server: Arc<Server>,
        requests: WatchdogRequests,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, MonitorError> {
        let poll = Poll::new().map_err(MonitorError::Poll)?;
        let mut listener = listener;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(MonitorError::Poll)?;
        Ok(Self {
            poll,
            listener,
            server,
            requests,
            shutdown,
            connections: HashMap::new(),
            next_token: LISTENER.0 + 1,
        })
    }

    /// Serves until shutdown is requested or session setup fails. Open
    /// sessions are torn down before this returns.
    pub(super) fn run(mut self) -> Result<(), MonitorError> {
        let interval = self.server.config().watchdog_ticks();
        let decay = self.server.config().decay;
        let result = with_wheel::<Expiry, WHEEL_SLOTS, _>(WHEEL_CAPACITY, |wheel| {
            let mut watchdog = Watchdog::new(interval);
            let mut events = Events::with_capacity(EVENTS_CAPACITY);
            let mut last_decay = Instant::now();

            while !self.shutdown.load(Ordering::Acquire) {
                match self.poll.poll(&mut events, Some(TICK)) {
                    Ok(()) => {}
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) => return Err(MonitorError::Poll(err)),
                }
                for event in &events {
                    match event.token() {
                        LISTENER => self.accept()?,
                        token => self.ready(token)?,
                    }
                }

                watchdog.service(wheel, &self.server, &self.requests);

                if let Some(decay) = decay
                    && last_decay.elapsed() >= decay.interval
                {
                    self.server.decay_all(decay.amount);
                    last_decay = Instant::now();
                }
            }
            Ok(())
        });

        let open = self.connections.len();
        self.connections.clear();
        debug!(server = self.server.id(), open, "event loop stopped");
        if let Err(err) = &result {
            error!(server = self.server.id(), %err, "event loop failed");
        }
        result
    }

    fn accept(&mut self) -> Result<(), MonitorError> {
        loop {
            let (mut stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(server = self.server.id(), %err, "accept failed");
                    return Ok(());
                }
            };
            if let Err(err) = stream.set_nodelay(true) {
                debug!(%peer, %err, "cannot disable nagle");
            }
            let token = Token(self.next_token);
            self.next_token += 1;
            self.poll
                .registry()
                .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)
                .map_err(MonitorError::Poll)?;

            let session = Session::new(Arc::clone(&self.server));
            debug!(%peer, session = %session.id(), "accepted");
            let mut connection = Connection::new(stream, session);
            // Data may already be waiting; edge-triggered readiness won't repeat it.
            match connection.drive()? {
                Progress::Open => {
                    self.connections.insert(token, connection);
                }
                Progress::Closed => self.close(connection),
            }
        }
    }

    fn ready(&mut self, token: Token) -> Result<(), MonitorError> {
        let Some(connection) = self.connections.get_mut(&token) else {
            return Ok(());
        };
        if let Progress::Closed = connection.drive()?
            && let Some(closed) = self.connections.remove(&token)
        {
            self.close(closed);
        }
        Ok(())
    }

    fn close(&self, mut connection: Connection) {
        if let Err(err) = self.poll.registry().deregister(&mut connection.stream) {
            debug!(session = %connection.session.id(), %err, "deregister failed");
        }
        // Dropping the session joins its worker.
        drop(connection);
    }
}
