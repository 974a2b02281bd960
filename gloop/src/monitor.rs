//! The gloop monitor: session management, fair scheduling of the launch
//! slot and watchdog preemption.
//!
//! [`Monitor::spawn`] binds the handshake listener and runs the event loop
//! on its own thread. Each accepted connection becomes a [`Session`] with a
//! worker thread serving its IPC queue; all sessions share one [`Server`].

mod event_loop;
pub mod fairness;
pub mod server;
pub mod session;
pub mod usage;
pub mod watchdog;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use mio::net::TcpListener;

pub use fairness::{Candidate, LeastUsed, SchedulingPolicy};
pub use server::{Server, SessionId, SessionStatus};
pub use session::{Outcome, Session, SessionCore, SessionError, SetupError};

use self::event_loop::EventLoop;
use crate::config::{ConfigError, MonitorConfig};
use crate::trace::info;

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("binding {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("poll: {0}")]
    Poll(#[source] io::Error),
    #[error("session setup failed: {0}")]
    Setup(#[source] SessionError),
    #[error("spawning the monitor thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("monitor thread panicked")]
    Panicked,
}

/// Handle to a running monitor. Dropping it stops the event loop and tears
/// down every session.
pub struct Monitor {
    server: Arc<Server>,
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<(), MonitorError>>>,
}

impl Monitor {
    /// Starts a monitor scheduling with [`LeastUsed`].
    ///
    /// # Errors
    ///
    /// An invalid `config`, a listener that cannot be bound, or a failure to
    /// start the event loop.
    pub fn spawn(config: MonitorConfig) -> Result<Self, MonitorError> {
        Self::spawn_with_policy(config, Box::new(LeastUsed))
    }

    /// Starts a monitor with a custom [`SchedulingPolicy`].
    ///
    /// # Errors
    ///
    /// See [`spawn`](Self::spawn).
    pub fn spawn_with_policy(
        config: MonitorConfig,
        policy: Box<dyn SchedulingPolicy>,
    ) -> Result<Self, MonitorError> {
        config.validate()?;
        let bind = |source| MonitorError::Bind {
            addr: config.bind_addr,
            source,
        };
        let listener = std::net::TcpListener::bind(config.bind_addr).map_err(bind)?;
        listener.set_nonblocking(true).map_err(bind)?;
        let local_addr = listener.local_addr().map_err(bind)?;

        let (server, requests) = Server::with_policy(&config, policy);
        let shutdown = Arc::new(AtomicBool::new(false));
        let event_loop = EventLoop::new(
            TcpListener::from_std(listener),
            Arc::clone(&server),
            requests,
            Arc::clone(&shutdown),
        )?;
        let thread = std::thread::Builder::new()
            .name("gloop-monitor".into())
            .spawn(move || event_loop.run())
            .map_err(MonitorError::Spawn)?;

        info!(
            server = config.server_id,
            addr = %local_addr,
            namespace = %config.namespace,
            "monitor listening"
        );
        Ok(Self {
            server,
            local_addr,
            shutdown,
            thread: Some(thread),
        })
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Stops the event loop and waits until every session is torn down.
    ///
    /// # Errors
    ///
    /// Whatever ended the event loop before the request, if anything did.
    pub fn shutdown(mut self) -> Result<(), MonitorError> {
        self.shutdown.store(true, Ordering::Release);
        self.join()
    }

    /// Blocks until the event loop ends on its own.
    ///
    /// # Errors
    ///
    /// The error that ended the event loop.
    pub fn wait(mut self) -> Result<(), MonitorError> {
        self.join()
    }

    fn join(&mut self) -> Result<(), MonitorError> {
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| MonitorError::Panicked)?,
            None => Ok(()),
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = self.join();
    }
}
