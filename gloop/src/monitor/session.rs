//! One client's session: the handshake side owned by the event loop and the
//! worker thread that serves its IPC queue.
//!
//! A session starts on the network with `Initialize`. The monitor then
//! creates the session's channels, registers it for scheduling and starts
//! the worker, which executes `Lock`, `Unlock` and `Operation` commands in
//! arrival order. Only `Lock` is answered; the reply means the slot is held.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::server::{AccountingGuard, Server, SessionId};
use super::usage::{TimeWatch, units_for};
use super::watchdog::WatchdogRequest;
use crate::command::{Command, CommandError, CommandKind};
use crate::ipc::channel::{RequestQueue, ResponseQueue, SessionChannels, SharedRegion};
use crate::ipc::shmem::{Creator, Shm, ShmError};
use crate::trace::{debug, error, info, trace, warn};

/// Whether a processed command is answered on the response queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Respond,
    Silent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Waiting,
    Holding,
}

#[derive(Debug, Default)]
struct Hold {
    phase: Phase,
    watch: TimeWatch,
}

/// Failures that leave the monitor unable to serve new sessions.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("creating session channels: {0}")]
    Channels(#[from] ShmError),
    #[error("spawning session worker: {0}")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("session {0} is already initialized")]
    AlreadyInitialized(SessionId),
    #[error("{0:?} must be sent over the session's IPC queue")]
    WrongChannel(CommandKind),
}

impl SessionError {
    /// Whether the whole monitor has to stop rather than just this connection.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Setup(_))
    }
}

/// Scheduling state of a session, shared by its worker, the server registry
/// and the watchdog.
pub struct SessionCore {
    id: SessionId,
    server: Arc<Server>,
    attempting: AtomicBool,
    waiting: AtomicBool,
    used: AtomicU64,
    stop: AtomicBool,
    epoch: AtomicU64,
    preemptions: AtomicU64,
    hold: Mutex<Hold>,
    region: Option<Shm<SharedRegion, Creator>>,
}

impl SessionCore {
    pub(crate) fn new(
        id: SessionId,
        server: Arc<Server>,
        region: Option<Shm<SharedRegion, Creator>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            server,
            attempting: AtomicBool::new(false),
            waiting: AtomicBool::new(false),
            used: AtomicU64::new(0),
            stop: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            preemptions: AtomicU64::new(0),
            hold: Mutex::new(Hold::default()),
            region,
        })
    }

    #[cfg(test)]
    pub(crate) fn detached(id: SessionId, server: Arc<Server>) -> Arc<Self> {
        Self::new(id, server, None)
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Accumulated used time, in units.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_attempting(&self) -> bool {
        self.attempting.load(Ordering::Acquire)
    }

    /// Blocked inside the gate, waiting for admission.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.lock_hold().phase
    }

    /// Abort requests raised for this session so far.
    #[must_use]
    pub fn preemptions(&self) -> u64 {
        self.preemptions.load(Ordering::Relaxed)
    }

    pub fn charge(&self, _accounting: &AccountingGuard<'_>, units: u64) {
        self.used
            .store(self.used().saturating_add(units), Ordering::Release);
    }

    /// Lowers the used time by `units`, never below zero.
    pub fn burn_used(&self, _accounting: &AccountingGuard<'_>, units: u64) {
        self.used
            .store(self.used().saturating_sub(units), Ordering::Release);
    }

    pub fn set_used(&self, _accounting: &AccountingGuard<'_>, units: u64) {
        self.used.store(units, Ordering::Release);
    }

    pub(crate) fn set_attempting(&self, attempting: bool) {
        self.attempting.store(attempting, Ordering::Release);
    }

    pub(crate) fn set_waiting(&self, waiting: bool) {
        self.waiting.store(waiting, Ordering::Release);
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub(crate) fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Whether `epoch` still names the current hold.
    pub(crate) fn is_armed(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::Acquire) == epoch && self.phase() == Phase::Holding
    }

    /// Executes one command from the IPC queue.
    pub fn dispatch(&self, command: &mut Command) -> Outcome {
        match command.kind() {
            Ok(CommandKind::Lock) => self.lock(),
            Ok(CommandKind::Unlock) => {
                self.unlock(command.reacquire());
                Outcome::Silent
            }
            Ok(CommandKind::Operation) => Outcome::Silent,
            Ok(CommandKind::Io) => {
                error!(session = %self.id, "io command reached the session worker");
                debug_assert!(false, "io commands are never queued to a session");
                Outcome::Silent
            }
            Ok(CommandKind::Initialize) => {
                warn!(session = %self.id, "initialize on the ipc queue ignored");
                Outcome::Silent
            }
            Err(err) => {
                warn!(session = %self.id, %err, "dropping malformed command");
                Outcome::Silent
            }
        }
    }

    fn lock(&self) -> Outcome {
        {
            let mut hold = self.lock_hold();
            if hold.phase == Phase::Holding {
                warn!(session = %self.id, "lock requested while already holding");
                return Outcome::Respond;
            }
            hold.phase = Phase::Waiting;
        }

        self.set_attempting(true);
        if self.server.acquire(self).is_err() {
            self.lock_hold().phase = Phase::Idle;
            debug!(session = %self.id, "lock abandoned");
            return Outcome::Silent;
        }
        if let Some(region) = &self.region {
            region.abort.clear();
        }

        let epoch = {
            let mut hold = self.lock_hold();
            hold.phase = Phase::Holding;
            hold.watch.begin();
            self.epoch.fetch_add(1, Ordering::AcqRel) + 1
        };
        self.server.request_watchdog(WatchdogRequest::Arm {
            session: self.id,
            epoch,
        });
        debug!(session = %self.id, epoch, "lock granted");
        Outcome::Respond
    }

    fn unlock(&self, reacquire: bool) {
        let Some(held) = self.end_hold() else {
            warn!(session = %self.id, "unlock without holding the lock");
            return;
        };
        if reacquire {
            self.set_attempting(true);
        }
        self.settle(held);
    }

    // Leaving the holding phase bumps the epoch under the hold lock, which
    // is what `preempt` checks, so no abort lands after this returns.
    fn end_hold(&self) -> Option<Duration> {
        let held = {
            let mut hold = self.lock_hold();
            if hold.phase != Phase::Holding {
                return None;
            }
            self.epoch.fetch_add(1, Ordering::AcqRel);
            hold.phase = Phase::Idle;
            hold.watch.end()
        };
        self.server
            .request_watchdog(WatchdogRequest::Disarm { session: self.id });
        Some(held)
    }

    fn settle(&self, held: Duration) {
        let units = units_for(held, self.server.config().cost_per_unit);
        let next = {
            let accounting = self.server.accounting();
            self.charge(&accounting, units);
            self.server.calculate_next_session(&accounting)
        };
        self.server.release(self.id, next);
        debug!(session = %self.id, units, next = ?next, "lock released");
    }

    /// Raises the abort word if hold `epoch` is still in progress.
    pub(crate) fn preempt(&self, epoch: u64) -> bool {
        let hold = self.lock_hold();
        if hold.phase != Phase::Holding || self.epoch.load(Ordering::Acquire) != epoch {
            return false;
        }
        if let Some(region) = &self.region {
            region.abort.raise();
        }
        self.preemptions.fetch_add(1, Ordering::Relaxed);
        drop(hold);
        true
    }

    /// Gives the slot back if the worker exits while holding it.
    pub(crate) fn abandon(&self) {
        self.set_attempting(false);
        if let Some(held) = self.end_hold() {
            warn!(session = %self.id, "session ended while holding the lock");
            self.settle(held);
        }
    }

    fn lock_hold(&self) -> MutexGuard<'_, Hold> {
        self.hold.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn run_worker(core: &SessionCore, requests: RequestQueue<Creator>, responses: ResponseQueue<Creator>) {
    let poll = core.server.config().worker_poll;
    while !core.is_stopping() {
        let Some(mut command) = requests.recv_timeout(poll) else {
            continue;
        };
        trace!(session = %core.id(), ?command, "request");
        if core.dispatch(&mut command) == Outcome::Silent {
            continue;
        }
        let mut reply = command;
        while let Err(back) = responses.push_timeout(reply, poll) {
            if core.is_stopping() {
                break;
            }
            reply = back;
        }
    }
    core.abandon();
}

struct Active {
    core: Arc<SessionCore>,
    worker: JoinHandle<()>,
}

/// The network side of a session, owned by the connection that created it.
///
/// Dropping it unregisters the session, stops and joins the worker, and then
/// releases the IPC resources.
pub struct Session {
    id: SessionId,
    server: Arc<Server>,
    active: Option<Active>,
}

impl Session {
    #[must_use]
    pub fn new(server: Arc<Server>) -> Self {
        Self {
            id: server.allocate_id(),
            server,
            active: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn core(&self) -> Option<&Arc<SessionCore>> {
        self.active.as_ref().map(|a| &a.core)
    }

    /// Handles a command that arrived over the network. The caller writes
    /// `command` back afterwards; `Initialize` fills in the session id.
    ///
    /// # Errors
    ///
    /// [`SessionError::Setup`] is fatal for the monitor; every other error
    /// ends this connection only.
    pub fn handle(&mut self, command: &mut Command) -> Result<Outcome, SessionError> {
        match command.kind()? {
            CommandKind::Initialize => {
                self.initialize()?;
                *command = Command::new(CommandKind::Initialize, u64::from(self.id.get()));
                Ok(Outcome::Respond)
            }
            CommandKind::Operation => Ok(Outcome::Silent),
            kind @ (CommandKind::Lock | CommandKind::Unlock) => Err(SessionError::WrongChannel(kind)),
            CommandKind::Io => {
                error!(session = %self.id, "io command reached the session handshake");
                debug_assert!(false, "io commands are never sent to the monitor");
                Ok(Outcome::Silent)
            }
        }
    }

    fn initialize(&mut self) -> Result<(), SessionError> {
        if self.active.is_some() {
            return Err(SessionError::AlreadyInitialized(self.id));
        }
        let SessionChannels {
            requests,
            responses,
            region,
        } = SessionChannels::create(&self.server.config().namespace, self.id.get())
            .map_err(SetupError::from)?;

        let core = SessionCore::new(self.id, Arc::clone(&self.server), Some(region));
        self.server.register(&core);
        let worker = thread::Builder::new()
            .name(format!("gloop-session-{}", self.id))
            .spawn({
                let core = Arc::clone(&core);
                move || run_worker(&core, requests, responses)
            });
        let worker = match worker {
            Ok(worker) => worker,
            Err(err) => {
                self.server.unregister(self.id);
                return Err(SetupError::Spawn(err).into());
            }
        };

        info!(server = self.server.id(), session = %self.id, "open");
        self.active = Some(Active { core, worker });
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let Some(Active { core, worker }) = self.active.take() else {
            return;
        };
        core.stop();
        self.server.unregister(self.id);
        info!(server = self.server.id(), session = %self.id, "close");
        if worker.join().is_err() {
            error!(session = %self.id, "session worker panicked");
        }
        // A worker that unwound never reached its own abandon.
        core.abandon();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;

    fn server() -> Arc<Server> {
        Server::new(&MonitorConfig::default()).0
    }

    fn registered(server: &Arc<Server>) -> Arc<SessionCore> {
        let core = SessionCore::detached(server.allocate_id(), Arc::clone(server));
        server.register(&core);
        core
    }

    #[test]
    fn lock_then_unlock_accounts_hold_time() {
        let server = server();
        let core = registered(&server);
        assert_eq!(core.dispatch(&mut Command::lock()), Outcome::Respond);
        assert_eq!(core.phase(), Phase::Holding);
        assert_eq!(server.holder(), Some(core.id()));

        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(core.dispatch(&mut Command::unlock(false)), Outcome::Silent);
        assert_eq!(core.phase(), Phase::Idle);
        assert_eq!(server.holder(), None);
        assert!(core.used() >= 2000, "2ms at 1000ns per unit, got {}", core.used());
        assert!(!core.is_attempting());
    }

    #[test]
    fn reacquire_flag_marks_session_attempting() {
        let server = server();
        let core = registered(&server);
        core.dispatch(&mut Command::lock());
        core.dispatch(&mut Command::unlock(true));
        assert!(core.is_attempting());
        assert_eq!(server.holder(), None);
    }

    #[test]
    fn unlock_without_lock_is_ignored() {
        let server = server();
        let core = registered(&server);
        assert_eq!(core.dispatch(&mut Command::unlock(false)), Outcome::Silent);
        assert_eq!(core.used(), 0);
        assert_eq!(core.dispatch(&mut Command::operation(7)), Outcome::Silent);
    }

    #[test]
    fn preempt_only_hits_the_current_hold() {
        let server = server();
        let core = registered(&server);
        core.dispatch(&mut Command::lock());
        let epoch = core.epoch();
        assert!(core.is_armed(epoch));
        assert!(core.preempt(epoch));

        core.dispatch(&mut Command::unlock(false));
        assert!(!core.is_armed(epoch));
        assert!(!core.preempt(epoch));
        assert_eq!(core.preemptions(), 1);
    }

    #[test]
    fn abandon_releases_a_held_slot() {
        let server = server();
        let core = registered(&server);
        core.dispatch(&mut Command::lock());
        core.abandon();
        assert_eq!(server.holder(), None);
        assert_eq!(core.phase(), Phase::Idle);
    }

    #[test]
    fn lock_and_unlock_are_rejected_on_the_network() {
        let mut session = Session::new(server());
        assert!(matches!(
            session.handle(&mut Command::lock()),
            Err(SessionError::WrongChannel(CommandKind::Lock))
        ));
        assert!(matches!(
            session.handle(&mut Command::unlock(false)),
            Err(SessionError::WrongChannel(CommandKind::Unlock))
        ));
        assert_eq!(
            session.handle(&mut Command::operation(1)).unwrap(),
            Outcome::Silent
        );
        let mut bytes = Command::operation(0).to_bytes();
        bytes[0..4].copy_from_slice(&77u32.to_ne_bytes());
        assert!(
            session
                .handle(&mut Command::from_bytes(&bytes))
                .is_err_and(|e| !e.is_fatal())
        );
    }

    // Io on the queue trips a debug assertion in the worker.
    #[cfg(debug_assertions)]
    #[test]
    fn panicked_worker_does_not_keep_the_slot() {
        use crate::ipc::channel::ClientChannels;

        let config = MonitorConfig {
            namespace: format!("gloop_ut_panic_{}", std::process::id()),
            worker_poll: Duration::from_millis(2),
            ..MonitorConfig::default()
        };
        let server = Server::new(&config).0;
        let mut session = Session::new(Arc::clone(&server));
        if let Err(err) = session.handle(&mut Command::initialize()) {
            eprintln!("Skipping: shared memory unavailable: {err}");
            return;
        }
        let id = session.id();
        let client = ClientChannels::open(&config.namespace, id.get()).unwrap();
        client
            .requests
            .push_timeout(Command::lock(), Duration::from_secs(1))
            .unwrap();
        let reply = client.responses.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(reply.kind(), Ok(CommandKind::Lock));
        assert_eq!(server.holder(), Some(id));

        client
            .requests
            .push_timeout(Command::new(CommandKind::Io, 0), Duration::from_secs(1))
            .unwrap();
        let core = Arc::clone(session.core().unwrap());
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        // The worker's clone goes away once it has unwound.
        while Arc::strong_count(&core) > 2 {
            assert!(std::time::Instant::now() < deadline, "worker never panicked");
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(core.phase(), Phase::Holding);

        drop(client);
        drop(session);
        assert_eq!(server.holder(), None);
        assert_eq!(core.phase(), Phase::Idle);
    }
}
