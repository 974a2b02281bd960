//! State shared by every session of one monitor.
//!
//! The launch slot is a single [`Gate`] behind one mutex and condition
//! variable. Waiters re-check admission on every wake-up, so spurious and
//! timed wake-ups are harmless. Used-time updates and the choice of the next
//! holder happen under a separate accounting lock, witnessed by
//! [`AccountingGuard`].
//!
//! Lock order: gate before registry, accounting before registry. The gate
//! and the accounting lock are never held together.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};

use minstant::Instant;

use super::fairness::{Candidate, LeastUsed, SchedulingPolicy};
use super::session::SessionCore;
use super::watchdog::{WatchdogRequest, WatchdogRequests};
use crate::config::{MonitorConfig, WATCHDOG_QUEUE_DEPTH};
use crate::sync::mpsc::{self, Sender};
use crate::trace::warn;

/// Identifier handed to a client during the handshake. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u32);

impl SessionId {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Point-in-time view of one registered session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub id: SessionId,
    pub used: u64,
    pub attempting: bool,
    pub holding: bool,
}

/// The acquiring session was told to stop while waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("session stopped while waiting for the launch slot")]
pub struct Cancelled;

struct Registration {
    id: SessionId,
    order: u64,
    core: Weak<SessionCore>,
}

#[derive(Debug, Default)]
struct Gate {
    holder: Option<SessionId>,
    /// Chosen at the last release; honored for one watchdog interval.
    next: Option<(SessionId, Instant)>,
}

/// Proof that the accounting lock is held.
pub struct AccountingGuard<'a> {
    _held: MutexGuard<'a, ()>,
}

pub struct Server {
    config: MonitorConfig,
    next_session: AtomicU32,
    next_order: AtomicU64,
    registry: Mutex<Vec<Registration>>,
    gate: Mutex<Gate>,
    released: Condvar,
    accounting: Mutex<()>,
    policy: Box<dyn SchedulingPolicy>,
    watchdog: Sender<WatchdogRequest, WATCHDOG_QUEUE_DEPTH>,
}

impl Server {
    /// A server using [`LeastUsed`], plus the receiving end of its watchdog requests.
    #[must_use]
    pub fn new(config: &MonitorConfig) -> (Arc<Self>, WatchdogRequests) {
        Self::with_policy(config, Box::new(LeastUsed))
    }

    #[must_use]
    pub fn with_policy(
        config: &MonitorConfig,
        policy: Box<dyn SchedulingPolicy>,
    ) -> (Arc<Self>, WatchdogRequests) {
        let (watchdog, requests) = mpsc::channel();
        let server = Self {
            config: config.clone(),
            next_session: AtomicU32::new(1),
            next_order: AtomicU64::new(0),
            registry: Mutex::new(Vec::new()),
            gate: Mutex::new(Gate::default()),
            released: Condvar::new(),
            accounting: Mutex::new(()),
            policy,
            watchdog,
        };
        (Arc::new(server), requests)
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.config.server_id
    }

    #[must_use]
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub(crate) fn allocate_id(&self) -> SessionId {
        SessionId(self.next_session.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn register(&self, core: &Arc<SessionCore>) {
        let order = self.next_order.fetch_add(1, Ordering::Relaxed);
        self.lock_registry().push(Registration {
            id: core.id(),
            order,
            core: Arc::downgrade(core),
        });
    }

    /// Removes `id` from scheduling and wakes waiters, who may now be admitted.
    pub(crate) fn unregister(&self, id: SessionId) {
        self.lock_registry().retain(|r| r.id != id);
        self.wake_all();
    }

    #[must_use]
    pub fn session(&self, id: SessionId) -> Option<Arc<SessionCore>> {
        self.lock_registry()
            .iter()
            .find(|r| r.id == id)
            .and_then(|r| r.core.upgrade())
    }

    #[must_use]
    pub fn holder(&self) -> Option<SessionId> {
        self.lock_gate().holder
    }

    /// Every registered session, in registration order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SessionStatus> {
        let holder = self.holder();
        self.lock_registry()
            .iter()
            .filter_map(|r| r.core.upgrade())
            .map(|core| SessionStatus {
                id: core.id(),
                used: core.used(),
                attempting: core.is_attempting(),
                holding: holder == Some(core.id()),
            })
            .collect()
    }

    /// Whether a session other than `id` is trying to acquire the slot.
    #[must_use]
    pub fn has_other_contender(&self, id: SessionId) -> bool {
        self.candidates(SessionCore::is_attempting)
            .iter()
            .any(|c| c.id != id)
    }

    /// Blocks until `core` is admitted as the holder or told to stop.
    pub(crate) fn acquire(&self, core: &SessionCore) -> Result<(), Cancelled> {
        let mut gate = self.lock_gate();
        core.set_waiting(true);
        loop {
            if core.is_stopping() {
                core.set_waiting(false);
                core.set_attempting(false);
                drop(gate);
                self.released.notify_all();
                return Err(Cancelled);
            }
            if gate.holder.is_none() && self.is_allowed(&gate, core.id()) {
                gate.holder = Some(core.id());
                gate.next = None;
                core.set_waiting(false);
                core.set_attempting(false);
                return Ok(());
            }
            gate = self
                .released
                .wait_timeout(gate, self.config.watchdog_interval)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    // The designated session keeps priority while it still contends and its
    // grace period lasts; otherwise the policy picks among the waiters.
    fn is_allowed(&self, gate: &Gate, id: SessionId) -> bool {
        if let Some((next, since)) = gate.next
            && since.elapsed() < self.config.watchdog_interval
            && self.session(next).is_some_and(|core| core.is_attempting())
        {
            return next == id;
        }
        self.policy.select(&self.candidates(SessionCore::is_waiting)) == Some(id)
    }

    /// Gives the slot up and records who should get it next.
    pub(crate) fn release(&self, id: SessionId, next: Option<SessionId>) {
        let mut gate = self.lock_gate();
        if gate.holder == Some(id) {
            gate.holder = None;
            gate.next = next.map(|n| (n, Instant::now()));
        }
        drop(gate);
        self.released.notify_all();
    }

    /// Wakes every waiter so it re-checks admission and its stop flag.
    pub fn wake_all(&self) {
        drop(self.lock_gate());
        self.released.notify_all();
    }

    pub fn accounting(&self) -> AccountingGuard<'_> {
        AccountingGuard {
            _held: self
                .accounting
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// The contender that should hold the slot next, if anyone is attempting.
    #[must_use]
    pub fn calculate_next_session(&self, _accounting: &AccountingGuard<'_>) -> Option<SessionId> {
        self.policy
            .select(&self.candidates(SessionCore::is_attempting))
    }

    /// Subtracts `amount` from the used time of `id`, clamping at zero.
    pub fn decay(&self, id: SessionId, amount: u64) -> bool {
        let Some(core) = self.session(id) else {
            return false;
        };
        core.burn_used(&self.accounting(), amount);
        true
    }

    /// [`decay`](Self::decay) for every registered session.
    pub fn decay_all(&self, amount: u64) {
        let accounting = self.accounting();
        for core in self.live() {
            core.burn_used(&accounting, amount);
        }
    }

    /// Overwrites the used time of `id`.
    pub fn set_used(&self, id: SessionId, units: u64) -> bool {
        let Some(core) = self.session(id) else {
            return false;
        };
        core.set_used(&self.accounting(), units);
        true
    }

    pub(crate) fn request_watchdog(&self, request: WatchdogRequest) {
        if let Err(request) = self.watchdog.try_send(request) {
            warn!(server = self.id(), ?request, "watchdog queue full, request dropped");
        }
    }

    fn candidates(&self, include: impl Fn(&SessionCore) -> bool) -> Vec<Candidate> {
        self.lock_registry()
            .iter()
            .filter_map(|r| {
                let core = r.core.upgrade()?;
                include(&core).then(|| Candidate {
                    id: r.id,
                    used: core.used(),
                    order: r.order,
                })
            })
            .collect()
    }

    fn live(&self) -> Vec<Arc<SessionCore>> {
        self.lock_registry()
            .iter()
            .filter_map(|r| r.core.upgrade())
            .collect()
    }

    fn lock_gate(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_registry(&self) -> MutexGuard<'_, Vec<Registration>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn server() -> Arc<Server> {
        Server::new(&MonitorConfig::default()).0
    }

    fn core(server: &Arc<Server>) -> Arc<SessionCore> {
        let core = SessionCore::detached(server.allocate_id(), Arc::clone(server));
        server.register(&core);
        core
    }

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(std::time::Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn ids_start_at_one() {
        let server = server();
        assert_eq!(server.allocate_id(), SessionId::new(1));
        assert_eq!(server.allocate_id(), SessionId::new(2));
    }

    #[test]
    fn lone_session_is_admitted() {
        let server = server();
        let a = core(&server);
        a.set_attempting(true);
        server.acquire(&a).unwrap();
        assert_eq!(server.holder(), Some(a.id()));
        assert!(!a.is_attempting());
        server.release(a.id(), None);
        assert_eq!(server.holder(), None);
    }

    #[test]
    fn next_session_prefers_least_used_then_registration() {
        let server = server();
        let a = core(&server);
        let b = core(&server);
        let c = core(&server);
        {
            let accounting = server.accounting();
            a.set_used(&accounting, 10);
            b.set_used(&accounting, 5);
            c.set_used(&accounting, 5);
        }
        for s in [&a, &b, &c] {
            s.set_attempting(true);
        }
        assert_eq!(
            server.calculate_next_session(&server.accounting()),
            Some(b.id())
        );
        b.set_attempting(false);
        assert_eq!(
            server.calculate_next_session(&server.accounting()),
            Some(c.id())
        );
    }

    #[test]
    fn designated_session_wins_the_release() {
        let server = server();
        let holder = core(&server);
        let first = core(&server);
        let second = core(&server);

        holder.set_attempting(true);
        server.acquire(&holder).unwrap();

        let spawn = |core: &Arc<SessionCore>| {
            let (server, core) = (Arc::clone(&server), Arc::clone(core));
            core.set_attempting(true);
            thread::spawn(move || {
                server.acquire(&core).unwrap();
                let id = core.id();
                thread::sleep(Duration::from_millis(5));
                server.release(id, None);
                id
            })
        };
        let late = spawn(&second);
        wait_until("second to wait", || second.is_waiting());
        let early = spawn(&first);
        wait_until("first to wait", || first.is_waiting());

        let next = server.calculate_next_session(&server.accounting());
        assert_eq!(next, Some(first.id()));
        server.release(holder.id(), next);

        let a = early.join().unwrap();
        let b = late.join().unwrap();
        assert_eq!((a, b), (first.id(), second.id()));
    }

    #[test]
    fn stop_cancels_a_waiter() {
        let server = server();
        let holder = core(&server);
        let waiter = core(&server);
        holder.set_attempting(true);
        server.acquire(&holder).unwrap();

        waiter.set_attempting(true);
        let handle = {
            let (server, waiter) = (Arc::clone(&server), Arc::clone(&waiter));
            thread::spawn(move || server.acquire(&waiter))
        };
        wait_until("waiter to block", || waiter.is_waiting());
        waiter.stop();
        server.wake_all();
        assert_eq!(handle.join().unwrap(), Err(Cancelled));
        assert!(!waiter.is_attempting());
        assert_eq!(server.holder(), Some(holder.id()));
    }

    #[test]
    fn decay_clamps_at_zero() {
        let server = server();
        let a = core(&server);
        assert!(server.set_used(a.id(), 3));
        assert!(server.decay(a.id(), 2));
        assert_eq!(a.used(), 1);
        server.decay_all(10);
        assert_eq!(a.used(), 0);
        assert!(!server.decay(SessionId::new(999), 1));
    }

    #[test]
    fn unregistered_sessions_leave_the_snapshot() {
        let server = server();
        let a = core(&server);
        let b = core(&server);
        b.set_attempting(true);
        assert!(server.has_other_contender(a.id()));
        assert!(!server.has_other_contender(b.id()));

        server.unregister(b.id());
        let ids: Vec<_> = server.snapshot().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![a.id()]);
        assert!(!server.has_other_contender(a.id()));
    }
}
