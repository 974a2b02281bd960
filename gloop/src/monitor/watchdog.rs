//! Periodic preemption of a holder while others wait.
//!
//! Workers post [`WatchdogRequest`]s when a session gains or gives up the
//! slot; the event loop drains them, keeps one wheel timer per holder, and
//! on every expiry asks the holder to abort if another session contends.
//! Each hold has its own epoch, so an expiry that races with an unlock finds
//! a newer epoch and does nothing.

use std::collections::HashMap;

use super::server::{Server, SessionId};
use crate::config::WATCHDOG_QUEUE_DEPTH;
use crate::sync::mpsc::Receiver;
use crate::timing::{TimerHandle, Wheel};
use crate::trace::{info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogRequest {
    /// `session` started holding the slot; `epoch` names this hold.
    Arm { session: SessionId, epoch: u64 },
    Disarm { session: SessionId },
}

pub type WatchdogRequests = Receiver<WatchdogRequest, WATCHDOG_QUEUE_DEPTH>;

/// Payload of a watchdog timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expiry {
    session: SessionId,
    epoch: u64,
}

pub struct Watchdog<'id> {
    interval: u64,
    timers: HashMap<SessionId, TimerHandle<'id>>,
    expired: Vec<Expiry>,
}

impl<'id> Watchdog<'id> {
    /// Checks each holder every `interval` wheel ticks.
    #[must_use]
    pub fn new(interval: u64) -> Self {
        Self {
            interval,
            timers: HashMap::new(),
            expired: Vec::new(),
        }
    }

    /// Applies pending requests, then handles every expired timer.
    pub fn service<const SLOTS: usize>(
        &mut self,
        wheel: &mut Wheel<'id, Expiry, SLOTS>,
        server: &Server,
        requests: &WatchdogRequests,
    ) {
        for request in requests.drain() {
            match request {
                WatchdogRequest::Arm { session, epoch } => {
                    self.disarm(wheel, session);
                    self.arm(wheel, session, epoch);
                }
                WatchdogRequest::Disarm { session } => self.disarm(wheel, session),
            }
        }

        let mut expired = std::mem::take(&mut self.expired);
        wheel.tick_now(|_, expiry| expired.push(expiry));
        for expiry in expired.drain(..) {
            self.timers.remove(&expiry.session);
            let Some(core) = server.session(expiry.session) else {
                continue;
            };
            if !core.is_armed(expiry.epoch) {
                continue;
            }
            if server.has_other_contender(expiry.session) && core.preempt(expiry.epoch) {
                info!(server = server.id(), session = %expiry.session, "preempting holder");
            }
            self.arm(wheel, expiry.session, expiry.epoch);
        }
        self.expired = expired;
    }

    /// Sessions with a pending timer.
    #[must_use]
    pub fn armed(&self) -> usize {
        self.timers.len()
    }

    fn arm<const SLOTS: usize>(
        &mut self,
        wheel: &mut Wheel<'id, Expiry, SLOTS>,
        session: SessionId,
        epoch: u64,
    ) {
        match wheel.schedule_after(self.interval, Expiry { session, epoch }) {
            Ok(handle) => {
                trace!(%session, epoch, "watchdog armed");
                self.timers.insert(session, handle);
            }
            Err(err) => {
                warn!(%session, %err, "cannot arm watchdog");
            }
        }
    }

    fn disarm<const SLOTS: usize>(
        &mut self,
        wheel: &mut Wheel<'id, Expiry, SLOTS>,
        session: SessionId,
    ) {
        if let Some(handle) = self.timers.remove(&session) {
            wheel.cancel(&handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::config::MonitorConfig;
    use crate::monitor::session::SessionCore;
    use crate::timing::with_wheel;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn requests_arm_and_disarm_timers() {
        let (server, requests) = Server::new(&MonitorConfig::default());
        with_wheel::<Expiry, 64, _>(8, |wheel| {
            let mut watchdog = Watchdog::new(20);
            let id = SessionId::new(4);
            server.request_watchdog(WatchdogRequest::Arm { session: id, epoch: 1 });
            watchdog.service(wheel, &server, &requests);
            assert_eq!(watchdog.armed(), 1);

            server.request_watchdog(WatchdogRequest::Arm { session: id, epoch: 2 });
            watchdog.service(wheel, &server, &requests);
            assert_eq!((watchdog.armed(), wheel.len()), (1, 1));

            server.request_watchdog(WatchdogRequest::Disarm { session: id });
            watchdog.service(wheel, &server, &requests);
            assert_eq!((watchdog.armed(), wheel.len()), (0, 0));
        });
    }

    #[test]
    fn holder_without_rivals_is_left_alone_and_rearmed() {
        let (server, requests) = Server::new(&MonitorConfig::default());
        let holder = SessionCore::detached(server.allocate_id(), Arc::clone(&server));
        server.register(&holder);
        holder.dispatch(&mut Command::lock());

        with_wheel::<Expiry, 64, _>(8, |wheel| {
            let mut watchdog = Watchdog::new(1);
            watchdog.service(wheel, &server, &requests);
            std::thread::sleep(Duration::from_millis(5));
            watchdog.service(wheel, &server, &requests);
            assert_eq!(watchdog.armed(), 1);
            assert_eq!(holder.preemptions(), 0);
        });
    }

    #[test]
    fn holder_is_preempted_when_someone_waits() {
        let (server, requests) = Server::new(&MonitorConfig::default());
        let holder = SessionCore::detached(server.allocate_id(), Arc::clone(&server));
        let rival = SessionCore::detached(server.allocate_id(), Arc::clone(&server));
        server.register(&holder);
        server.register(&rival);
        holder.dispatch(&mut Command::lock());
        rival.set_attempting(true);

        with_wheel::<Expiry, 64, _>(8, |wheel| {
            let mut watchdog = Watchdog::new(1);
            watchdog.service(wheel, &server, &requests);
            std::thread::sleep(Duration::from_millis(5));
            watchdog.service(wheel, &server, &requests);
            assert_eq!(holder.preemptions(), 1);
            assert_eq!(watchdog.armed(), 1, "re-armed after firing");
        });
    }

    #[test]
    fn stale_epoch_is_ignored() {
        let (server, requests) = Server::new(&MonitorConfig::default());
        let holder = SessionCore::detached(server.allocate_id(), Arc::clone(&server));
        let rival = SessionCore::detached(server.allocate_id(), Arc::clone(&server));
        server.register(&holder);
        server.register(&rival);
        holder.dispatch(&mut Command::lock());
        rival.set_attempting(true);
        server.request_watchdog(WatchdogRequest::Arm {
            session: holder.id(),
            epoch: holder.epoch() - 1,
        });

        with_wheel::<Expiry, 64, _>(8, |wheel| {
            let mut watchdog = Watchdog::new(1);
            watchdog.service(wheel, &server, &requests);
            std::thread::sleep(Duration::from_millis(5));
            watchdog.service(wheel, &server, &requests);
            assert_eq!(holder.preemptions(), 0);
            assert_eq!(watchdog.armed(), 0);
        });
    }
}
