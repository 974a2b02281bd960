//! Choosing which contender gets the launch slot next.

use super::server::SessionId;

/// A session that is currently trying to acquire the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub id: SessionId,
    /// Accumulated used time, in units.
    pub used: u64,
    /// Registration sequence number; lower registered earlier.
    pub order: u64,
}

/// Decides the next holder among contenders.
///
/// Called with the accounting lock held after every unlock, and under the
/// gate while waiters re-check admission. Must be cheap and must not block.
pub trait SchedulingPolicy: Send + Sync {
    fn select(&self, contenders: &[Candidate]) -> Option<SessionId>;
}

/// Least accumulated used time wins; ties go to the earliest registration.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeastUsed;

impl SchedulingPolicy for LeastUsed {
    fn select(&self, contenders: &[Candidate]) -> Option<SessionId> {
        contenders
            .iter()
            .min_by_key(|c| (c.used, c.order))
            .map(|c| c.id)
    }
}
