//! Escalating wait for pollers with nothing to do.
//!
//! Spins briefly, then yields, then sleeps with a doubling interval capped
//! at [`MAX_SLEEP`]. An idle session worker therefore costs a wake-up per
//! millisecond instead of a whole core.

use std::time::Duration;

const SPIN_LIMIT: u32 = 64;
const YIELD_LIMIT: u32 = 16;
const MIN_SLEEP: Duration = Duration::from_micros(50);
pub const MAX_SLEEP: Duration = Duration::from_millis(1);

#[derive(Debug, Default)]
pub struct Backoff {
    step: u32,
    sleep: Duration,
}

impl Backoff {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            step: 0,
            sleep: Duration::ZERO,
        }
    }

    /// Waits a little longer than last time, never past `budget`.
    pub fn snooze(&mut self, budget: Duration) {
        if self.step < SPIN_LIMIT {
            std::hint::spin_loop();
        } else if self.step < SPIN_LIMIT + YIELD_LIMIT {
            std::thread::yield_now();
        } else {
            self.sleep = (self.sleep * 2).clamp(MIN_SLEEP, MAX_SLEEP);
            std::thread::sleep(self.sleep.min(budget));
        }
        self.step = self.step.saturating_add(1);
    }

    /// Starts over after useful work was found.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    #[must_use]
    pub fn is_sleeping(&self) -> bool {
        self.step >= SPIN_LIMIT + YIELD_LIMIT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minstant::Instant;

    #[test]
    fn escalates_to_sleeping_and_resets() {
        let mut backoff = Backoff::new();
        for _ in 0..SPIN_LIMIT + YIELD_LIMIT {
            assert!(!backoff.is_sleeping());
            backoff.snooze(MAX_SLEEP);
        }
        assert!(backoff.is_sleeping());

        let start = Instant::now();
        backoff.snooze(MAX_SLEEP);
        assert!(start.elapsed() >= MIN_SLEEP);

        backoff.reset();
        assert!(!backoff.is_sleeping());
    }

    #[test]
    fn sleep_never_exceeds_budget() {
        let mut backoff = Backoff::new();
        for _ in 0..200 {
            backoff.snooze(Duration::ZERO);
        }
        let start = Instant::now();
        backoff.snooze(Duration::ZERO);
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
