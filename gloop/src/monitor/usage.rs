//! Holding-time measurement and its conversion into used-time units.

use std::num::NonZeroU64;
use std::time::Duration;

use minstant::Instant;

/// Converts a holding duration into used-time units, `cost` nanoseconds each.
#[must_use]
pub fn units_for(elapsed: Duration, cost: NonZeroU64) -> u64 {
    let units = elapsed.as_nanos() / u128::from(cost.get());
    u64::try_from(units).unwrap_or(u64::MAX)
}

/// Stopwatch for one lock hold.
#[derive(Debug, Default)]
pub struct TimeWatch {
    started: Option<Instant>,
}

impl TimeWatch {
    #[must_use]
    pub const fn new() -> Self {
        Self { started: None }
    }

    pub fn begin(&mut self) {
        self.started = Some(Instant::now());
    }

    /// Stops the watch and returns the time since [`begin`](Self::begin);
    /// zero when it was not running.
    pub fn end(&mut self) -> Duration {
        self.started
            .take()
            .map_or(Duration::ZERO, |start| start.elapsed())
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.started.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn units_round_down() {
        let cost = NonZeroU64::new(1000).unwrap();
        assert_eq!(units_for(Duration::from_nanos(999), cost), 0);
        assert_eq!(units_for(Duration::from_micros(5), cost), 5);
        assert_eq!(units_for(Duration::MAX, NonZeroU64::MIN), u64::MAX);
    }

    #[test]
    fn watch_measures_one_hold() {
        let mut watch = TimeWatch::new();
        assert_eq!(watch.end(), Duration::ZERO);
        watch.begin();
        assert!(watch.is_running());
        std::thread::sleep(Duration::from_millis(2));
        assert!(watch.end() >= Duration::from_millis(2));
        assert!(!watch.is_running());
        assert_eq!(watch.end(), Duration::ZERO);
    }
}
