//! Compile-time limits and the runtime configuration of a monitor.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::num::{NonZeroU64, ParseIntError};
use std::time::Duration;

/// Capacity of each session's request and response queue, in commands.
pub const QUEUE_DEPTH: usize = 0x1000;

/// Size of each session's shared region. Byte 0 holds the abort word.
pub const SHARED_MEMORY_SIZE: usize = 4096;

/// Slots in the event loop's timing wheel; one slot per millisecond.
pub const WHEEL_SLOTS: usize = 512;

/// Concurrent timers the wheel can hold, one per holding session.
pub const WHEEL_CAPACITY: u32 = 256;

/// Watchdog requests buffered between workers and the event loop.
pub const WATCHDOG_QUEUE_DEPTH: usize = 1024;

pub const DEFAULT_PORT: u16 = 7171;
pub const DEFAULT_NAMESPACE: &str = "gloop";
pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_millis(20);
/// Nanoseconds of holding time per used-time unit.
pub const DEFAULT_COST_PER_UNIT: NonZeroU64 = NonZeroU64::new(1000).unwrap();
pub const DEFAULT_WORKER_POLL: Duration = Duration::from_millis(10);

/// Periodic reduction of every session's used time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecayConfig {
    pub interval: Duration,
    /// Units subtracted per interval; results clamp at zero.
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    pub bind_addr: SocketAddr,
    /// Reported in logs; defaults to the process id.
    pub server_id: u32,
    /// How often a holder is checked for waiting contenders.
    pub watchdog_interval: Duration,
    /// Holding time that accounts for one used-time unit, in nanoseconds.
    pub cost_per_unit: NonZeroU64,
    /// Upper bound a worker sleeps between checks of its stop flag.
    pub worker_poll: Duration,
    /// Prefix of every shared-memory name created by this monitor.
    pub namespace: String,
    pub decay: Option<DecayConfig>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            server_id: std::process::id(),
            watchdog_interval: DEFAULT_WATCHDOG_INTERVAL,
            cost_per_unit: DEFAULT_COST_PER_UNIT,
            worker_poll: DEFAULT_WORKER_POLL,
            namespace: DEFAULT_NAMESPACE.to_owned(),
            decay: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: `{value}` is not a number: {source}")]
    NotANumber {
        var: &'static str,
        value: String,
        source: ParseIntError,
    },
    #[error("{var}: `{value}` is not a socket address")]
    BadAddress { var: &'static str, value: String },
    #[error("watchdog interval {0:?} must be between 1ms and {max}ms", max = WHEEL_SLOTS - 1)]
    WatchdogInterval(Duration),
    #[error("cost per unit must be non-zero")]
    ZeroCost,
    #[error("namespace `{0}` must be 1..=64 characters of [A-Za-z0-9_.]")]
    Namespace(String),
    #[error("decay interval must be non-zero")]
    DecayInterval,
}

impl MonitorConfig {
    /// Defaults overridden by `GLOOP_*` environment variables.
    ///
    /// # Errors
    ///
    /// Any variable that is set but does not parse, or a resulting
    /// configuration that fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    ///
    /// # Errors
    ///
    /// See [`from_env`](Self::from_env).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let number = |var: &'static str| -> Result<Option<u64>, ConfigError> {
            lookup(var)
                .map(|value| {
                    value.trim().parse::<u64>().map_err(|source| ConfigError::NotANumber {
                        var,
                        value,
                        source,
                    })
                })
                .transpose()
        };

        let mut config = Self::default();
        if let Some(value) = lookup("GLOOP_BIND") {
            config.bind_addr = value.parse().map_err(|_| ConfigError::BadAddress {
                var: "GLOOP_BIND",
                value,
            })?;
        }
        if let Some(ms) = number("GLOOP_KILL_TIME")? {
            config.watchdog_interval = Duration::from_millis(ms);
        }
        if let Some(ns) = number("GLOOP_COST_PER_UNIT")? {
            config.cost_per_unit = NonZeroU64::new(ns).ok_or(ConfigError::ZeroCost)?;
        }
        if let Some(ns) = lookup("GLOOP_NAMESPACE") {
            config.namespace = ns;
        }
        if let Some(ms) = number("GLOOP_DECAY_INTERVAL")? {
            let amount = number("GLOOP_DECAY_AMOUNT")?.unwrap_or(1);
            config.decay = Some(DecayConfig {
                interval: Duration::from_millis(ms),
                amount,
            });
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks the values the event loop relies on.
    ///
    /// # Errors
    ///
    /// A watchdog interval that does not fit the timing wheel, an unusable
    /// namespace, or a zero decay interval.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let max = Duration::from_millis(WHEEL_SLOTS as u64 - 1);
        if self.watchdog_interval < Duration::from_millis(1) || self.watchdog_interval > max {
            return Err(ConfigError::WatchdogInterval(self.watchdog_interval));
        }
        let ns = &self.namespace;
        if ns.is_empty()
            || ns.len() > 64
            || !ns.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        {
            return Err(ConfigError::Namespace(ns.clone()));
        }
        if self.decay.is_some_and(|d| d.interval.is_zero()) {
            return Err(ConfigError::DecayInterval);
        }
        Ok(())
    }

    /// Watchdog interval in wheel ticks.
    #[must_use]
    pub fn watchdog_ticks(&self) -> u64 {
        self.watchdog_interval.as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = MonitorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.watchdog_ticks(), 20);
        assert_eq!(config.cost_per_unit.get(), 1000);
        assert_eq!(config.namespace, "gloop");
        assert!(config.decay.is_none());
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = MonitorConfig::from_lookup(lookup(&[
            ("GLOOP_BIND", "127.0.0.1:9000"),
            ("GLOOP_KILL_TIME", "50"),
            ("GLOOP_COST_PER_UNIT", "250"),
            ("GLOOP_NAMESPACE", "lab"),
            ("GLOOP_DECAY_INTERVAL", "100"),
            ("GLOOP_DECAY_AMOUNT", "7"),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.watchdog_interval, Duration::from_millis(50));
        assert_eq!(config.cost_per_unit.get(), 250);
        assert_eq!(config.namespace, "lab");
        assert_eq!(
            config.decay,
            Some(DecayConfig {
                interval: Duration::from_millis(100),
                amount: 7
            })
        );
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(matches!(
            MonitorConfig::from_lookup(lookup(&[("GLOOP_KILL_TIME", "soon")])),
            Err(ConfigError::NotANumber { var: "GLOOP_KILL_TIME", .. })
        ));
        assert!(matches!(
            MonitorConfig::from_lookup(lookup(&[("GLOOP_KILL_TIME", "0")])),
            Err(ConfigError::WatchdogInterval(_))
        ));
        assert!(matches!(
            MonitorConfig::from_lookup(lookup(&[("GLOOP_KILL_TIME", "512")])),
            Err(ConfigError::WatchdogInterval(_))
        ));
        assert!(matches!(
            MonitorConfig::from_lookup(lookup(&[("GLOOP_COST_PER_UNIT", "0")])),
            Err(ConfigError::ZeroCost)
        ));
        assert!(matches!(
            MonitorConfig::from_lookup(lookup(&[("GLOOP_NAMESPACE", "a/b")])),
            Err(ConfigError::Namespace(_))
        ));
        assert!(matches!(
            MonitorConfig::from_lookup(lookup(&[("GLOOP_BIND", "nowhere")])),
            Err(ConfigError::BadAddress { .. })
        ));
    }
}
