//! gloop monitor daemon.
//!
//! Configuration comes from `GLOOP_*` environment variables, overridden by
//! the command line.
//!
//! ```sh
//! RUST_LOG=gloop=info gloop-monitor --bind 127.0.0.1:7171 --kill-time 20
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use gloop::config::{ConfigError, MonitorConfig};
use gloop::monitor::{Monitor, MonitorError};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Monitor(#[from] MonitorError),
}

fn main() {
    gloop::trace::init_tracing();
    if let Err(e) = run() {
        eprintln!("gloop-monitor: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(config) = parse_args(MonitorConfig::from_env()?, &args)? else {
        print_usage();
        return Ok(());
    };
    config.validate()?;

    let monitor = Monitor::spawn(config)?;
    eprintln!("gloop-monitor: listening on {}", monitor.local_addr());
    monitor.wait()?;
    Ok(())
}

/// Applies command-line overrides; `None` when help was requested.
fn parse_args(mut config: MonitorConfig, args: &[String]) -> Result<Option<MonitorConfig>, CliError> {
    let mut args = args.iter();
    while let Some(flag) = args.next() {
        let mut value = || {
            args.next()
                .ok_or_else(|| CliError::Usage(format!("missing value for {flag}")))
        };
        match flag.as_str() {
            "--bind" | "-b" => {
                let raw = value()?;
                config.bind_addr = raw
                    .parse::<SocketAddr>()
                    .map_err(|e| CliError::Usage(format!("--bind {raw}: {e}")))?;
            }
            "--kill-time" | "-k" => {
                let raw = value()?;
                let ms: u64 = raw
                    .parse()
                    .map_err(|e| CliError::Usage(format!("--kill-time {raw}: {e}")))?;
                config.watchdog_interval = Duration::from_millis(ms);
            }
            "--namespace" | "-n" => config.namespace.clone_from(value()?),
            "--help" | "-h" => return Ok(None),
            other => return Err(CliError::Usage(format!("unknown argument: {other}"))),
        }
    }
    Ok(Some(config))
}

fn print_usage() {
    eprintln!(
        r#"gloop-monitor - fair launch-slot scheduler for shared GPUs

USAGE:
    gloop-monitor [OPTIONS]

OPTIONS:
    -b, --bind <ADDR>         Handshake address (default: 127.0.0.1:7171, env GLOOP_BIND)
    -k, --kill-time <MS>      Watchdog interval (default: 20, env GLOOP_KILL_TIME)
    -n, --namespace <NAME>    Shared-memory name prefix (default: gloop, env GLOOP_NAMESPACE)
    -h, --help                Print this help message

ENVIRONMENT:
    GLOOP_COST_PER_UNIT       Nanoseconds of holding per used-time unit (default: 1000)
    GLOOP_DECAY_INTERVAL      Milliseconds between used-time decay steps (off by default)
    GLOOP_DECAY_AMOUNT        Units removed per decay step (default: 1)
    RUST_LOG                  Log filter when built with the `tracing` feature
"#
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn flags_override_config() {
        let config = parse_args(
            MonitorConfig::default(),
            &args(&["--bind", "127.0.0.1:0", "-k", "35", "--namespace", "lab"]),
        )
        .unwrap()
        .unwrap();
        assert_eq!(config.bind_addr.port(), 0);
        assert_eq!(config.watchdog_interval, Duration::from_millis(35));
        assert_eq!(config.namespace, "lab");
    }

    #[test]
    fn help_and_errors() {
        assert!(parse_args(MonitorConfig::default(), &args(&["-h"])).unwrap().is_none());
        assert!(parse_args(MonitorConfig::default(), &args(&["--bind"])).is_err());
        assert!(parse_args(MonitorConfig::default(), &args(&["--frobnicate"])).is_err());
    }
}
