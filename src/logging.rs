//! Tracing setup for the daemon and the CLI.
//!
//! Every job phase transition is emitted as a structured event carrying
//! `target_id`, `job_id` and `phase`. Console output is the default; JSON is
//! meant for log shippers.

use std::time::{Duration, Instant};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::AppConfig;

/// Crates that are noisy at debug level and only interesting when they fail.
const QUIET_CRATES: &[&str] = &["reqwest", "hyper_util", "rusqlite"];

#[derive(Debug, Default, Clone, Copy)]
pub struct LogConfig {
    pub json: bool,
    /// Debug level for stowd's own events.
    pub verbose: bool,
}

impl From<&AppConfig> for LogConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            json: config.json_logs,
            verbose: config.verbose,
        }
    }
}

impl LogConfig {
    /// Filter used when `RUST_LOG` is not set.
    pub fn default_directives(&self) -> String {
        let level = if self.verbose { "debug" } else { "info" };
        let mut directives = vec![format!("stowd={}", level)];
        directives.extend(QUIET_CRATES.iter().map(|c| format!("{}=warn", c)));
        directives.join(",")
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `config`.
pub fn init(config: LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_directives()));

    let json = config
        .json
        .then(|| fmt::layer().json().with_current_span(true).flatten_event(true));
    let console = (!config.json).then(|| fmt::layer().with_target(false).compact());

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(console)
        .init();
}

/// Gate for progress lines in long copy loops.
///
/// Owned by one loop; `tick` returns true at most once per interval, and
/// always on the first call.
#[derive(Debug)]
pub struct LogThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn tick(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}
