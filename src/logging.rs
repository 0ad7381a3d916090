//! Logging and tracing initialization for slideq.
//!
//! Structured logging through the `tracing` ecosystem, with pretty console
//! output or JSON for machine parsing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::AppConfig;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LogConfig {
    /// One JSON object per line instead of human-readable output
    pub json: bool,
    /// Default to DEBUG instead of INFO
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
    pub fn default_directive(&self) -> String {
        let level = if self.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        };
        format!("slideq={}", level.as_str().to_lowercase())
    }
}

/// Install the global subscriber. Call once, after config is loaded.
/// `RUST_LOG` takes precedence over the configured level.
pub fn init(config: LogConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_directive()));

    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .init();
    }
}

const NEVER: u64 = u64::MAX;

/// Lets at most one log line through per interval. Used for per-job progress,
/// which the server can push several times a second.
pub struct LogThrottle {
    interval_ms: u64,
    origin: Instant,
    /// Milliseconds since `origin` of the last line let through, or `NEVER`.
    last_ms: AtomicU64,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            origin: Instant::now(),
            last_ms: AtomicU64::new(NEVER),
        }
    }

    /// True when the caller may log now. Concurrent callers racing for the
    /// same window get a single `true` between them.
    pub fn should_log(&self) -> bool {
        let now = u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX - 1);
        let last = self.last_ms.load(Ordering::Relaxed);
        if last != NEVER && now.saturating_sub(last) < self.interval_ms {
            return false;
        }
        self.last_ms
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_line_always_passes() {
        let throttle = LogThrottle::new(Duration::from_secs(1));
        assert!(throttle.should_log());
        assert!(!throttle.should_log());
    }

    #[test]
    fn zero_interval_never_throttles() {
        let throttle = LogThrottle::new(Duration::ZERO);
        assert!(throttle.should_log());
        assert!(throttle.should_log());
    }

    #[test]
    fn log_config_follows_app_config() {
        let mut app = AppConfig::default();
        app.json_logs = true;
        let config = LogConfig::from(&app);
        assert!(config.json);
        assert_eq!(config.default_directive(), "slideq=info");

        app.verbose = true;
        assert_eq!(LogConfig::from(&app).default_directive(), "slideq=debug");
    }
}
