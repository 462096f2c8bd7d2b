//! Logging and tracing initialization.
//!
//! Structured logging through the `tracing` ecosystem, printed either as
//! human-readable lines or as JSON for log collectors.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Configuration for the logging system.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    /// Output logs as JSON
    pub json: bool,
    /// Sets the default level to DEBUG
    pub verbose: bool,
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the default filter. Calling this twice is a no-op for the
/// second call, which keeps integration tests that share a process quiet.
pub fn init(config: LogConfig) {
    let default_level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "recordcopy={}",
            default_level.as_str().to_lowercase()
        ))
    });

    let result = if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .with_thread_ids(false),
            )
            .try_init()
    };

    if let Err(e) = result {
        tracing::debug!(error = %e, "Logging already initialized");
    }
}

/// Rate limiter for repetitive log lines, such as a status endpoint failing on
/// every poll.
///
/// ```ignore
/// let throttle = LogThrottle::new(Duration::from_secs(30));
/// if let Some(suppressed) = throttle.check() {
///     tracing::warn!(suppressed, error = %e, "Status poll failed");
/// }
/// ```
pub struct LogThrottle {
    interval_ms: u64,
    /// Last log time in ms since `start`, or `NEVER_LOGGED`
    last_log_ms: AtomicU64,
    suppressed: AtomicU64,
    start: Instant,
}

const NEVER_LOGGED: u64 = u64::MAX;

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            last_log_ms: AtomicU64::new(NEVER_LOGGED),
            suppressed: AtomicU64::new(0),
            start: Instant::now(),
        }
    }

    /// Returns `Some(n)` when the caller should log now, where `n` is the number of
    /// messages swallowed since the previous log. Returns `None` otherwise.
    pub fn check(&self) -> Option<u64> {
        let now_ms = self.start.elapsed().as_millis() as u64;
        let last = self.last_log_ms.load(Ordering::Relaxed);

        let due = last == NEVER_LOGGED || now_ms.saturating_sub(last) >= self.interval_ms;
        if due
            && self
                .last_log_ms
                .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            return Some(self.suppressed.swap(0, Ordering::Relaxed));
        }

        self.suppressed.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Allow the next message through immediately, e.g. after the failure cleared.
    pub fn reset(&self) {
        self.last_log_ms.store(NEVER_LOGGED, Ordering::Relaxed);
        self.suppressed.store(0, Ordering::Relaxed);
    }
}
