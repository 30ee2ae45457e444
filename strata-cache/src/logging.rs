//! Logging setup and rate-limited warnings.
//!
//! Strata logs through `tracing`. Installing a subscriber is optional and
//! controlled by environment variables:
//!
//! - `STRATA_DEBUG=true|1|yes` - enable debug logging
//! - `STRATA_LOG_LEVEL=trace|debug|info|warn|error` - explicit level
//! - `STRATA_LOG_FORMAT=json|pretty|compact` - output format (default: json)
//!
//! ```rust,no_run
//! strata_cache::logging::init();
//! ```
//!
//! Inside the crate, use the tracing macros with structured fields:
//!
//! ```rust,ignore
//! debug!(key = %key, layer = %layer.name(), "cache hit");
//! warn!(error = %e, "remote tier unavailable");
//! ```
//!
//! A remote outage can fail every cache call, so warnings about it go through
//! a [`LogThrottle`].

use parking_lot::Mutex;
use std::env;
use std::sync::Once;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

static INIT: Once = Once::new();

/// Whether `STRATA_DEBUG` asks for debug logging.
#[inline]
pub fn is_debug_enabled() -> bool {
    env::var("STRATA_DEBUG")
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

/// Log level from `STRATA_LOG_LEVEL`, falling back to `debug` when
/// `STRATA_DEBUG` is set and `warn` otherwise.
pub fn get_log_level() -> &'static str {
    let fallback = if is_debug_enabled() { "debug" } else { "warn" };
    match env::var("STRATA_LOG_LEVEL") {
        Ok(level) => match level.to_lowercase().as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "info" => "info",
            "warn" => "warn",
            "error" => "error",
            _ => fallback,
        },
        Err(_) => fallback,
    }
}

/// Output format from `STRATA_LOG_FORMAT`.
pub fn get_log_format() -> &'static str {
    env::var("STRATA_LOG_FORMAT")
        .map(|f| match f.to_lowercase().as_str() {
            "pretty" => "pretty",
            "compact" => "compact",
            _ => "json",
        })
        .unwrap_or("json")
}

/// Install a subscriber according to the environment. Later calls are no-ops.
///
/// Does nothing unless `STRATA_DEBUG` or `STRATA_LOG_LEVEL` is set, or when
/// the `tracing-subscriber` feature is disabled.
pub fn init() {
    INIT.call_once(|| {
        if !is_debug_enabled() && env::var("STRATA_LOG_LEVEL").is_err() {
            return;
        }
        install(get_log_level());
    });
}

/// Install a subscriber at an explicit level. Later calls are no-ops.
pub fn init_with_level(level: &str) {
    INIT.call_once(|| install(level));
}

#[cfg(feature = "tracing-subscriber")]
fn install(level: &str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_new(format!(
        "strata={level},strata_cache={level},strata_redis={level}"
    ))
    .unwrap_or_else(|_| EnvFilter::new("warn"));

    let registry = tracing_subscriber::registry().with(filter);
    let result = match get_log_format() {
        "pretty" => registry.with(fmt::layer().pretty()).try_init(),
        "compact" => registry.with(fmt::layer().compact()).try_init(),
        _ => registry.with(fmt::layer().json()).try_init(),
    };
    if let Err(e) = result {
        eprintln!("strata: logging already initialized: {e}");
    }
}

#[cfg(not(feature = "tracing-subscriber"))]
fn install(_level: &str) {}

/// Debug log gated on `STRATA_DEBUG`, for hot paths where even building the
/// event is unwanted.
#[macro_export]
macro_rules! strata_debug {
    ($($arg:tt)*) => {
        if $crate::logging::is_debug_enabled() {
            tracing::debug!($($arg)*);
        }
    };
}

/// Lets one message through per interval and counts the rest.
#[derive(Debug)]
pub struct LogThrottle {
    interval: Duration,
    last: Mutex<Option<Instant>>,
    suppressed: AtomicU64,
}

impl LogThrottle {
    /// Create a throttle allowing one message per `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Returns `Some(suppressed_since_last)` when a message may be logged now.
    pub fn permit(&self) -> Option<u64> {
        let now = Instant::now();
        let mut last = self.last.lock();
        match *last {
            Some(prev) if now.duration_since(prev) < self.interval => {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                None
            }
            _ => {
                *last = Some(now);
                Some(self.suppressed.swap(0, Ordering::Relaxed))
            }
        }
    }
}

impl Default for LogThrottle {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_suppresses_within_interval() {
        let throttle = LogThrottle::new(Duration::from_secs(3600));
        assert_eq!(throttle.permit(), Some(0));
        assert_eq!(throttle.permit(), None);
        assert_eq!(throttle.permit(), None);
    }

    #[test]
    fn test_throttle_reports_suppressed_count() {
        let throttle = LogThrottle::new(Duration::ZERO);
        assert_eq!(throttle.permit(), Some(0));
        assert_eq!(throttle.permit(), Some(0));

        let throttle = LogThrottle::new(Duration::from_millis(20));
        assert_eq!(throttle.permit(), Some(0));
        assert_eq!(throttle.permit(), None);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(throttle.permit(), Some(1));
    }

    #[test]
    fn test_log_format_default() {
        // SAFETY: tests in this module do not read STRATA_LOG_FORMAT concurrently.
        unsafe { env::remove_var("STRATA_LOG_FORMAT") };
        assert_eq!(get_log_format(), "json");
    }
}
