//! Circuit breaker for the remote-tier connection.
//!
//! ```text
//!   Closed --(max_retries consecutive failures)--> Open
//!   Open   --(circuit_breaker_timeout elapsed)---> HalfOpen (one attempt)
//!   HalfOpen --success--> Closed
//!   HalfOpen --failure--> Open (window restarts)
//! ```
//!
//! The breaker itself is a plain state machine; time is passed in so it can be
//! driven by any clock.

use std::time::Duration;

use crate::clock::duration_millis;

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive connect failures before the circuit opens.
    pub max_retries: u32,
    /// How long the circuit stays open before a probe is allowed.
    pub circuit_breaker_timeout: Duration,
    /// Base delay for exponential backoff.
    pub base_delay: Duration,
    /// Cap on the backoff delay.
    pub max_delay: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            circuit_breaker_timeout: Duration::from_secs(60),
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BreakerConfig {
    /// Backoff before the retry that follows `failures` consecutive failures.
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Connections are attempted normally.
    Closed,
    /// No connection attempts until the timeout elapses.
    Open,
    /// The timeout has elapsed; the next operation may probe.
    HalfOpen,
}

/// What to do after a failed connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Schedule another attempt after this delay.
    RetryAfter(Duration),
    /// The circuit is open; stop retrying.
    Open,
}

/// Breaker state.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    is_open: bool,
    consecutive_failures: u32,
    last_failure_time: Option<i64>,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            is_open: false,
            consecutive_failures: 0,
            last_failure_time: None,
            probe_in_flight: false,
        }
    }

    /// Tuning in effect.
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Whether the circuit is open (including half-open).
    pub fn is_open(&self) -> bool {
        self.is_open
    }

    /// Consecutive failures since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Time of the last failure (epoch ms).
    pub fn last_failure_time(&self) -> Option<i64> {
        self.last_failure_time
    }

    /// State at `now`.
    pub fn state(&self, now: i64) -> BreakerState {
        if !self.is_open {
            BreakerState::Closed
        } else if self.window_elapsed(now) {
            BreakerState::HalfOpen
        } else {
            BreakerState::Open
        }
    }

    fn window_elapsed(&self, now: i64) -> bool {
        let timeout = duration_millis(self.config.circuit_breaker_timeout);
        self.last_failure_time
            .is_none_or(|last| now.saturating_sub(last) >= timeout)
    }

    /// A connection succeeded.
    pub fn record_success(&mut self) {
        self.is_open = false;
        self.consecutive_failures = 0;
        self.probe_in_flight = false;
    }

    /// A connection attempt failed at `now`.
    pub fn record_failure(&mut self, now: i64) -> FailureAction {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure_time = Some(now);
        self.probe_in_flight = false;

        if self.is_open || self.consecutive_failures >= self.config.max_retries {
            self.is_open = true;
            FailureAction::Open
        } else {
            FailureAction::RetryAfter(self.config.delay_for_attempt(self.consecutive_failures))
        }
    }

    /// Claim the single half-open probe. Returns `true` for exactly one caller
    /// per elapsed window.
    pub fn try_acquire_probe(&mut self, now: i64) -> bool {
        if !self.is_open || self.probe_in_flight || !self.window_elapsed(now) {
            return false;
        }
        self.probe_in_flight = true;
        true
    }

    /// Force the circuit open, as if `max_retries` failures just happened.
    pub fn trip(&mut self, now: i64) {
        self.is_open = true;
        self.consecutive_failures = self.consecutive_failures.max(self.config.max_retries);
        self.last_failure_time = Some(now);
        self.probe_in_flight = false;
    }
}
