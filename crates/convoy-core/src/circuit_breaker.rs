//! Circuit breaker for retry loops.
//!
//! Tracks consecutive failures and latches open once a threshold is hit,
//! blocking further retries. The dominant failure mode this guards against is
//! a permanent error in generated code, which never self-heals with time, so
//! the breaker has no automatic half-open state: closing it again requires an
//! explicit administrative `reset()`.

use serde::{Deserialize, Serialize};

/// Default number of consecutive failures before the breaker opens.
pub const DEFAULT_BREAKER_THRESHOLD: u32 = 3;

/// A consecutive-failure latch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreaker {
    /// Consecutive failures recorded since the last success or reset.
    consecutive_failures: u32,

    /// Failures required to open the breaker.
    threshold: u32,

    /// Whether the breaker has latched open.
    open: bool,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_BREAKER_THRESHOLD)
    }
}

impl CircuitBreaker {
    /// Creates a closed breaker with the given threshold.
    ///
    /// A threshold of 0 is clamped to 1; a breaker that is born open would
    /// block every attempt.
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive_failures: 0,
            threshold: threshold.max(1),
            open: false,
        }
    }

    /// Records a failed attempt; opens the breaker at the threshold.
    ///
    /// Returns true if this call tripped the breaker open.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        if !self.open && self.consecutive_failures >= self.threshold {
            self.open = true;
            return true;
        }
        false
    }

    /// Records a successful attempt, resetting the failure counter.
    ///
    /// An already-open breaker stays open: success during a latched state is
    /// not trusted to mean the systemic problem is gone. Only `reset()`
    /// closes it.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Administrative reset: closes the breaker and clears the counter.
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.open = false;
    }

    /// Returns true if retries are currently blocked.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Current consecutive failure count.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// The configured threshold.
    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}
