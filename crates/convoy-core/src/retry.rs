//! Retry eligibility and backoff computation.
//!
//! The policy is a pure decision component: it answers "may this loop try
//! again?" and "how long should the caller wait first?", and never sleeps
//! itself. Sleeping (or scheduling a deferred retry) is the orchestrator's
//! job, which keeps every decision here synchronous and testable.
//!
//! # Design
//!
//! - **Precedence**: iteration cap, then circuit breaker, then token budget.
//!   Callers surfacing a single blocking reason report the first match.
//! - **Backoff**: `base_delay * 2^attempt`, capped at `max_delay`, with a
//!   uniform jitter of up to ±`jitter_ratio` to spread simultaneous retries.

use crate::loop_state::LoopState;
use rand::Rng;
use std::time::Duration;

/// Default ceiling on attempts per loop.
pub const DEFAULT_MAX_ITERATIONS: u32 = 5;

/// Default base backoff delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 100;

/// Default backoff cap in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 1600;

/// Default cumulative token budget per loop.
pub const DEFAULT_TOKEN_LIMIT: u64 = 1_000_000;

/// Default jitter as a fraction of the computed delay.
pub const DEFAULT_JITTER_RATIO: f64 = 0.2;

/// Why a retry was blocked.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RetryBlock {
    /// The loop hit its attempt ceiling.
    #[error("iteration cap reached: {iterations}/{max}")]
    IterationCap {
        /// Attempts made so far.
        iterations: u32,
        /// The configured ceiling.
        max: u32,
    },

    /// The circuit breaker is latched open.
    #[error("circuit breaker open after {consecutive_failures} consecutive failures")]
    CircuitOpen {
        /// Consecutive failures recorded when checked.
        consecutive_failures: u32,
    },

    /// The cumulative token budget is exhausted.
    #[error("token budget exhausted: {used} used of {limit}")]
    TokenBudget {
        /// Tokens consumed so far.
        used: u64,
        /// The configured budget.
        limit: u64,
    },
}

/// Retry eligibility and backoff policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts per loop.
    pub max_iterations: u32,

    /// Base backoff delay.
    pub base_delay: Duration,

    /// Backoff cap.
    pub max_delay: Duration,

    /// Cumulative token budget.
    pub token_limit: u64,

    /// Uniform jitter fraction applied to computed delays (0.0 disables).
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            token_limit: DEFAULT_TOKEN_LIMIT,
            jitter_ratio: DEFAULT_JITTER_RATIO,
        }
    }
}

impl RetryPolicy {
    /// Decides whether another attempt is permitted for this loop.
    ///
    /// Returns `Err` with the first blocking reason in precedence order:
    /// iteration cap, circuit breaker, token budget.
    pub fn evaluate(&self, state: &LoopState) -> Result<(), RetryBlock> {
        if state.iteration_count >= self.max_iterations {
            return Err(RetryBlock::IterationCap {
                iterations: state.iteration_count,
                max: self.max_iterations,
            });
        }

        if state.circuit_breaker_open {
            return Err(RetryBlock::CircuitOpen {
                consecutive_failures: state.consecutive_failures,
            });
        }

        if state.tokens_used > self.token_limit {
            return Err(RetryBlock::TokenBudget {
                used: state.tokens_used,
                limit: self.token_limit,
            });
        }

        Ok(())
    }

    /// Convenience wrapper over [`evaluate`](Self::evaluate).
    pub fn should_retry(&self, state: &LoopState) -> bool {
        self.evaluate(state).is_ok()
    }

    /// Exponential backoff without jitter: `base * 2^attempt`, capped.
    ///
    /// `attempt` is 0-based; at the defaults the sequence for attempts 0..=4
    /// is 100, 200, 400, 800, 1600 ms.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        // 2^attempt saturates well before overflow matters; the cap wins anyway
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let ms = base_ms.saturating_mul(factor);
        Duration::from_millis(ms.min(self.max_delay.as_millis() as u64))
    }

    /// Backoff with a uniform perturbation of up to ±`jitter_ratio`.
    ///
    /// The result is advisory; callers sleep or schedule it themselves.
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let base = self.delay(attempt);
        if self.jitter_ratio <= 0.0 {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter_ratio..=self.jitter_ratio);
        let ms = base.as_millis() as f64 * (1.0 + spread);
        Duration::from_millis(ms.max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter_policy() -> RetryPolicy {
        RetryPolicy {
            jitter_ratio: 0.0,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_delay_sequence_at_defaults() {
        let policy = no_jitter_policy();
        let delays: Vec<u64> = (0..5).map(|k| policy.delay(k).as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600]);
    }

    #[test]
    fn test_delay_caps_at_max() {
        let policy = no_jitter_policy();
        assert_eq!(policy.delay(10).as_millis(), 1600);
        assert_eq!(policy.delay(63).as_millis(), 1600);
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 0..5 {
            let base = policy.delay(attempt).as_millis() as f64;
            for _ in 0..50 {
                let jittered = policy.delay_with_jitter(attempt).as_millis() as f64;
                assert!(jittered >= base * 0.8 - 1.0, "{jittered} below bound");
                assert!(jittered <= base * 1.2 + 1.0, "{jittered} above bound");
            }
        }
    }

    #[test]
    fn test_fresh_loop_may_retry() {
        let policy = RetryPolicy::default();
        let state = LoopState::new("s");
        assert!(policy.should_retry(&state));
    }

    #[test]
    fn test_iteration_cap_blocks() {
        let policy = RetryPolicy::default();
        let mut state = LoopState::new("s");
        for _ in 0..5 {
            state.record_attempt(true, 0, None, 3);
        }

        let block = policy.evaluate(&state).unwrap_err();
        assert_eq!(
            block,
            RetryBlock::IterationCap {
                iterations: 5,
                max: 5
            }
        );
    }

    #[test]
    fn test_circuit_open_blocks() {
        let policy = RetryPolicy::default();
        let mut state = LoopState::new("s");
        for _ in 0..3 {
            state.record_attempt(false, 0, Some("x".into()), 3);
        }

        let block = policy.evaluate(&state).unwrap_err();
        assert!(matches!(block, RetryBlock::CircuitOpen { .. }));
    }

    #[test]
    fn test_token_budget_blocks() {
        let policy = RetryPolicy {
            token_limit: 100,
            ..RetryPolicy::default()
        };
        let mut state = LoopState::new("s");
        state.record_attempt(true, 101, None, 3);

        let block = policy.evaluate(&state).unwrap_err();
        assert_eq!(
            block,
            RetryBlock::TokenBudget {
                used: 101,
                limit: 100
            }
        );
    }

    #[test]
    fn test_token_budget_not_exceeded_at_limit() {
        // The budget blocks strictly above the limit, not at it
        let policy = RetryPolicy {
            token_limit: 100,
            ..RetryPolicy::default()
        };
        let mut state = LoopState::new("s");
        state.record_attempt(true, 100, None, 3);
        assert!(policy.should_retry(&state));
    }

    #[test]
    fn test_precedence_iteration_cap_first() {
        // A loop that is simultaneously capped, latched and over budget
        // reports the iteration cap.
        let policy = RetryPolicy {
            token_limit: 1,
            ..RetryPolicy::default()
        };
        let mut state = LoopState::new("s");
        for _ in 0..5 {
            state.record_attempt(false, 10, Some("x".into()), 3);
        }
        assert!(state.circuit_breaker_open);
        assert!(state.tokens_used > policy.token_limit);

        let block = policy.evaluate(&state).unwrap_err();
        assert!(matches!(block, RetryBlock::IterationCap { .. }));
    }

    #[test]
    fn test_precedence_breaker_before_budget() {
        let policy = RetryPolicy {
            token_limit: 1,
            ..RetryPolicy::default()
        };
        let mut state = LoopState::new("s");
        for _ in 0..3 {
            state.record_attempt(false, 10, Some("x".into()), 3);
        }

        let block = policy.evaluate(&state).unwrap_err();
        assert!(matches!(block, RetryBlock::CircuitOpen { .. }));
    }
}
