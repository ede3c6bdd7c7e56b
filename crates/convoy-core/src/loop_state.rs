//! Persisted retry-loop state for a single unit of agent work.
//!
//! A loop is one retryable unit: the same piece of work handed to the agent
//! runtime up to `max_iterations` times. The state document is written after
//! every attempt so a process restart can pick up the retry decision exactly
//! where it left off.
//!
//! # Invariants
//!
//! - `circuit_breaker_open` is true iff `consecutive_failures` reached the
//!   threshold at some point since the last explicit reset. The flag is
//!   derived but persisted so `should_retry` checks need no recomputation.
//! - Once open, the flag survives later successes; only `reset_breaker()`
//!   clears it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One recorded attempt in a loop's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-indexed iteration this record belongs to.
    pub iteration: u32,

    /// Whether the attempt succeeded.
    pub success: bool,

    /// Short failure summary, if the attempt failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,

    /// When the attempt finished.
    pub timestamp: DateTime<Utc>,
}

/// Persistent state for one bounded retry loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopState {
    /// Identifier correlating to an external agent session.
    pub session_id: String,

    /// Attempts made so far.
    pub iteration_count: u32,

    /// Consecutive failures since the last success or reset.
    pub consecutive_failures: u32,

    /// Latched open once consecutive failures hit the breaker threshold.
    pub circuit_breaker_open: bool,

    /// Cumulative token cost across all attempts.
    pub tokens_used: u64,

    /// Append-only attempt log.
    #[serde(default)]
    pub retry_history: Vec<AttemptRecord>,

    /// When this loop was created.
    pub created_at: DateTime<Utc>,

    /// When this loop was last updated.
    pub updated_at: DateTime<Utc>,
}

impl LoopState {
    /// Creates fresh loop state for a session.
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            iteration_count: 0,
            consecutive_failures: 0,
            circuit_breaker_open: false,
            tokens_used: 0,
            retry_history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Records the outcome of one attempt.
    ///
    /// Maintains the breaker latch: the flag is set the moment
    /// `consecutive_failures` reaches `breaker_threshold` and is never
    /// cleared here, even by a later success.
    pub fn record_attempt(
        &mut self,
        success: bool,
        tokens: u64,
        error_summary: Option<String>,
        breaker_threshold: u32,
    ) {
        self.iteration_count += 1;
        self.tokens_used = self.tokens_used.saturating_add(tokens);

        if success {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
            if self.consecutive_failures >= breaker_threshold.max(1) {
                self.circuit_breaker_open = true;
            }
        }

        self.retry_history.push(AttemptRecord {
            iteration: self.iteration_count,
            success,
            error_summary,
            timestamp: Utc::now(),
        });
        self.updated_at = Utc::now();
    }

    /// Administrative breaker reset.
    pub fn reset_breaker(&mut self) {
        self.consecutive_failures = 0;
        self.circuit_breaker_open = false;
        self.updated_at = Utc::now();
    }

    /// Returns the most recent attempt, if any.
    pub fn last_attempt(&self) -> Option<&AttemptRecord> {
        self.retry_history.last()
    }
}
