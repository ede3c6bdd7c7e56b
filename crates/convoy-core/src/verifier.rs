//! Pipeline completion verification.
//!
//! Every unit of work is expected to pass through the full agent pipeline.
//! After a session finishes, the verifier compares the stages observed in the
//! session's stage log against the fixed expected sequence and, when stages
//! are missing, decides whether a loop-back retry of the missing stages is
//! warranted. The decision is advisory: the verifier always completes its own
//! check and hands the retry request to the caller as a persisted loop-back
//! checkpoint. It never blocks the caller's lifecycle.
//!
//! The retry decision uses the same bounded-retry/circuit-breaker/backoff
//! family as feature dispatch, parameterized independently so pipeline
//! verification can be stricter or looser than feature retries.

use crate::loop_state::LoopState;
use crate::retry::{RetryBlock, RetryPolicy};
use crate::stage_log::StageLog;
use crate::state_store::{StateStore, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// The fixed agent pipeline, in execution order.
pub const PIPELINE_STAGES: [&str; 8] = [
    "researcher",
    "planner",
    "test-writer",
    "implementer",
    "reviewer",
    "refactorer",
    "documenter",
    "committer",
];

/// Outcome of comparing observed stages against the expected pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    /// Session that was checked.
    pub session_id: String,

    /// The expected stage sequence.
    pub expected: Vec<String>,

    /// Stages observed in the session log.
    pub observed: Vec<String>,

    /// Expected-but-absent stages, in expected order.
    pub missing: Vec<String>,
}

impl VerificationResult {
    /// Returns true if every expected stage was observed.
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// A persisted request to re-run missing pipeline stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopBackCheckpoint {
    /// Session to loop back.
    pub session_id: String,

    /// Stages to re-run, in expected order.
    pub missing_stages: Vec<String>,

    /// Which loop-back attempt this is (1-indexed).
    pub attempt: u32,

    /// Advisory backoff delay before the retry, in milliseconds.
    pub delay_ms: u64,

    /// When the checkpoint was created.
    pub created_at: DateTime<Utc>,
}

/// What the verifier concluded for a session.
#[derive(Debug)]
pub enum CompletionDecision {
    /// All expected stages ran.
    Complete,

    /// Missing stages; a loop-back checkpoint was persisted.
    LoopBack(LoopBackCheckpoint),

    /// Missing stages, but retries are exhausted or blocked.
    GiveUp {
        /// The stages that never ran.
        missing: Vec<String>,
        /// Why no further loop-back is permitted.
        reason: RetryBlock,
    },
}

/// Errors from the verification flow.
#[derive(Debug, thiserror::Error)]
pub enum VerifierError {
    /// State persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Stage log could not be read.
    #[error("failed to read stage log: {0}")]
    StageLog(#[from] std::io::Error),
}

/// Verifies pipeline completion and drives bounded loop-back retries.
pub struct CompletionVerifier {
    policy: RetryPolicy,
    breaker_threshold: u32,
}

impl CompletionVerifier {
    /// Creates a verifier with its own retry parameterization.
    pub fn new(policy: RetryPolicy, breaker_threshold: u32) -> Self {
        Self {
            policy,
            breaker_threshold,
        }
    }

    /// Compares observed stages against the expected pipeline.
    pub fn verify(&self, session_id: &str, observed: &[String]) -> VerificationResult {
        let missing: Vec<String> = PIPELINE_STAGES
            .iter()
            .filter(|stage| !observed.iter().any(|o| o == *stage))
            .map(|s| (*s).to_string())
            .collect();

        VerificationResult {
            session_id: session_id.to_string(),
            expected: PIPELINE_STAGES.iter().map(|s| (*s).to_string()).collect(),
            observed: observed.to_vec(),
            missing,
        }
    }

    /// Full check for a session: read the stage log, verify, and decide.
    ///
    /// The verifier's own retry loop state is persisted under
    /// `verify-<session_id>` so repeated checks across process restarts keep
    /// counting toward the same bound. On an incomplete pipeline with retries
    /// available, a [`LoopBackCheckpoint`] is written for the caller.
    pub fn check_session(
        &self,
        store: &StateStore,
        stage_log: &StageLog,
        session_id: &str,
    ) -> Result<CompletionDecision, VerifierError> {
        let observed = stage_log.observed_stages(session_id)?;
        let result = self.verify(session_id, &observed);

        let loop_id = format!("verify-{session_id}");
        let mut loop_state = match store.load_loop(&loop_id) {
            Ok(state) => state,
            Err(StoreError::NotFound { .. }) => LoopState::new(&loop_id),
            Err(e) => return Err(e.into()),
        };

        if result.is_complete() {
            debug!(session_id, "Pipeline complete, all stages observed");
            if loop_state.iteration_count > 0 {
                loop_state.record_attempt(true, 0, None, self.breaker_threshold);
                store.save_loop(&loop_state)?;
            }
            return Ok(CompletionDecision::Complete);
        }

        info!(
            session_id,
            missing = ?result.missing,
            "Pipeline incomplete"
        );

        // Blocked checks are not attempts; recording one here would push
        // iteration_count past its ceiling.
        if let Err(reason) = self.policy.evaluate(&loop_state) {
            warn!(session_id, %reason, "Loop-back blocked, giving up");
            return Ok(CompletionDecision::GiveUp {
                missing: result.missing,
                reason,
            });
        }

        let attempt_index = loop_state.iteration_count;
        loop_state.record_attempt(
            false,
            0,
            Some(format!("missing stages: {}", result.missing.join(", "))),
            self.breaker_threshold,
        );
        store.save_loop(&loop_state)?;

        let checkpoint = LoopBackCheckpoint {
            session_id: session_id.to_string(),
            missing_stages: result.missing,
            attempt: loop_state.iteration_count,
            delay_ms: self.policy.delay_with_jitter(attempt_index).as_millis() as u64,
            created_at: Utc::now(),
        };
        store.save_loopback(session_id, &checkpoint)?;

        Ok(CompletionDecision::LoopBack(checkpoint))
    }
}
