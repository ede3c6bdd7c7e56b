//! Batch orchestration.
//!
//! The orchestrator drives a batch through its lifecycle: for each pending
//! feature in cursor order it dispatches the external agent runtime, records
//! the outcome, and persists state after every mutating step so a crash never
//! loses progress silently.
//!
//! # Design
//!
//! - **Per-feature retry loop**: transient failures re-queue the feature
//!   under the retry policy; its loop state (attempts, breaker latch, token
//!   cost) is persisted per attempt. Exhaustion fails the feature only.
//! - **Batch-level circuit breaker**: consecutive *feature* failures trip a
//!   breaker that pauses the whole batch — a run of failed features is a
//!   systemic problem, not a per-feature one.
//! - **Permanent failures never block the batch**: the feature is marked
//!   failed and the cursor advances.
//! - **Checkpoints**: a snapshot is written before every dispatch, the one
//!   point where an external restart can destroy in-memory context.

mod deps;

pub use deps::order_features;

use crate::batch_state::{BatchState, BatchStatus};
use crate::checkpoint::{CheckpointCoordinator, CheckpointError, ResumePosition};
use crate::circuit_breaker::CircuitBreaker;
use crate::classifier::{FailureClass, FailureClassifier, PatternClassifier};
use crate::config::ConvoyConfig;
use crate::dispatch::{AgentDispatch, DispatchOutcome};
use crate::feature::FeatureStatus;
use crate::issue_tracker::{IssueTracker, NoopIssueTracker};
use crate::loop_state::LoopState;
use crate::retry::RetryPolicy;
use crate::state_store::{StateStore, StoreError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Errors that abort a batch run.
///
/// Per-feature failures are recorded in state and never propagate; only
/// persistence failures surface here, because partial progress must not be
/// lost silently.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// State persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Checkpoint persistence failed.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Details of a batch-level circuit breaker trip.
#[derive(Debug, Clone)]
pub struct BreakerTrip {
    /// Index of the feature whose failure tripped the breaker.
    pub feature_index: usize,

    /// Consecutive feature failures at trip time.
    pub consecutive_failures: u32,
}

/// Per-feature entry in a batch summary.
#[derive(Debug, Clone)]
pub struct FeatureReport {
    /// The feature description.
    pub description: String,

    /// Final (or current) status.
    pub status: FeatureStatus,

    /// Attempts made.
    pub attempts: u32,

    /// Linked issue, if any.
    pub issue_number: Option<u64>,

    /// Last recorded error, if any.
    pub last_error: Option<String>,
}

/// User-facing result of a batch run.
#[derive(Debug, Clone)]
pub struct BatchSummary {
    /// The batch id.
    pub batch_id: String,

    /// Final batch status.
    pub status: BatchStatus,

    /// Completed feature count.
    pub completed: usize,

    /// Failed feature count.
    pub failed: usize,

    /// Skipped feature count.
    pub skipped: usize,

    /// Features still pending (nonzero only for paused batches).
    pub pending: usize,

    /// Total retries across the batch.
    pub total_retries: usize,

    /// Per-feature outcomes.
    pub features: Vec<FeatureReport>,

    /// Breaker trip details, when the batch was paused by the breaker.
    pub breaker_trip: Option<BreakerTrip>,
}

impl BatchSummary {
    /// Process exit code for this outcome.
    ///
    /// - 0: every feature completed
    /// - 1: one or more features failed, or the batch failed outright
    /// - 2: paused by the circuit breaker (operator attention needed)
    pub fn exit_code(&self) -> i32 {
        match self.status {
            BatchStatus::Completed if self.failed == 0 => 0,
            BatchStatus::Paused => 2,
            _ => 1,
        }
    }
}

/// Drives one batch through the agent runtime.
pub struct BatchOrchestrator<'a> {
    store: &'a StateStore,
    dispatch: Box<dyn AgentDispatch + 'a>,
    classifier: Box<dyn FailureClassifier + 'a>,
    tracker: Box<dyn IssueTracker + 'a>,
    policy: RetryPolicy,
    breaker_threshold: u32,
    max_retries_per_feature: u32,
    global_retry_limit: u32,
    dependency_ordering: bool,
    sleeper: Box<dyn Fn(Duration) + 'a>,
}

impl<'a> BatchOrchestrator<'a> {
    /// Creates an orchestrator over the given store and dispatch backend.
    pub fn new(
        config: &ConvoyConfig,
        store: &'a StateStore,
        dispatch: Box<dyn AgentDispatch + 'a>,
    ) -> Self {
        Self {
            store,
            dispatch,
            classifier: Box::new(PatternClassifier::new()),
            tracker: Box::new(NoopIssueTracker),
            policy: config.retry.policy(),
            breaker_threshold: config.breaker.threshold,
            max_retries_per_feature: config.orchestrator.max_retries_per_feature,
            global_retry_limit: config.orchestrator.global_retry_limit,
            dependency_ordering: config.orchestrator.dependency_ordering,
            sleeper: Box::new(|d| std::thread::sleep(d)),
        }
    }

    /// Replaces the failure classifier strategy.
    pub fn with_classifier(mut self, classifier: Box<dyn FailureClassifier + 'a>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Attaches an issue tracker.
    pub fn with_tracker(mut self, tracker: Box<dyn IssueTracker + 'a>) -> Self {
        self.tracker = tracker;
        self
    }

    /// Replaces the sleep function (tests use a no-op).
    pub fn with_sleeper(mut self, sleeper: Box<dyn Fn(Duration) + 'a>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Runs the batch to a terminal or paused state.
    ///
    /// `resume` carries a reconstructed position from
    /// [`CheckpointCoordinator::resume`]; pass `None` for a fresh start.
    pub fn run(
        &self,
        batch: &mut BatchState,
        resume: Option<ResumePosition>,
    ) -> Result<BatchSummary, OrchestratorError> {
        if matches!(batch.status, BatchStatus::Completed | BatchStatus::Failed) {
            debug!(batch_id = %batch.batch_id, status = ?batch.status, "Batch already terminal");
            return Ok(self.summary(batch, None));
        }

        // Dependency ordering happens once, before any execution.
        if batch.status == BatchStatus::Pending && self.dependency_ordering {
            let order = order_features(&batch.features);
            if order.iter().enumerate().any(|(pos, &i)| pos != i) {
                let reordered: Vec<_> =
                    order.into_iter().map(|i| batch.features[i].clone()).collect();
                batch.features = reordered;
            }
        }

        let mut restored_loop = None;
        if let Some(position) = resume {
            batch.current_index = position.current_index.min(batch.features.len());
            restored_loop = position.loop_state;
        }

        // A feature left in-progress by a crash is re-queued for dispatch.
        for feature in &mut batch.features {
            if feature.status == FeatureStatus::InProgress {
                feature.requeue("interrupted before completion");
            }
        }

        batch.status = BatchStatus::Running;
        batch.touch();
        self.store.save_batch(batch)?;
        info!(
            batch_id = %batch.batch_id,
            features = batch.features.len(),
            current_index = batch.current_index,
            "Batch running"
        );

        let checkpoints = CheckpointCoordinator::new(self.store);
        let mut breaker = CircuitBreaker::new(self.breaker_threshold);

        while batch.current_index < batch.features.len() {
            let idx = batch.current_index;
            if batch.features[idx].status.is_terminal() {
                batch.current_index += 1;
                batch.touch();
                self.store.save_batch(batch)?;
                continue;
            }

            let loop_id = format!("{}-f{}", batch.batch_id, idx);
            let loop_state = restored_loop
                .take()
                .filter(|ls| ls.session_id == loop_id)
                .unwrap_or_else(|| LoopState::new(&loop_id));

            let succeeded = self.run_feature(batch, idx, loop_state, &checkpoints)?;

            // The feature reached a terminal status either way; its retry
            // loop is finished.
            self.store.delete_loop(&loop_id)?;

            if succeeded {
                breaker.record_success();
            } else if breaker.record_failure() {
                let trip = BreakerTrip {
                    feature_index: idx,
                    consecutive_failures: breaker.consecutive_failures(),
                };
                warn!(
                    batch_id = %batch.batch_id,
                    feature_index = idx,
                    consecutive_failures = trip.consecutive_failures,
                    "Circuit breaker tripped, pausing batch"
                );
                batch.status = BatchStatus::Paused;
                batch.current_index += 1;
                batch.touch();
                self.store.save_batch(batch)?;
                return Ok(self.summary(batch, Some(trip)));
            }

            batch.current_index += 1;
            batch.touch();
            self.store.save_batch(batch)?;
        }

        batch.status = BatchStatus::Completed;
        batch.touch();
        self.store.save_batch(batch)?;
        let summary = self.summary(batch, None);
        info!(
            batch_id = %batch.batch_id,
            completed = summary.completed,
            failed = summary.failed,
            retries = summary.total_retries,
            "Batch completed"
        );

        // Completed batches are cleaned up; the summary is the record.
        checkpoints.discard(&batch.batch_id)?;
        self.store.delete_batch(&batch.batch_id)?;

        Ok(summary)
    }

    /// Runs one feature to a terminal status. Returns true on success.
    fn run_feature(
        &self,
        batch: &mut BatchState,
        idx: usize,
        mut loop_state: LoopState,
        checkpoints: &CheckpointCoordinator<'_>,
    ) -> Result<bool, OrchestratorError> {
        // A loop restored from a checkpoint may already be exhausted; never
        // dispatch past its bounds.
        if loop_state.iteration_count > 0 {
            if let Err(block) = self.policy.evaluate(&loop_state) {
                return self.fail_feature(batch, idx, &block.to_string(), FailureClass::Unknown);
            }
        }

        loop {
            batch.features[idx].begin_attempt();
            batch.touch();
            self.store.save_batch(batch)?;

            // The dispatch call is where an external restart can land.
            checkpoints.write(batch, Some(&loop_state))?;

            let description = batch.features[idx].description.clone();
            let outcome = match self.dispatch.invoke(&description) {
                Ok(outcome) => outcome,
                Err(e) => DispatchOutcome::failed(e.to_string()),
            };
            let tokens = estimate_tokens(&outcome);

            if outcome.success {
                loop_state.record_attempt(true, tokens, None, self.breaker_threshold);
                self.store.save_loop(&loop_state)?;

                batch.features[idx].complete();
                batch.touch();
                self.store.save_batch(batch)?;
                info!(
                    batch_id = %batch.batch_id,
                    feature_index = idx,
                    attempts = batch.features[idx].attempt_count,
                    "Feature completed"
                );
                if let Some(issue) = batch.features[idx].issue_number {
                    self.tracker.close_issue(issue);
                }
                return Ok(true);
            }

            let error = outcome
                .error
                .unwrap_or_else(|| "agent reported failure without detail".to_string());
            let class = self.classifier.classify(&error);
            loop_state.record_attempt(
                false,
                tokens,
                Some(truncate_error(&error)),
                self.breaker_threshold,
            );
            self.store.save_loop(&loop_state)?;
            debug!(
                batch_id = %batch.batch_id,
                feature_index = idx,
                class = ?class,
                attempts = batch.features[idx].attempt_count,
                "Feature attempt failed"
            );

            if !class.is_retryable() {
                return self.fail_feature(batch, idx, &error, class);
            }

            if batch.features[idx].attempt_count >= self.max_retries_per_feature {
                let reason = format!(
                    "retry cap reached after {} attempts: {}",
                    batch.features[idx].attempt_count,
                    truncate_error(&error)
                );
                return self.fail_feature(batch, idx, &reason, class);
            }

            if let Err(block) = self.policy.evaluate(&loop_state) {
                let reason = format!("{block}: {}", truncate_error(&error));
                return self.fail_feature(batch, idx, &reason, class);
            }

            if batch.total_retries() as u32 >= self.global_retry_limit {
                let reason = format!(
                    "global retry ceiling ({}) reached: {}",
                    self.global_retry_limit,
                    truncate_error(&error)
                );
                return self.fail_feature(batch, idx, &reason, class);
            }

            let delay = self.policy.delay_with_jitter(
                batch.features[idx].attempt_count.saturating_sub(1),
            );
            batch.record_retry(idx, class, delay.as_millis() as u64);
            batch.features[idx].requeue(truncate_error(&error));
            self.store.save_batch(batch)?;
            info!(
                batch_id = %batch.batch_id,
                feature_index = idx,
                delay_ms = delay.as_millis() as u64,
                "Transient failure, re-queued for retry"
            );
            (self.sleeper)(delay);
        }
    }

    /// Marks a feature failed and notifies the tracker. Returns Ok(false).
    fn fail_feature(
        &self,
        batch: &mut BatchState,
        idx: usize,
        reason: &str,
        class: FailureClass,
    ) -> Result<bool, OrchestratorError> {
        batch.features[idx].fail(truncate_error(reason));
        batch.touch();
        self.store.save_batch(batch)?;
        warn!(
            batch_id = %batch.batch_id,
            feature_index = idx,
            class = ?class,
            "Feature failed"
        );
        if let Some(issue) = batch.features[idx].issue_number {
            self.tracker.mark_blocked(issue);
        }
        Ok(false)
    }

    fn summary(&self, batch: &BatchState, breaker_trip: Option<BreakerTrip>) -> BatchSummary {
        let (completed, failed, skipped, pending) = batch.counts();
        BatchSummary {
            batch_id: batch.batch_id.clone(),
            status: batch.status,
            completed,
            failed,
            skipped,
            pending,
            total_retries: batch.total_retries(),
            features: batch
                .features
                .iter()
                .map(|f| FeatureReport {
                    description: f.description.clone(),
                    status: f.status,
                    attempts: f.attempt_count,
                    issue_number: f.issue_number,
                    last_error: f.last_error.clone(),
                })
                .collect(),
            breaker_trip,
        }
    }
}

/// Rough token accounting when the runtime does not report usage.
///
/// Four characters per token is the usual ballpark for English text.
fn estimate_tokens(outcome: &DispatchOutcome) -> u64 {
    let chars = outcome.output.len() + outcome.error.as_deref().map_or(0, str::len);
    (chars / 4) as u64
}

/// Trims an error message to a storable summary.
fn truncate_error(error: &str) -> String {
    const MAX: usize = 240;
    let error = error.trim();
    if error.len() <= MAX {
        error.to_string()
    } else {
        let cut = error
            .char_indices()
            .take_while(|(i, _)| *i < MAX)
            .last()
            .map_or(0, |(i, c)| i + c.len_utf8());
        format!("{}...", &error[..cut])
    }
}
