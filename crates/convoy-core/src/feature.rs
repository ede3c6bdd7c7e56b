//! Feature tracking for batch runs.
//!
//! A feature is one unit of delivery work: a free-text description handed to
//! the agent runtime, plus the bookkeeping the orchestrator needs to drive it
//! through its lifecycle.

use serde::{Deserialize, Serialize};

/// Status of a feature within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    /// Not started, or re-queued for retry
    Pending,
    /// Currently dispatched to the agent runtime
    InProgress,
    /// Agent reported success
    Completed,
    /// Failed permanently or exhausted retries
    Failed,
    /// Explicitly skipped by the operator
    Skipped,
}

impl FeatureStatus {
    /// Returns true if this status is terminal (Completed, Failed or Skipped).
    ///
    /// Terminal features are never dispatched again; a Failed feature can only
    /// return to Pending through an explicit retry re-queue.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FeatureStatus::Completed | FeatureStatus::Failed | FeatureStatus::Skipped
        )
    }
}

/// One feature in a batch queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    /// Raw description text dispatched to the agent runtime
    pub description: String,

    /// Current state
    pub status: FeatureStatus,

    /// Number of dispatch attempts so far
    #[serde(default)]
    pub attempt_count: u32,

    /// Linked issue number, if this feature came from the tracker
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_number: Option<u64>,

    /// Summary of the last failure, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Feature {
    /// Creates a new pending feature from a description.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            status: FeatureStatus::Pending,
            attempt_count: 0,
            issue_number: None,
            last_error: None,
        }
    }

    /// Links this feature to a tracker issue number.
    pub fn with_issue(mut self, issue_number: u64) -> Self {
        self.issue_number = Some(issue_number);
        self
    }

    /// Moves the feature to InProgress and counts the attempt.
    ///
    /// Only valid from Pending; transitions from any other status are ignored
    /// so a crash mid-step cannot double-advance a terminal feature.
    pub fn begin_attempt(&mut self) -> bool {
        if self.status != FeatureStatus::Pending {
            return false;
        }
        self.status = FeatureStatus::InProgress;
        self.attempt_count += 1;
        true
    }

    /// Marks the feature completed.
    pub fn complete(&mut self) {
        self.status = FeatureStatus::Completed;
        self.last_error = None;
    }

    /// Marks the feature failed with an error summary.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = FeatureStatus::Failed;
        self.last_error = Some(error.into());
    }

    /// Re-queues a failed or in-progress feature for another attempt.
    ///
    /// This is the only sanctioned regression in the status machine; the
    /// orchestrator calls it under the retry policy's supervision.
    pub fn requeue(&mut self, error: impl Into<String>) {
        self.status = FeatureStatus::Pending;
        self.last_error = Some(error.into());
    }
}
