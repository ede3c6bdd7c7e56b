//! Persistent batch state.
//!
//! One document per batch run: the ordered feature queue, the cursor, the
//! overall status, and an append-only log of retry attempts. The document is
//! versioned; old layouts are migrated once on load by [`upgrade`] instead of
//! scattering field-default checks through the orchestrator.

use crate::classifier::FailureClass;
use crate::feature::{Feature, FeatureStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current schema version written by this build.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Overall status of a batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Created, not yet started
    Pending,
    /// Actively processing features
    Running,
    /// Halted by circuit breaker or budget; resumable after operator action
    Paused,
    /// All features reached a terminal status
    Completed,
    /// Unrecoverable error
    Failed,
}

/// One retry attempt recorded against the batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryRecord {
    /// Index of the feature that was retried.
    pub feature_index: usize,

    /// Classification of the failure that triggered the retry.
    pub reason_class: FailureClass,

    /// When the retry was queued.
    pub timestamp: DateTime<Utc>,

    /// Advisory backoff delay that was applied, in milliseconds.
    pub delay_ms: u64,
}

/// Persistent state for one batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchState {
    /// Document layout version, bumped on incompatible changes.
    pub schema_version: u32,

    /// Opaque unique identifier, immutable after creation.
    pub batch_id: String,

    /// Ordered feature queue.
    pub features: Vec<Feature>,

    /// Cursor into `features`; `features.len()` means the queue is drained.
    pub current_index: usize,

    /// Overall batch status.
    pub status: BatchStatus,

    /// Append-only retry log.
    #[serde(default)]
    pub retry_history: Vec<RetryRecord>,

    /// When the batch was created.
    pub created_at: DateTime<Utc>,

    /// When the batch was last mutated.
    pub updated_at: DateTime<Utc>,
}

impl BatchState {
    /// Creates a new pending batch from a feature list.
    pub fn new(features: Vec<Feature>) -> Self {
        let now = Utc::now();
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            batch_id: Self::generate_id(),
            features,
            current_index: 0,
            status: BatchStatus::Pending,
            retry_history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Creates a batch from raw description lines.
    pub fn from_descriptions<I, S>(descriptions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(descriptions.into_iter().map(Feature::new).collect())
    }

    /// Generates a unique batch ID: batch-{timestamp}-{hex_suffix}
    fn generate_id() -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards");
        let timestamp = duration.as_secs();
        let hex_suffix = format!("{:04x}", duration.subsec_micros() % 0x10000);
        format!("batch-{}-{}", timestamp, hex_suffix)
    }

    /// Records a retry attempt in the history log.
    pub fn record_retry(&mut self, feature_index: usize, reason: FailureClass, delay_ms: u64) {
        self.retry_history.push(RetryRecord {
            feature_index,
            reason_class: reason,
            timestamp: Utc::now(),
            delay_ms,
        });
        self.touch();
    }

    /// Bumps `updated_at`.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Total retries recorded across the whole batch.
    pub fn total_retries(&self) -> usize {
        self.retry_history.len()
    }

    /// Returns true if every feature has reached a terminal status.
    pub fn all_terminal(&self) -> bool {
        self.features.iter().all(|f| f.status.is_terminal())
    }

    /// Counts features by status: (completed, failed, skipped, pending).
    pub fn counts(&self) -> (usize, usize, usize, usize) {
        let mut completed = 0;
        let mut failed = 0;
        let mut skipped = 0;
        let mut pending = 0;
        for f in &self.features {
            match f.status {
                FeatureStatus::Completed => completed += 1,
                FeatureStatus::Failed => failed += 1,
                FeatureStatus::Skipped => skipped += 1,
                FeatureStatus::Pending | FeatureStatus::InProgress => pending += 1,
            }
        }
        (completed, failed, skipped, pending)
    }

    /// Checks the structural invariant `0 <= current_index <= len(features)`.
    pub fn is_cursor_valid(&self) -> bool {
        self.current_index <= self.features.len()
    }
}

/// Migrates an older persisted document to the current layout.
///
/// Applied once on load. V1 documents carried no `schema_version` and no
/// `retry_history`; both are filled in here so the rest of the crate can rely
/// on every field being present.
pub fn upgrade(mut doc: serde_json::Value) -> Result<BatchState, serde_json::Error> {
    if let Some(obj) = doc.as_object_mut() {
        if !obj.contains_key("schema_version") {
            obj.insert("schema_version".to_string(), serde_json::json!(1));
        }
        if !obj.contains_key("retry_history") {
            obj.insert("retry_history".to_string(), serde_json::json!([]));
        }
    }

    let mut state: BatchState = serde_json::from_value(doc)?;
    state.schema_version = CURRENT_SCHEMA_VERSION;
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_batch() {
        let batch = BatchState::from_descriptions(["A", "B"]);
        assert!(batch.batch_id.starts_with("batch-"));
        assert_eq!(batch.features.len(), 2);
        assert_eq!(batch.current_index, 0);
        assert_eq!(batch.status, BatchStatus::Pending);
        assert_eq!(batch.schema_version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_batch_id_format() {
        let batch = BatchState::new(vec![]);
        let parts: Vec<&str> = batch.batch_id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "batch");
    }

    #[test]
    fn test_counts() {
        let mut batch = BatchState::from_descriptions(["A", "B", "C", "D"]);
        batch.features[0].begin_attempt();
        batch.features[0].complete();
        batch.features[1].begin_attempt();
        batch.features[1].fail("syntax error");
        batch.features[2].status = FeatureStatus::Skipped;

        assert_eq!(batch.counts(), (1, 1, 1, 1));
        assert!(!batch.all_terminal());

        batch.features[3].begin_attempt();
        batch.features[3].complete();
        assert!(batch.all_terminal());
    }

    #[test]
    fn test_record_retry() {
        let mut batch = BatchState::from_descriptions(["A"]);
        batch.record_retry(0, FailureClass::Transient, 200);

        assert_eq!(batch.total_retries(), 1);
        assert_eq!(batch.retry_history[0].feature_index, 0);
        assert_eq!(batch.retry_history[0].delay_ms, 200);
    }

    #[test]
    fn test_cursor_invariant() {
        let mut batch = BatchState::from_descriptions(["A", "B"]);
        assert!(batch.is_cursor_valid());
        batch.current_index = 2;
        assert!(batch.is_cursor_valid());
        batch.current_index = 3;
        assert!(!batch.is_cursor_valid());
    }

    #[test]
    fn test_serde_round_trip() {
        let mut batch = BatchState::from_descriptions(["A", "B"]);
        batch.status = BatchStatus::Running;
        batch.record_retry(1, FailureClass::Transient, 400);

        let json = serde_json::to_string(&batch).unwrap();
        let restored: BatchState = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.batch_id, batch.batch_id);
        assert_eq!(restored.features.len(), 2);
        assert_eq!(restored.status, BatchStatus::Running);
        assert_eq!(restored.retry_history.len(), 1);
    }

    #[test]
    fn test_upgrade_v1_document() {
        // V1 layout: no schema_version, no retry_history
        let doc = serde_json::json!({
            "batch_id": "batch-1700000000-abcd",
            "features": [
                {"description": "A", "status": "completed", "attempt_count": 1},
                {"description": "B", "status": "pending"}
            ],
            "current_index": 1,
            "status": "running",
            "created_at": "2026-01-03T10:00:00Z",
            "updated_at": "2026-01-03T10:05:00Z"
        });

        let state = upgrade(doc).unwrap();
        assert_eq!(state.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(state.batch_id, "batch-1700000000-abcd");
        assert!(state.retry_history.is_empty());
        assert_eq!(state.features[1].attempt_count, 0);
    }

    #[test]
    fn test_upgrade_current_document_is_stable() {
        let batch = BatchState::from_descriptions(["A"]);
        let doc = serde_json::to_value(&batch).unwrap();
        let state = upgrade(doc).unwrap();
        assert_eq!(state.batch_id, batch.batch_id);
        assert_eq!(state.schema_version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_upgrade_rejects_malformed() {
        let doc = serde_json::json!({"not_a_batch": true});
        assert!(upgrade(doc).is_err());
    }
}
