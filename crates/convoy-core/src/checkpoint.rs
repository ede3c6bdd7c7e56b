//! Checkpoint and resume coordination.
//!
//! Before a context-destroying event (external process restart), the
//! orchestrator snapshots its cursor and retry state as one atomic document.
//! On resume the snapshot is validated against the live `BatchState`; any
//! mismatch refuses the checkpoint and falls back to the batch's own cursor.
//! The checkpoint is an optimization for restoring in-flight retry context —
//! `BatchState` is always the source of truth.

use crate::batch_state::BatchState;
use crate::loop_state::LoopState;
use crate::state_store::{StateStore, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// A persisted orchestrator snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Batch the snapshot belongs to.
    pub batch_id: String,

    /// Cursor position at snapshot time.
    pub current_index: usize,

    /// In-flight retry loop state, if a feature was mid-retry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_state: Option<LoopState>,

    /// When the snapshot was taken.
    pub created_at: DateTime<Utc>,
}

/// Where a resume position came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeSource {
    /// A validated checkpoint.
    Checkpoint,
    /// The batch document itself (checkpoint absent, stale or mismatched).
    BatchState,
}

/// Reconstructed orchestrator position.
#[derive(Debug)]
pub struct ResumePosition {
    /// Cursor to resume from.
    pub current_index: usize,

    /// Retry loop state restored from the checkpoint, if any.
    pub loop_state: Option<LoopState>,

    /// Which document supplied the position.
    pub source: ResumeSource,
}

/// Errors from checkpoint coordination.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// State persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Writes and restores orchestrator snapshots.
pub struct CheckpointCoordinator<'a> {
    store: &'a StateStore,
}

impl<'a> CheckpointCoordinator<'a> {
    /// Creates a coordinator over the given store.
    pub fn new(store: &'a StateStore) -> Self {
        Self { store }
    }

    /// Snapshots the orchestrator position as one atomic document.
    pub fn write(
        &self,
        batch: &BatchState,
        loop_state: Option<&LoopState>,
    ) -> Result<Checkpoint, CheckpointError> {
        let checkpoint = Checkpoint {
            batch_id: batch.batch_id.clone(),
            current_index: batch.current_index,
            loop_state: loop_state.cloned(),
            created_at: Utc::now(),
        };
        self.store.save_checkpoint(&batch.batch_id, &checkpoint)?;
        debug!(
            batch_id = %batch.batch_id,
            current_index = batch.current_index,
            "Checkpoint written"
        );
        Ok(checkpoint)
    }

    /// Reconstructs the orchestrator position for a loaded batch.
    ///
    /// A checkpoint is accepted only when its `batch_id` matches and its
    /// cursor is within bounds for the batch's feature list. Anything else
    /// (missing, corrupted, stale, mismatched) falls back to
    /// `BatchState.current_index`.
    pub fn resume(&self, batch: &BatchState) -> Result<ResumePosition, CheckpointError> {
        let fallback = ResumePosition {
            current_index: batch.current_index,
            loop_state: None,
            source: ResumeSource::BatchState,
        };

        let checkpoint: Checkpoint = match self.store.load_checkpoint(&batch.batch_id) {
            Ok(cp) => cp,
            Err(StoreError::NotFound { .. }) => {
                debug!(batch_id = %batch.batch_id, "No checkpoint, resuming from batch state");
                return Ok(fallback);
            }
            Err(StoreError::Corrupted(path)) => {
                warn!(
                    batch_id = %batch.batch_id,
                    path = %path.display(),
                    "Checkpoint corrupted, resuming from batch state"
                );
                return Ok(fallback);
            }
            Err(e) => return Err(e.into()),
        };

        if checkpoint.batch_id != batch.batch_id {
            warn!(
                batch_id = %batch.batch_id,
                checkpoint_batch = %checkpoint.batch_id,
                "Checkpoint belongs to a different batch, refusing"
            );
            return Ok(fallback);
        }

        if checkpoint.current_index > batch.features.len() {
            warn!(
                batch_id = %batch.batch_id,
                checkpoint_index = checkpoint.current_index,
                features = batch.features.len(),
                "Checkpoint cursor out of bounds, refusing"
            );
            return Ok(fallback);
        }

        info!(
            batch_id = %batch.batch_id,
            current_index = checkpoint.current_index,
            "Resumed from checkpoint"
        );
        Ok(ResumePosition {
            current_index: checkpoint.current_index,
            loop_state: checkpoint.loop_state,
            source: ResumeSource::Checkpoint,
        })
    }

    /// Discards the checkpoint for a batch (after completion or consumption).
    pub fn discard(&self, batch_id: &str) -> Result<(), CheckpointError> {
        self.store.delete_checkpoint(batch_id)?;
        Ok(())
    }
}
