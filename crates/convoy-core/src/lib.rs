//! # convoy-core
//!
//! Core batch/retry orchestration for Convoy.
//!
//! This crate provides:
//! - Atomic, versioned persistence for batch and retry-loop state
//! - Circuit-breaker-guarded retry with exponential backoff and jitter
//! - The batch orchestrator driving features through an external agent runtime
//! - Checkpoint/resume coordination across process restarts
//! - Pipeline completion verification with bounded loop-back retries

mod batch_state;
mod checkpoint;
mod circuit_breaker;
mod classifier;
mod config;
mod dispatch;
mod feature;
pub mod file_lock;
mod issue_tracker;
mod loop_state;
mod orchestrator;
mod retry;
mod stage_log;
mod state_store;
mod verifier;

pub use batch_state::{BatchState, BatchStatus, CURRENT_SCHEMA_VERSION, RetryRecord};
pub use checkpoint::{
    Checkpoint, CheckpointCoordinator, CheckpointError, ResumePosition, ResumeSource,
};
pub use circuit_breaker::{CircuitBreaker, DEFAULT_BREAKER_THRESHOLD};
pub use classifier::{FailureClass, FailureClassifier, PatternClassifier};
pub use config::{
    BreakerConfig, ConfigError, ConvoyConfig, DEFAULT_STATE_DIR, OrchestratorConfig, RetryConfig,
    VerifierConfig,
};
pub use dispatch::{AgentDispatch, CommandDispatch, DispatchError, DispatchOutcome, NullDispatch};
pub use feature::{Feature, FeatureStatus};
pub use issue_tracker::{GhIssueTracker, IssueTracker, NoopIssueTracker};
pub use loop_state::{AttemptRecord, LoopState};
pub use orchestrator::{
    BatchOrchestrator, BatchSummary, BreakerTrip, FeatureReport, OrchestratorError, order_features,
};
pub use retry::{
    DEFAULT_BASE_DELAY_MS, DEFAULT_JITTER_RATIO, DEFAULT_MAX_DELAY_MS, DEFAULT_MAX_ITERATIONS,
    DEFAULT_TOKEN_LIMIT, RetryBlock, RetryPolicy,
};
pub use stage_log::{StageEvent, StageLog};
pub use state_store::{StateStore, StoreError, validate_id};
pub use verifier::{
    CompletionDecision, CompletionVerifier, LoopBackCheckpoint, PIPELINE_STAGES,
    VerificationResult, VerifierError,
};
