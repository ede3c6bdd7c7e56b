//! End-to-end batch pipeline scenarios through the public API.

use convoy_core::{
    AgentDispatch, BatchOrchestrator, BatchState, BatchStatus, CheckpointCoordinator,
    CompletionDecision, CompletionVerifier, ConvoyConfig, DispatchError, DispatchOutcome,
    FeatureStatus, LoopState, ResumeSource, RetryPolicy, StageLog, StateStore, PIPELINE_STAGES,
};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use tempfile::TempDir;

struct ScriptedDispatch {
    script: RefCell<HashMap<String, VecDeque<DispatchOutcome>>>,
}

impl ScriptedDispatch {
    fn new() -> Self {
        Self {
            script: RefCell::new(HashMap::new()),
        }
    }

    fn on(self, description: &str, outcomes: Vec<DispatchOutcome>) -> Self {
        self.script
            .borrow_mut()
            .insert(description.to_string(), outcomes.into());
        self
    }
}

impl AgentDispatch for ScriptedDispatch {
    fn invoke(&self, feature_description: &str) -> Result<DispatchOutcome, DispatchError> {
        Ok(self
            .script
            .borrow_mut()
            .get_mut(feature_description)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| DispatchOutcome::ok("done")))
    }
}

fn quiet_config() -> ConvoyConfig {
    let mut config = ConvoyConfig::default();
    config.retry.jitter_ratio = 0.0;
    config
}

#[test]
fn test_three_feature_scenario() {
    let tmp = TempDir::new().unwrap();
    let store = StateStore::new(tmp.path().join("state")).unwrap();
    let config = quiet_config();

    let dispatch = ScriptedDispatch::new()
        .on(
            "B",
            vec![
                DispatchOutcome::failed("connection timed out"),
                DispatchOutcome::failed("rate limit exceeded"),
                DispatchOutcome::ok("implemented"),
            ],
        )
        .on("C", vec![DispatchOutcome::failed("SyntaxError: bad parse")]);

    let mut batch = BatchState::from_descriptions(["A", "B", "C"]);
    let summary = BatchOrchestrator::new(&config, &store, Box::new(dispatch))
        .with_sleeper(Box::new(|_| {}))
        .run(&mut batch, None)
        .unwrap();

    assert_eq!(summary.status, BatchStatus::Completed);

    let a = &batch.features[0];
    assert_eq!(a.status, FeatureStatus::Completed);
    assert_eq!(a.attempt_count, 1);

    let b = &batch.features[1];
    assert_eq!(b.status, FeatureStatus::Completed);
    assert_eq!(b.attempt_count, 3);

    let c = &batch.features[2];
    assert_eq!(c.status, FeatureStatus::Failed);
    assert_eq!(c.attempt_count, 1);

    assert_eq!(summary.total_retries, 2);
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 1);
}

#[test]
fn test_crash_and_resume_from_checkpoint() {
    let tmp = TempDir::new().unwrap();
    let store = StateStore::new(tmp.path().join("state")).unwrap();
    let config = quiet_config();

    // First run: three consecutive permanent failures trip the breaker.
    let dispatch = ScriptedDispatch::new()
        .on("F1", vec![DispatchOutcome::failed("TypeError: one")])
        .on("F2", vec![DispatchOutcome::failed("TypeError: two")])
        .on("F3", vec![DispatchOutcome::failed("TypeError: three")]);

    let mut batch = BatchState::from_descriptions(["F1", "F2", "F3", "F4", "F5"]);
    let batch_id = batch.batch_id.clone();
    let summary = BatchOrchestrator::new(&config, &store, Box::new(dispatch))
        .with_sleeper(Box::new(|_| {}))
        .run(&mut batch, None)
        .unwrap();
    assert_eq!(summary.status, BatchStatus::Paused);

    // "Restart": reload everything from disk and resume.
    let mut reloaded = store.load_batch(&batch_id).unwrap();
    let coordinator = CheckpointCoordinator::new(&store);
    let position = coordinator.resume(&reloaded).unwrap();
    assert_eq!(position.source, ResumeSource::Checkpoint);

    let summary = BatchOrchestrator::new(&config, &store, Box::new(ScriptedDispatch::new()))
        .with_sleeper(Box::new(|_| {}))
        .run(&mut reloaded, Some(position))
        .unwrap();

    assert_eq!(summary.status, BatchStatus::Completed);
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 3);
}

#[test]
fn test_stale_checkpoint_falls_back_to_batch_cursor() {
    let tmp = TempDir::new().unwrap();
    let store = StateStore::new(tmp.path().join("state")).unwrap();

    let mut batch = BatchState::from_descriptions(["F1", "F2"]);
    batch.current_index = 1;
    store.save_batch(&batch).unwrap();

    // A checkpoint written for a different batch run lands on the same id.
    let coordinator = CheckpointCoordinator::new(&store);
    let mut foreign = BatchState::from_descriptions(["X"]);
    foreign.batch_id = batch.batch_id.clone();
    coordinator.write(&foreign, None).unwrap();
    // Tamper: rewrite the checkpoint with a mismatched batch id.
    let mut tampered: convoy_core::Checkpoint = store.load_checkpoint(&batch.batch_id).unwrap();
    tampered.batch_id = "batch-0-dead".to_string();
    store.save_checkpoint(&batch.batch_id, &tampered).unwrap();

    let position = coordinator.resume(&batch).unwrap();
    assert_eq!(position.source, ResumeSource::BatchState);
    assert_eq!(position.current_index, 1);
}

#[test]
fn test_verifier_drives_loop_back_then_completion() {
    let tmp = TempDir::new().unwrap();
    let store = StateStore::new(tmp.path().join("state")).unwrap();
    let stage_log = StageLog::new(tmp.path().join("stages.jsonl"));

    // The first pass through the pipeline skipped everything after review.
    for stage in &PIPELINE_STAGES[..5] {
        stage_log.record("session-9", stage).unwrap();
    }

    let verifier = CompletionVerifier::new(
        RetryPolicy {
            jitter_ratio: 0.0,
            ..RetryPolicy::default()
        },
        3,
    );

    let decision = verifier
        .check_session(&store, &stage_log, "session-9")
        .unwrap();
    let checkpoint = match decision {
        CompletionDecision::LoopBack(cp) => cp,
        other => panic!("expected LoopBack, got {other:?}"),
    };
    assert_eq!(
        checkpoint.missing_stages,
        vec!["refactorer", "documenter", "committer"]
    );

    // The loop-back re-runs the missing stages; the next check is clean.
    for stage in &checkpoint.missing_stages {
        stage_log.record("session-9", stage).unwrap();
    }
    let decision = verifier
        .check_session(&store, &stage_log, "session-9")
        .unwrap();
    assert!(matches!(decision, CompletionDecision::Complete));

    // The verifier's own loop state recorded the recovery.
    let loop_state: LoopState = store.load_loop("verify-session-9").unwrap();
    assert_eq!(loop_state.iteration_count, 2);
    assert_eq!(loop_state.consecutive_failures, 0);
}
