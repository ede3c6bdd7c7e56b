//! Agent runtime dispatch.
//!
//! The orchestrator treats the agent runtime as an opaque synchronous
//! collaborator: one feature description in, one aggregated result out. Any
//! parallelism lives inside the runtime; from this side there is exactly one
//! blocking call per attempt.

use std::process::Command;
use tracing::{debug, warn};

/// Result of one agent invocation.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Whether the runtime reported success.
    pub success: bool,

    /// Aggregated output text (not interpreted by the core).
    pub output: String,

    /// Error text, when the runtime failed.
    pub error: Option<String>,
}

impl DispatchOutcome {
    /// A successful outcome with output text.
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
        }
    }

    /// A failed outcome with error text.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
        }
    }
}

/// Errors raised before the runtime could produce an outcome.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// No agent command is configured.
    #[error("no agent command configured")]
    NoCommand,

    /// The agent process could not be spawned.
    #[error("failed to spawn agent command {command:?}: {source}")]
    Spawn {
        /// The command that failed to start.
        command: String,
        /// Underlying IO error.
        source: std::io::Error,
    },
}

/// Synchronous dispatch to the external agent runtime.
pub trait AgentDispatch {
    /// Hands one feature description to the runtime and blocks for the result.
    fn invoke(&self, feature_description: &str) -> Result<DispatchOutcome, DispatchError>;
}

/// Dispatch backend that shells out to a configured command.
///
/// The feature description is appended as the final argument. A nonzero exit
/// status is a failed outcome carrying stderr; only a spawn failure is a
/// [`DispatchError`].
pub struct CommandDispatch {
    program: String,
    args: Vec<String>,
}

impl CommandDispatch {
    /// Parses a whitespace-separated command line into a dispatcher.
    pub fn new(command_line: &str) -> Result<Self, DispatchError> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or(DispatchError::NoCommand)?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl AgentDispatch for CommandDispatch {
    fn invoke(&self, feature_description: &str) -> Result<DispatchOutcome, DispatchError> {
        debug!(program = %self.program, "Dispatching feature to agent runtime");

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(feature_description)
            .output()
            .map_err(|source| DispatchError::Spawn {
                command: self.program.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            Ok(DispatchOutcome {
                success: true,
                output: stdout,
                error: None,
            })
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(
                program = %self.program,
                code = ?output.status.code(),
                "Agent command exited nonzero"
            );
            Ok(DispatchOutcome {
                success: false,
                output: stdout,
                error: Some(if stderr.is_empty() {
                    format!("agent exited with status {}", output.status)
                } else {
                    stderr
                }),
            })
        }
    }
}

/// No-op dispatch used by `--dry-run`: every feature "succeeds" instantly.
pub struct NullDispatch;

impl AgentDispatch for NullDispatch {
    fn invoke(&self, feature_description: &str) -> Result<DispatchOutcome, DispatchError> {
        debug!(feature = feature_description, "Dry-run dispatch");
        Ok(DispatchOutcome::ok("dry-run"))
    }
}
