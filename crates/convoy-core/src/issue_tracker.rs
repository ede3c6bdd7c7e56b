//! Issue tracker integration.
//!
//! Optional, fire-and-forget: a feature linked to an issue gets the issue
//! closed on success or labeled `blocked` on permanent failure. Tracker
//! failures are logged and swallowed; they never influence batch state.

use std::process::Command;
use tracing::{debug, warn};

/// Fire-and-forget issue operations.
pub trait IssueTracker {
    /// Closes an issue after the linked feature completed.
    fn close_issue(&self, issue_number: u64);

    /// Labels an issue `blocked` after the linked feature failed permanently.
    fn mark_blocked(&self, issue_number: u64);
}

/// GitHub tracker backed by the `gh` CLI.
pub struct GhIssueTracker;

impl GhIssueTracker {
    fn run(args: &[String]) {
        match Command::new("gh").args(args).output() {
            Ok(output) if output.status.success() => {
                debug!(?args, "gh succeeded");
            }
            Ok(output) => {
                warn!(
                    ?args,
                    code = ?output.status.code(),
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "gh exited nonzero; ignoring"
                );
            }
            Err(e) => {
                warn!(?args, error = %e, "Failed to run gh; ignoring");
            }
        }
    }
}

impl IssueTracker for GhIssueTracker {
    fn close_issue(&self, issue_number: u64) {
        Self::run(&[
            "issue".to_string(),
            "close".to_string(),
            issue_number.to_string(),
        ]);
    }

    fn mark_blocked(&self, issue_number: u64) {
        Self::run(&[
            "issue".to_string(),
            "edit".to_string(),
            issue_number.to_string(),
            "--add-label".to_string(),
            "blocked".to_string(),
        ]);
    }
}

/// Tracker that does nothing; used when no tracker is configured.
pub struct NoopIssueTracker;

impl IssueTracker for NoopIssueTracker {
    fn close_issue(&self, _issue_number: u64) {}
    fn mark_blocked(&self, _issue_number: u64) {}
}
