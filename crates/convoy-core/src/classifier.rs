//! Failure classification for dispatch errors.
//!
//! Errors come back from the agent runtime as free text, so classification is
//! a pattern-matching heuristic behind a narrow trait. The orchestrator only
//! depends on the trait; the regex lists can be swapped for a learned or
//! externally-delegated classifier without touching the retry/state core.

use regex::RegexSet;
use serde::{Deserialize, Serialize};

/// Retryability class of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Network, timeout, rate-limit: worth retrying.
    Transient,
    /// Syntax, import, type errors: retrying reproduces the failure.
    Permanent,
    /// Unrecognized. Treated as permanent by callers to avoid retry loops
    /// on errors nobody has triaged.
    Unknown,
}

impl FailureClass {
    /// Returns true if a retry is worthwhile for this class.
    ///
    /// `Unknown` is conservatively non-retryable.
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureClass::Transient)
    }
}

/// Strategy interface for failure classification.
pub trait FailureClassifier {
    /// Classifies free-text error output.
    fn classify(&self, error_text: &str) -> FailureClass;
}

/// Default regex-list classifier.
pub struct PatternClassifier {
    transient: RegexSet,
    permanent: RegexSet,
}

impl PatternClassifier {
    /// Builds the classifier with the stock pattern lists.
    pub fn new() -> Self {
        let transient = RegexSet::new([
            r"(?i)timed?[ _-]?out",
            r"(?i)connection (refused|reset|closed|aborted)",
            r"(?i)rate[ _-]?limit",
            r"(?i)too many requests",
            r"\b429\b",
            r"\b50[234]\b",
            r"(?i)temporarily unavailable",
            r"(?i)network (error|unreachable)",
            r"(?i)dns (failure|error)",
            r"(?i)overloaded",
        ])
        .expect("stock transient patterns are valid");

        let permanent = RegexSet::new([
            r"(?i)syntax ?error",
            r"(?i)(import|module ?not ?found) ?error",
            r"(?i)type ?error",
            r"(?i)name ?error",
            r"(?i)attribute ?error",
            r"(?i)compil(e|ation) (error|failed)",
            r"(?i)cannot find (crate|module|symbol)",
            r"(?i)undefined (variable|reference|symbol)",
            r"(?i)validation (error|failed)",
            r"(?i)traceback \(most recent call last\)",
        ])
        .expect("stock permanent patterns are valid");

        Self {
            transient,
            permanent,
        }
    }
}

impl Default for PatternClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl FailureClassifier for PatternClassifier {
    fn classify(&self, error_text: &str) -> FailureClass {
        // Permanent wins on mixed output: a syntax error wrapped in a retry
        // wrapper is still a syntax error.
        if self.permanent.is_match(error_text) {
            return FailureClass::Permanent;
        }
        if self.transient.is_match(error_text) {
            return FailureClass::Transient;
        }
        FailureClass::Unknown
    }
}
