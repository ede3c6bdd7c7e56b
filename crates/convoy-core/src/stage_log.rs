//! Session stage log.
//!
//! Each pipeline stage that completes appends one JSON event line to the
//! session's stage log. The completion verifier reads this file to learn
//! which stages actually ran. Malformed lines are skipped with a warning
//! rather than failing the read; a half-written trailing line after a crash
//! must not make the whole session unverifiable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

/// One stage-completion event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEvent {
    /// When the stage finished.
    pub ts: DateTime<Utc>,

    /// Session the stage ran in.
    pub session_id: String,

    /// Stage name, matching the fixed pipeline stage list.
    pub stage: String,
}

/// Reader/writer for a JSONL stage log.
pub struct StageLog {
    path: PathBuf,
}

impl StageLog {
    /// Creates a log handle for the given file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a stage-completion event.
    pub fn record(&self, session_id: &str, stage: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let event = StageEvent {
            ts: Utc::now(),
            session_id: session_id.to_string(),
            stage: stage.to_string(),
        };
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');

        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())
    }

    /// Returns stage names observed for a session, in log order.
    ///
    /// Missing file means no stages observed. Malformed lines are skipped.
    pub fn observed_stages(&self, session_id: &str) -> io::Result<Vec<String>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&self.path)?;
        let mut stages = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StageEvent>(line) {
                Ok(event) if event.session_id == session_id => {
                    if !stages.contains(&event.stage) {
                        stages.push(event.stage);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        line = lineno + 1,
                        error = %e,
                        "Skipping malformed stage log line"
                    );
                }
            }
        }
        Ok(stages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty() {
        let tmp = TempDir::new().unwrap();
        let log = StageLog::new(tmp.path().join("stages.jsonl"));
        assert!(log.observed_stages("s1").unwrap().is_empty());
    }

    #[test]
    fn test_record_and_read_back() {
        let tmp = TempDir::new().unwrap();
        let log = StageLog::new(tmp.path().join("stages.jsonl"));

        log.record("s1", "researcher").unwrap();
        log.record("s1", "planner").unwrap();
        log.record("s2", "researcher").unwrap();

        assert_eq!(log.observed_stages("s1").unwrap(), vec![
            "researcher".to_string(),
            "planner".to_string()
        ]);
        assert_eq!(log.observed_stages("s2").unwrap(), vec![
            "researcher".to_string()
        ]);
    }

    #[test]
    fn test_duplicate_stages_deduplicated() {
        let tmp = TempDir::new().unwrap();
        let log = StageLog::new(tmp.path().join("stages.jsonl"));

        log.record("s1", "implementer").unwrap();
        log.record("s1", "implementer").unwrap();

        assert_eq!(log.observed_stages("s1").unwrap().len(), 1);
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("stages.jsonl");
        let log = StageLog::new(&path);

        log.record("s1", "researcher").unwrap();
        log.record("s1", "planner").unwrap();
        // Simulate a crash mid-append: half-written trailing line
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap();
        file.write_all(b"{\"ts\": \"2026-01-").unwrap();
        drop(file);

        let stages = log.observed_stages("s1").unwrap();
        assert_eq!(stages, vec!["researcher".to_string(), "planner".to_string()]);
    }
}
