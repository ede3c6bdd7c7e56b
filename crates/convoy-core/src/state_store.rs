//! Atomic JSON persistence for batch, loop and checkpoint documents.
//!
//! One document per file under the state directory:
//!
//! ```text
//! <state_dir>/batches/<batch_id>.json
//! <state_dir>/loops/<session_id>.json
//! <state_dir>/checkpoints/<batch_id>.json
//! <state_dir>/loopbacks/<session_id>.json
//! ```
//!
//! # Design
//!
//! - **Atomic saves**: serialize to a dot-prefixed temp file in the target
//!   directory, then rename over the destination. A reader never observes a
//!   partially written document, even across a crash mid-write.
//! - **Backups**: before the rename, the previous good document is copied to
//!   a `.json.bak` sibling. A corrupted live file falls back to it on load;
//!   a broken file with no usable backup is a hard [`StoreError::Corrupted`],
//!   never a silently fabricated default.
//! - **Owner-only permissions**: documents carry identifiers and paths, so
//!   files are written 0600 on Unix.
//! - **Id hygiene**: ids are validated before any path construction; path
//!   separators and `..` segments are refused outright, and symlinked
//!   document paths are never followed.
//!
//! Concurrent writers on the same id are raced at the filesystem level: the
//! later atomic rename wins. Advisory `flock` narrows but does not close the
//! window; hard cross-process mutual exclusion is out of scope for the
//! single-operator usage model.

use crate::batch_state::{self, BatchState};
use crate::file_lock::FileLock;
use crate::loop_state::LoopState;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Errors from state persistence.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// IO error reading or writing a document.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// No document exists for the id.
    #[error("{kind} state not found: {id}")]
    NotFound {
        /// Document kind ("batch", "loop", ...).
        kind: &'static str,
        /// The requested id.
        id: String,
    },

    /// Document unreadable and no usable backup.
    #[error("state file corrupted and no usable backup: {0}")]
    Corrupted(PathBuf),

    /// Id failed validation before path construction.
    #[error("invalid state id (path traversal refused): {0:?}")]
    InvalidId(String),

    /// Document path is a symlink; refusing to follow it.
    #[error("state file is a symlink, refusing: {0}")]
    SymlinkRefused(PathBuf),

    /// Serialization failure.
    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Filesystem-backed store for all persistent orchestration state.
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    const BATCHES: &'static str = "batches";
    const LOOPS: &'static str = "loops";
    const CHECKPOINTS: &'static str = "checkpoints";
    const LOOPBACKS: &'static str = "loopbacks";

    /// Creates a store rooted at `state_dir`, creating the layout if needed.
    pub fn new(state_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = state_dir.into();
        for sub in [Self::BATCHES, Self::LOOPS, Self::CHECKPOINTS, Self::LOOPBACKS] {
            std::fs::create_dir_all(root.join(sub))?;
        }
        Ok(Self { root })
    }

    /// The state directory this store operates in.
    pub fn root(&self) -> &Path {
        &self.root
    }

    // ── batches ────────────────────────────────────────────────────────

    /// Persists a batch document atomically.
    pub fn save_batch(&self, state: &BatchState) -> Result<(), StoreError> {
        self.save_document(Self::BATCHES, &state.batch_id, state)
    }

    /// Loads a batch document, applying schema migration.
    pub fn load_batch(&self, batch_id: &str) -> Result<BatchState, StoreError> {
        let path = self.document_path(Self::BATCHES, batch_id)?;
        let value: serde_json::Value = self.read_document("batch", batch_id, &path)?;
        batch_state::upgrade(value).map_err(|e| {
            warn!(batch_id, error = %e, "Batch document failed schema migration");
            StoreError::Corrupted(path)
        })
    }

    /// Removes a batch document, its backup and its lock file.
    pub fn delete_batch(&self, batch_id: &str) -> Result<(), StoreError> {
        let path = self.document_path(Self::BATCHES, batch_id)?;
        remove_if_present(&path)?;
        remove_if_present(&backup_path(&path))?;
        remove_if_present(&path.with_file_name(format!("{}.json.lock", batch_id)))?;
        debug!(batch_id, "Deleted batch state");
        Ok(())
    }

    /// Lists ids of all persisted batches.
    pub fn list_batches(&self) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(self.root.join(Self::BATCHES))? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(id) = name.strip_suffix(".json") {
                if !id.starts_with('.') {
                    ids.push(id.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    // ── loops ──────────────────────────────────────────────────────────

    /// Persists a loop document atomically.
    pub fn save_loop(&self, state: &LoopState) -> Result<(), StoreError> {
        self.save_document(Self::LOOPS, &state.session_id, state)
    }

    /// Loads a loop document.
    pub fn load_loop(&self, session_id: &str) -> Result<LoopState, StoreError> {
        let path = self.document_path(Self::LOOPS, session_id)?;
        self.read_document("loop", session_id, &path)
    }

    /// Removes a loop document and its backup.
    pub fn delete_loop(&self, session_id: &str) -> Result<(), StoreError> {
        let path = self.document_path(Self::LOOPS, session_id)?;
        remove_if_present(&path)?;
        remove_if_present(&backup_path(&path))?;
        Ok(())
    }

    // ── checkpoints and loop-backs ─────────────────────────────────────

    /// Persists an arbitrary checkpoint document under the batch id.
    pub fn save_checkpoint<T: Serialize>(
        &self,
        batch_id: &str,
        doc: &T,
    ) -> Result<(), StoreError> {
        self.save_document(Self::CHECKPOINTS, batch_id, doc)
    }

    /// Loads a checkpoint document for the batch id.
    pub fn load_checkpoint<T: DeserializeOwned>(&self, batch_id: &str) -> Result<T, StoreError> {
        let path = self.document_path(Self::CHECKPOINTS, batch_id)?;
        self.read_document("checkpoint", batch_id, &path)
    }

    /// Removes a checkpoint document.
    pub fn delete_checkpoint(&self, batch_id: &str) -> Result<(), StoreError> {
        let path = self.document_path(Self::CHECKPOINTS, batch_id)?;
        remove_if_present(&path)?;
        remove_if_present(&backup_path(&path))?;
        Ok(())
    }

    /// Persists a loop-back checkpoint under the session id.
    pub fn save_loopback<T: Serialize>(
        &self,
        session_id: &str,
        doc: &T,
    ) -> Result<(), StoreError> {
        self.save_document(Self::LOOPBACKS, session_id, doc)
    }

    /// Loads a loop-back checkpoint for the session id.
    pub fn load_loopback<T: DeserializeOwned>(&self, session_id: &str) -> Result<T, StoreError> {
        let path = self.document_path(Self::LOOPBACKS, session_id)?;
        self.read_document("loopback", session_id, &path)
    }

    // ── internals ──────────────────────────────────────────────────────

    /// Validates an id and produces the document path for it.
    ///
    /// Validation happens before any path is built, so `load`/`save` can
    /// never touch a path outside the state directory.
    fn document_path(&self, kind_dir: &str, id: &str) -> Result<PathBuf, StoreError> {
        validate_id(id)?;
        Ok(self.root.join(kind_dir).join(format!("{id}.json")))
    }

    fn save_document<T: Serialize>(
        &self,
        kind_dir: &str,
        id: &str,
        doc: &T,
    ) -> Result<(), StoreError> {
        let path = self.document_path(kind_dir, id)?;
        refuse_symlink(&path)?;

        let lock = FileLock::for_document(&path)?;
        let _guard = lock.exclusive()?;

        let bytes = serde_json::to_vec_pretty(doc)?;
        atomic_write(&path, &bytes)?;
        debug!(id, kind = kind_dir, path = %path.display(), "State persisted");
        Ok(())
    }

    fn read_document<T: DeserializeOwned>(
        &self,
        kind: &'static str,
        id: &str,
        path: &Path,
    ) -> Result<T, StoreError> {
        refuse_symlink(path)?;

        let lock = FileLock::for_document(path)?;
        let _guard = lock.shared()?;

        if !path.exists() {
            return Err(StoreError::NotFound {
                kind,
                id: id.to_string(),
            });
        }

        match parse_file(path) {
            Ok(doc) => Ok(doc),
            Err(primary_err) => {
                let bak = backup_path(path);
                if bak.exists() {
                    match parse_file(&bak) {
                        Ok(doc) => {
                            warn!(
                                id,
                                path = %path.display(),
                                error = %primary_err,
                                "State file unreadable, recovered from backup"
                            );
                            Ok(doc)
                        }
                        Err(backup_err) => {
                            warn!(
                                id,
                                path = %path.display(),
                                error = %backup_err,
                                "Backup also unreadable"
                            );
                            Err(StoreError::Corrupted(path.to_path_buf()))
                        }
                    }
                } else {
                    warn!(id, path = %path.display(), error = %primary_err, "State file corrupted, no backup");
                    Err(StoreError::Corrupted(path.to_path_buf()))
                }
            }
        }
    }
}

/// Rejects ids that could escape the state directory.
pub fn validate_id(id: &str) -> Result<(), StoreError> {
    let invalid = id.is_empty()
        || id.len() > 128
        || id.contains('/')
        || id.contains('\\')
        || id.contains("..")
        || id.starts_with('.')
        || id.chars().any(|c| c.is_control() || c == ':');
    if invalid {
        return Err(StoreError::InvalidId(id.to_string()));
    }
    Ok(())
}

fn parse_file<T: DeserializeOwned>(path: &Path) -> Result<T, serde_json::Error> {
    let content = std::fs::read_to_string(path).map_err(serde_json::Error::io)?;
    serde_json::from_str(&content)
}

fn refuse_symlink(path: &Path) -> Result<(), StoreError> {
    if let Ok(meta) = std::fs::symlink_metadata(path) {
        if meta.file_type().is_symlink() {
            return Err(StoreError::SymlinkRefused(path.to_path_buf()));
        }
    }
    Ok(())
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".bak");
    path.with_file_name(name)
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Writes `bytes` to `path` via a same-directory temp file and atomic rename.
///
/// The previous document, if any, is preserved as the `.bak` sibling before
/// the rename so a later corrupted read has something to fall back to.
fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{file_name}.tmp"));

    std::fs::write(&tmp, bytes)?;
    restrict_permissions(&tmp)?;

    if path.exists() {
        std::fs::copy(path, backup_path(path))?;
    }

    std::fs::rename(&tmp, path)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch_state::BatchStatus;
    use tempfile::TempDir;

    fn store() -> (TempDir, StateStore) {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::new(tmp.path().join("state")).unwrap();
        (tmp, store)
    }

    #[test]
    fn test_batch_save_load_round_trip() {
        let (_tmp, store) = store();
        let mut batch = BatchState::from_descriptions(["A", "B"]);
        batch.status = BatchStatus::Running;
        batch.features[0].begin_attempt();

        store.save_batch(&batch).unwrap();
        let loaded = store.load_batch(&batch.batch_id).unwrap();

        assert_eq!(
            serde_json::to_value(&loaded).unwrap(),
            serde_json::to_value(&batch).unwrap()
        );
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let (_tmp, store) = store();
        let err = store.load_batch("batch-1-aaaa").unwrap_err();
        assert!(matches!(err, StoreError::NotFound { kind: "batch", .. }));
    }

    #[test]
    fn test_corrupted_without_backup_is_corrupted() {
        let (_tmp, store) = store();
        let batch = BatchState::from_descriptions(["A"]);
        let path = store
            .root()
            .join("batches")
            .join(format!("{}.json", batch.batch_id));
        std::fs::write(&path, "{ not json").unwrap();

        let err = store.load_batch(&batch.batch_id).unwrap_err();
        assert!(matches!(err, StoreError::Corrupted(_)));
    }

    #[test]
    fn test_corrupted_falls_back_to_backup() {
        let (_tmp, store) = store();
        let mut batch = BatchState::from_descriptions(["A"]);
        store.save_batch(&batch).unwrap();

        // Second save creates the .bak sibling from the first document
        batch.current_index = 1;
        store.save_batch(&batch).unwrap();

        // Corrupt the live file
        let path = store
            .root()
            .join("batches")
            .join(format!("{}.json", batch.batch_id));
        std::fs::write(&path, "garbage").unwrap();

        let recovered = store.load_batch(&batch.batch_id).unwrap();
        assert_eq!(recovered.batch_id, batch.batch_id);
        // The backup holds the previous generation
        assert_eq!(recovered.current_index, 0);
    }

    #[test]
    fn test_traversal_ids_rejected() {
        let (_tmp, store) = store();
        for id in [
            "../escape",
            "a/../../b",
            "nested/id",
            "back\\slash",
            "..",
            ".hidden",
            "",
            "id:colon",
        ] {
            let err = store.load_batch(id).unwrap_err();
            assert!(
                matches!(err, StoreError::InvalidId(_)),
                "id {id:?} was not rejected"
            );
        }
        // Nothing was created anywhere under the store root
        let entries: Vec<_> = std::fs::read_dir(store.root().join("batches"))
            .unwrap()
            .collect();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_save_rejects_invalid_batch_id() {
        let (_tmp, store) = store();
        let mut batch = BatchState::from_descriptions(["A"]);
        batch.batch_id = "../../etc/passwd".to_string();
        let err = store.save_batch(&batch).unwrap_err();
        assert!(matches!(err, StoreError::InvalidId(_)));
    }

    #[test]
    fn test_symlinked_document_refused() {
        #[cfg(unix)]
        {
            let (_tmp, store) = store();
            let target = store.root().join("elsewhere.json");
            std::fs::write(&target, "{}").unwrap();
            let link = store.root().join("batches").join("batch-1-aaaa.json");
            std::os::unix::fs::symlink(&target, &link).unwrap();

            let err = store.load_batch("batch-1-aaaa").unwrap_err();
            assert!(matches!(err, StoreError::SymlinkRefused(_)));
        }
    }

    #[test]
    fn test_owner_only_permissions() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            let (_tmp, store) = store();
            let batch = BatchState::from_descriptions(["A"]);
            store.save_batch(&batch).unwrap();

            let path = store
                .root()
                .join("batches")
                .join(format!("{}.json", batch.batch_id));
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let (_tmp, store) = store();
        let batch = BatchState::from_descriptions(["A"]);
        store.save_batch(&batch).unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(store.root().join("batches"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_loop_round_trip() {
        let (_tmp, store) = store();
        let mut state = LoopState::new("session-7");
        state.record_attempt(false, 42, Some("timeout".into()), 3);

        store.save_loop(&state).unwrap();
        let loaded = store.load_loop("session-7").unwrap();
        assert_eq!(loaded.iteration_count, 1);
        assert_eq!(loaded.tokens_used, 42);
    }

    #[test]
    fn test_delete_batch_removes_all_siblings() {
        let (_tmp, store) = store();
        let mut batch = BatchState::from_descriptions(["A"]);
        store.save_batch(&batch).unwrap();
        batch.touch();
        store.save_batch(&batch).unwrap();

        store.delete_batch(&batch.batch_id).unwrap();
        assert!(matches!(
            store.load_batch(&batch.batch_id),
            Err(StoreError::NotFound { .. })
        ));
        let dir = store.root().join("batches");
        let remaining: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.contains(&batch.batch_id))
            .collect();
        assert!(remaining.is_empty(), "leftovers: {remaining:?}");
    }

    #[test]
    fn test_list_batches() {
        let (_tmp, store) = store();
        let a = BatchState::from_descriptions(["A"]);
        let mut b = BatchState::from_descriptions(["B"]);
        b.batch_id = format!("{}-2", a.batch_id);
        store.save_batch(&a).unwrap();
        store.save_batch(&b).unwrap();

        let ids = store.list_batches().unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a.batch_id));
        assert!(ids.contains(&b.batch_id));
    }

    #[test]
    fn test_load_v1_batch_document() {
        let (_tmp, store) = store();
        let path = store.root().join("batches").join("batch-1700-cafe.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "batch_id": "batch-1700-cafe",
                "features": [{"description": "A", "status": "pending"}],
                "current_index": 0,
                "status": "pending",
                "created_at": "2026-01-03T10:00:00Z",
                "updated_at": "2026-01-03T10:00:00Z"
            })
            .to_string(),
        )
        .unwrap();

        let state = store.load_batch("batch-1700-cafe").unwrap();
        assert_eq!(state.schema_version, crate::batch_state::CURRENT_SCHEMA_VERSION);
        assert!(state.retry_history.is_empty());
    }
}
