//! Advisory locking for state documents.
//!
//! State files are guarded with `flock()` on a `.lock` sibling: shared for
//! reads, exclusive for writes. The sibling file (rather than the document
//! itself) is locked because the store replaces documents by atomic rename,
//! which would silently detach a lock held on the old inode.
//!
//! This is advisory protection for the supported single-operator model, not
//! hard mutual exclusion; see [`StateStore`](crate::state_store::StateStore)
//! for the last-writer-wins policy.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Advisory lock for one state document.
#[derive(Debug)]
pub struct FileLock {
    lock_path: PathBuf,
}

/// Kind of lock to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockKind {
    Shared,
    Exclusive,
}

impl FileLock {
    /// Creates a lock handle for the document at `path`.
    ///
    /// The lock file lives at `<path>.lock`; its parent directory is created
    /// if missing.
    pub fn for_document(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let mut name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push_str(".lock");
        let lock_path = path.with_file_name(name);

        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        Ok(Self { lock_path })
    }

    /// Acquires a shared (read) lock, blocking until available.
    pub fn shared(&self) -> io::Result<LockGuard> {
        self.acquire(LockKind::Shared)
    }

    /// Acquires an exclusive (write) lock, blocking until available.
    pub fn exclusive(&self) -> io::Result<LockGuard> {
        self.acquire(LockKind::Exclusive)
    }

    /// Tries to take an exclusive lock without blocking.
    ///
    /// Returns `Ok(None)` if another holder has it.
    pub fn try_exclusive(&self) -> io::Result<Option<LockGuard>> {
        let file = self.open_lock_file()?;

        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::fcntl::{Flock, FlockArg};

            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(flock) => Ok(Some(LockGuard { _flock: flock })),
                Err((_, errno)) if errno == Errno::EWOULDBLOCK || errno == Errno::EAGAIN => {
                    Ok(None)
                }
                Err((_, errno)) => Err(io::Error::other(format!("flock failed: {}", errno))),
            }
        }

        #[cfg(not(unix))]
        {
            let _ = file;
            Err(unsupported())
        }
    }

    fn acquire(&self, kind: LockKind) -> io::Result<LockGuard> {
        let file = self.open_lock_file()?;

        #[cfg(unix)]
        {
            use nix::fcntl::{Flock, FlockArg};

            let arg = match kind {
                LockKind::Shared => FlockArg::LockShared,
                LockKind::Exclusive => FlockArg::LockExclusive,
            };

            match Flock::lock(file, arg) {
                Ok(flock) => Ok(LockGuard { _flock: flock }),
                Err((_, errno)) => Err(io::Error::other(format!("flock failed: {}", errno))),
            }
        }

        #[cfg(not(unix))]
        {
            let _ = (file, kind);
            Err(unsupported())
        }
    }

    fn open_lock_file(&self) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
    }

    /// Path of the `.lock` sibling.
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

#[cfg(not(unix))]
fn unsupported() -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        "File locking not supported on this platform",
    )
}

/// RAII guard; the lock is released on drop.
#[derive(Debug)]
pub struct LockGuard {
    #[cfg(unix)]
    _flock: nix::fcntl::Flock<File>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_path_naming() {
        let tmp = TempDir::new().unwrap();
        let doc = tmp.path().join("batches/b1.json");

        let lock = FileLock::for_document(&doc).unwrap();
        assert_eq!(lock.lock_path(), tmp.path().join("batches/b1.json.lock"));
        // Parent directory was created alongside the lock handle
        assert!(tmp.path().join("batches").is_dir());
    }

    #[test]
    fn test_shared_and_exclusive_acquire() {
        let tmp = TempDir::new().unwrap();
        let doc = tmp.path().join("state.json");

        let lock = FileLock::for_document(&doc).unwrap();
        drop(lock.shared().unwrap());
        drop(lock.exclusive().unwrap());
    }

    #[test]
    fn test_exclusive_blocks_second_holder() {
        let tmp = TempDir::new().unwrap();
        let doc = tmp.path().join("state.json");

        let lock1 = FileLock::for_document(&doc).unwrap();
        let lock2 = FileLock::for_document(&doc).unwrap();

        let _held = lock1.exclusive().unwrap();
        assert!(lock2.try_exclusive().unwrap().is_none());
    }

    #[test]
    fn test_released_on_drop() {
        let tmp = TempDir::new().unwrap();
        let doc = tmp.path().join("state.json");

        let lock1 = FileLock::for_document(&doc).unwrap();
        let lock2 = FileLock::for_document(&doc).unwrap();

        {
            let _held = lock1.exclusive().unwrap();
        }
        assert!(lock2.try_exclusive().unwrap().is_some());
    }

    #[test]
    fn test_shared_blocks_exclusive() {
        let tmp = TempDir::new().unwrap();
        let doc = tmp.path().join("state.json");

        let lock1 = FileLock::for_document(&doc).unwrap();
        let lock2 = FileLock::for_document(&doc).unwrap();

        let _reader = lock1.shared().unwrap();
        assert!(lock2.try_exclusive().unwrap().is_none());
    }
}
