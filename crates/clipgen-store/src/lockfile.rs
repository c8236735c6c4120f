//! Advisory lock files.
//!
//! Layout: `<work_dir>/.<lock_name>.lock`
//!
//! The lock is an exclusive, non-blocking `flock` on that file. It is
//! advisory: it only excludes other processes that use the same protocol,
//! and a crashed holder can leave the file behind (the kernel drops the lock
//! itself, but not the file). Holders remove the file when they leave the
//! critical section; waiters treat a vanished file as "the holder gave up".

use std::fs::{self, File, OpenOptions, TryLockError};
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Path of the lock file for `lock_name` inside `work_dir`.
pub fn lock_path(work_dir: &Path, lock_name: &str) -> PathBuf {
    work_dir.join(format!(".{lock_name}.lock"))
}

/// Result of one non-blocking lock attempt.
#[derive(Debug)]
pub enum LockOutcome {
    /// This process now holds the lock.
    Acquired(LockGuard),
    /// Another process (or another handle in this process) holds it.
    HeldByOther,
    /// The lock file could not be opened or locked.
    Error(io::Error),
}

/// Try once to take the exclusive lock. Never blocks.
pub fn try_acquire(work_dir: &Path, lock_name: &str) -> LockOutcome {
    let path = lock_path(work_dir, lock_name);
    let file = match OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
    {
        Ok(f) => f,
        Err(e) => return LockOutcome::Error(e),
    };

    match file.try_lock() {
        Ok(()) => {
            debug!(path = %path.display(), "lock acquired");
            LockOutcome::Acquired(LockGuard { file: Some(file), path })
        }
        Err(TryLockError::WouldBlock) => LockOutcome::HeldByOther,
        Err(TryLockError::Error(e)) => LockOutcome::Error(e),
    }
}

/// Held lock. Dropping it removes the lock file and releases the lock, on
/// every exit path including unwinding.
#[derive(Debug)]
pub struct LockGuard {
    file: Option<File>,
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Unlink before unlocking so a process that opens the path afterwards
        // gets a fresh file instead of the one we are about to release.
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove lock file"),
        }
        if let Some(file) = self.file.take() {
            if let Err(e) = file.unlock() {
                warn!(path = %self.path.display(), error = %e, "failed to release lock");
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_attempt_sees_holder() {
        let dir = tempfile::tempdir().unwrap();

        let guard = match try_acquire(dir.path(), "work") {
            LockOutcome::Acquired(g) => g,
            other => panic!("expected Acquired, got {other:?}"),
        };
        assert!(guard.path().ends_with(".work.lock"));
        assert!(guard.path().exists());

        assert!(matches!(try_acquire(dir.path(), "work"), LockOutcome::HeldByOther));
        // Different lock names do not interfere.
        assert!(matches!(try_acquire(dir.path(), "other"), LockOutcome::Acquired(_)));
    }

    #[test]
    fn drop_removes_file_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(dir.path(), "download");

        if let LockOutcome::Acquired(guard) = try_acquire(dir.path(), "download") {
            drop(guard);
        } else {
            panic!("lock not acquired");
        }
        assert!(!path.exists());
        assert!(matches!(try_acquire(dir.path(), "download"), LockOutcome::Acquired(_)));
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(try_acquire(&missing, "work"), LockOutcome::Error(_)));
    }
}
