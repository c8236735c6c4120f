//! Pod work coordinator.
//!
//! Runs a piece of expensive, idempotent setup work (a weight download, a
//! checkpoint sharding pass) at most once across any number of independent
//! worker processes that share a filesystem, with no lock service:
//!
//! ```text
//!   is_complete()? ──yes──▶ AlreadyComplete          (no lock, no side effects)
//!        │ no
//!        ▼
//!   try_acquire(.<lock>.lock)
//!        ├─ Acquired ──▶ is_complete()? ──yes──▶ CompletedDuringAcquire
//!        │                    │ no
//!        │                    ▼
//!        │               do_work() ──▶ Performed      (lock file removed on every path)
//!        │
//!        ├─ HeldByOther ──▶ poll every `poll_interval`
//!        │                    ├─ is_complete()      ──▶ CompletedByPeer
//!        │                    ├─ lock file vanished ──▶ RetryNeeded
//!        │                    └─ max_wait elapsed   ──▶ Err(LockTimeout)
//!        │
//!        └─ Error ──▶ Err(Io)
//! ```
//!
//! Mutual exclusion is best effort. A holder that crashes leaves a stale file
//! that waiters cannot distinguish from a live holder until `max_wait`, and
//! the unlink/unlock window lets a late opener lock an orphaned inode. Both
//! are harmless as long as `do_work` is idempotent and `is_complete` is
//! side-effect free.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{Result, StoreError};
use crate::lockfile::{self, LockOutcome};

// ── Work description ──────────────────────────────────────────────────────────

/// Identifies one exclusive unit of deferred setup work.
#[derive(Debug, Clone)]
pub struct PodWork {
    /// Directory holding the lock file. Created on the slow path.
    pub work_dir: PathBuf,
    /// Lock file is `.<lock_name>.lock` inside `work_dir`.
    pub lock_name: String,
    /// Label used in log fields and error messages.
    pub description: String,
    /// Give up waiting on another holder after this long.
    pub max_wait: Duration,
    /// Re-check interval while waiting.
    pub poll_interval: Duration,
}

impl PodWork {
    pub fn new(work_dir: impl Into<PathBuf>, lock_name: impl Into<String>) -> Self {
        let lock_name = lock_name.into();
        Self {
            work_dir: work_dir.into(),
            description: lock_name.clone(),
            lock_name,
            max_wait: Duration::from_secs(1800),
            poll_interval: Duration::from_secs(30),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn lock_path(&self) -> PathBuf {
        lockfile::lock_path(&self.work_dir, &self.lock_name)
    }
}

/// How a successful coordination call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinationOutcome {
    /// Complete before any lock was attempted.
    AlreadyComplete,
    /// This process held the lock and ran the work.
    Performed,
    /// This process got the lock but another one had finished in between.
    CompletedDuringAcquire,
    /// Another process held the lock and finished while we polled.
    CompletedByPeer,
    /// The holder's lock file disappeared while the work was still
    /// incomplete. Nothing was done; the caller should call again.
    RetryNeeded,
}

impl CoordinationOutcome {
    pub fn is_complete(&self) -> bool {
        !matches!(self, Self::RetryNeeded)
    }
}

// ── Coordination ──────────────────────────────────────────────────────────────

/// Run `do_work` under the pod lock unless `is_complete` already holds.
///
/// `is_complete` must be pure and safe to call from many processes at once.
/// Errors from `do_work` are returned unchanged once the lock file is gone.
pub async fn coordinate_pod_work<C, W, F>(
    work: &PodWork,
    is_complete: C,
    do_work: W,
) -> Result<CoordinationOutcome>
where
    C: Fn() -> bool,
    W: FnOnce() -> F,
    F: Future<Output = Result<()>>,
{
    if is_complete() {
        info!(work = %work.description, "already complete, skipping");
        return Ok(CoordinationOutcome::AlreadyComplete);
    }

    info!(
        work = %work.description,
        dir = %work.work_dir.display(),
        "work needed, coordinating across processes"
    );
    tokio::fs::create_dir_all(&work.work_dir).await?;

    match lockfile::try_acquire(&work.work_dir, &work.lock_name) {
        LockOutcome::Acquired(guard) => {
            if is_complete() {
                info!(work = %work.description, "completed by another process during lock acquisition");
                return Ok(CoordinationOutcome::CompletedDuringAcquire);
            }

            info!(work = %work.description, lock = %guard.path().display(), "lock acquired, performing work");
            let result = do_work().await;
            drop(guard);

            match result {
                Ok(()) => {
                    info!(work = %work.description, "work completed");
                    Ok(CoordinationOutcome::Performed)
                }
                Err(e) => {
                    warn!(work = %work.description, error = %e, "work failed");
                    Err(e)
                }
            }
        }
        LockOutcome::HeldByOther => {
            info!(work = %work.description, "another process holds the lock, waiting");
            wait_for_completion(work, &is_complete).await
        }
        LockOutcome::Error(e) => {
            warn!(work = %work.description, error = %e, "could not take lock");
            Err(StoreError::Io(e))
        }
    }
}

/// [`coordinate_pod_work`] repeated while it reports `RetryNeeded`, up to
/// `max_attempts` calls.
pub async fn coordinate_with_retry<C, W, F>(
    work: &PodWork,
    max_attempts: u32,
    is_complete: C,
    do_work: W,
) -> Result<CoordinationOutcome>
where
    C: Fn() -> bool,
    W: Fn() -> F,
    F: Future<Output = Result<()>>,
{
    let attempts = max_attempts.max(1);
    for attempt in 1..=attempts {
        let outcome = coordinate_pod_work(work, &is_complete, &do_work).await?;
        if outcome.is_complete() {
            return Ok(outcome);
        }
        warn!(work = %work.description, attempt, "lock holder vanished, retrying");
    }
    Ok(CoordinationOutcome::RetryNeeded)
}

async fn wait_for_completion<C>(work: &PodWork, is_complete: &C) -> Result<CoordinationOutcome>
where
    C: Fn() -> bool,
{
    let lock_path = work.lock_path();
    let started = Instant::now();

    loop {
        if is_complete() {
            info!(work = %work.description, "completed by another process");
            return Ok(CoordinationOutcome::CompletedByPeer);
        }
        if !lock_exists(&lock_path).await {
            warn!(work = %work.description, "lock file gone but work incomplete");
            return Ok(CoordinationOutcome::RetryNeeded);
        }

        let waited = started.elapsed();
        if waited >= work.max_wait {
            return Err(StoreError::LockTimeout {
                work: work.description.clone(),
                dir: work.work_dir.clone(),
                waited_secs: waited.as_secs(),
            });
        }

        info!(
            work = %work.description,
            waited_secs = waited.as_secs(),
            max_wait_secs = work.max_wait.as_secs(),
            "still waiting"
        );
        let remaining = work.max_wait - waited;
        tokio::time::sleep(work.poll_interval.min(remaining)).await;
    }
}

async fn lock_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn never_runs() -> Result<()> {
        panic!("work must not run");
    }

    fn fast(dir: &Path, lock: &str) -> PodWork {
        PodWork::new(dir, lock)
            .poll_interval(Duration::from_millis(10))
            .max_wait(Duration::from_secs(10))
    }

    #[tokio::test]
    async fn fast_path_has_no_side_effects() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("never-created");
        let work = fast(&dir, "work");

        let outcome = coordinate_pod_work(&work, || true, never_runs).await.unwrap();

        assert_eq!(outcome, CoordinationOutcome::AlreadyComplete);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn performs_work_and_cleans_lock() {
        let dir = tempfile::tempdir().unwrap();
        let work = fast(dir.path(), "work");
        let marker = dir.path().join("done");

        let target = marker.clone();
        let outcome = coordinate_pod_work(
            &work,
            || marker.exists(),
            move || async move {
                std::fs::write(&target, b"ok")?;
                Ok::<(), StoreError>(())
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome, CoordinationOutcome::Performed);
        assert!(!work.lock_path().exists());

        // Second call is the idempotent fast path.
        let again = coordinate_pod_work(&work, || marker.exists(), never_runs)
            .await
            .unwrap();
        assert_eq!(again, CoordinationOutcome::AlreadyComplete);
    }

    #[tokio::test]
    async fn failing_work_still_removes_lock() {
        let dir = tempfile::tempdir().unwrap();
        let work = fast(dir.path(), "sharding");

        let err = coordinate_pod_work(&work, || false, || async {
            Err(StoreError::SetupFailed { work: "sharding".into(), reason: "boom".into() })
        })
        .await
        .unwrap_err();

        assert!(matches!(err, StoreError::SetupFailed { .. }));
        assert!(!work.lock_path().exists());
    }

    #[tokio::test]
    async fn waiter_times_out_on_stuck_holder() {
        let dir = tempfile::tempdir().unwrap();
        let work = fast(dir.path(), "download").max_wait(Duration::from_millis(60));

        let _held = match lockfile::try_acquire(dir.path(), "download") {
            LockOutcome::Acquired(g) => g,
            other => panic!("expected Acquired, got {other:?}"),
        };

        let err = coordinate_pod_work(&work, || false, || async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout { .. }));
    }

    #[tokio::test]
    async fn vanished_lock_asks_for_retry() {
        let dir = tempfile::tempdir().unwrap();
        let work = fast(dir.path(), "download");
        let path = work.lock_path();

        let held = match lockfile::try_acquire(dir.path(), "download") {
            LockOutcome::Acquired(g) => g,
            other => panic!("expected Acquired, got {other:?}"),
        };

        // Holder gives up without completing after a short delay.
        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(held);
        });

        let outcome = coordinate_pod_work(&work, || false, || async { Ok(()) })
            .await
            .unwrap();
        releaser.await.unwrap();

        assert_eq!(outcome, CoordinationOutcome::RetryNeeded);
        assert!(!path.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_run_work_once() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("weights.done");
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let work = fast(dir.path(), "download");
            let marker = marker.clone();
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                let check = marker.clone();
                coordinate_with_retry(
                    &work,
                    5,
                    move || check.exists(),
                    || {
                        let marker = marker.clone();
                        let runs = Arc::clone(&runs);
                        async move {
                            runs.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            std::fs::write(&marker, b"ok")?;
                            Ok::<(), StoreError>(())
                        }
                    },
                )
                .await
            }));
        }

        for h in handles {
            let outcome = h.await.unwrap().unwrap();
            assert!(outcome.is_complete());
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(marker.exists());
        assert!(!dir.path().join(".download.lock").exists());
    }
}
