use std::io;
use std::path::PathBuf;

/// Crate-local error type for `clipgen-store` operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Another process held the lock and did not finish in time. Retryable.
    #[error("timed out after {waited_secs}s waiting for {work} in {dir}")]
    LockTimeout { work: String, dir: PathBuf, waited_secs: u64 },

    /// The lock holder's work action failed. The lock file has been removed.
    #[error("{work} failed: {reason}")]
    SetupFailed { work: String, reason: String },

    /// Artifact creation failed part-way; the directory has been removed.
    #[error("partial artifact in {dir} removed: {reason}")]
    PartialArtifact { dir: PathBuf, reason: String },

    #[error("{shard} failed integrity check: expected {expected}, got {actual}")]
    IntegrityMismatch { shard: String, expected: String, actual: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StoreError>;
