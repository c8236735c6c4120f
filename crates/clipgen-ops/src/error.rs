use clipgen_types::TensorError;

#[derive(Debug, thiserror::Error)]
pub enum OpsError {
    /// Caller broke an input contract (bad index, mismatched shapes).
    #[error("contract violation: {0}")]
    ContractViolation(String),

    #[error("tensor error: {0}")]
    Tensor(#[from] TensorError),

    /// The decoder collaborator failed on a tile.
    #[error("decoder failed on tile ({row}, {col}), frames {frames:?}: {reason}")]
    Decode {
        row: usize,
        col: usize,
        frames: std::ops::Range<usize>,
        reason: String,
    },
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, OpsError>;
