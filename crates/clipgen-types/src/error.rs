// Shared error types. Crates layer their own enums on top of these.

#[derive(Debug, thiserror::Error)]
pub enum ClipgenError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Shape errors raised by [`crate::tensor::Tensor`] operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TensorError {
    #[error("element count {actual} does not match shape {shape:?}")]
    ElementCount { shape: Vec<usize>, actual: usize },

    #[error("axis {axis} out of range for rank {rank}")]
    AxisOutOfRange { axis: usize, rank: usize },

    #[error("narrow {start}..{end} exceeds axis length {len}")]
    NarrowOutOfRange { start: usize, end: usize, len: usize },

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("expected a {expected}-d tensor, got shape {shape:?}")]
    Rank { expected: usize, shape: Vec<usize> },
}
