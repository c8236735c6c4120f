use std::time::Duration;

use clipgen_net::NetError;
use clipgen_ops::OpsError;
use clipgen_types::{ClipgenError, ModelComponent, TensorError};

use crate::context::ContextState;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The rank could not join its process group. Fatal for the rank.
    #[error("rank {rank} failed to join process group: {reason}")]
    GroupJoinFailed { rank: usize, reason: String },

    /// A component factory failed. Fatal for the rank.
    #[error("rank {rank} failed to load {component}: {reason}")]
    ModelLoadFailed { rank: usize, component: ModelComponent, reason: String },

    #[error("invalid state transition: {from} → {to}")]
    InvalidTransition { from: ContextState, to: ContextState },

    #[error("rank {rank} context has been terminated")]
    ContextTerminated { rank: usize },

    #[error("pipeline initialization exceeded {0:?}")]
    InitTimeout(Duration),

    /// A rank never reached, or never left, a collective.
    #[error("collective stalled: {0}")]
    CollectiveStall(String),

    #[error("rank {rank} worker is gone")]
    WorkerGone { rank: usize },

    /// A loaded model failed while serving a request.
    #[error("rank {rank} {component} failed: {reason}")]
    Model { rank: usize, component: ModelComponent, reason: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Ops(#[from] OpsError),

    #[error("network error: {0}")]
    Net(NetError),

    #[error("tensor error: {0}")]
    Tensor(#[from] TensorError),
}

impl From<NetError> for PipelineError {
    fn from(e: NetError) -> Self {
        match e {
            NetError::CollectiveStall { .. } => Self::CollectiveStall(e.to_string()),
            other => Self::Net(other),
        }
    }
}

impl From<ClipgenError> for PipelineError {
    fn from(e: ClipgenError) -> Self {
        Self::InvalidRequest(e.to_string())
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, PipelineError>;
