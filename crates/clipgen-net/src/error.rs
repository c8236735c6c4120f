use std::io;
use std::time::Duration;

/// Crate-local error type for `clipgen-net` operations.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// A peer sent something other than what the current collective expects.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("rank {rank} failed to join process group: {reason}")]
    GroupJoinFailed { rank: usize, reason: String },

    #[error("process group has been destroyed")]
    GroupDestroyed,

    #[error("peer {peer} out of range for world size {world_size}")]
    PeerOutOfRange { peer: usize, world_size: usize },

    /// Nothing arrived from `peer` within the collective timeout.
    #[error("rank {rank} stalled waiting {waited:?} for rank {peer}")]
    CollectiveStall { rank: usize, peer: usize, waited: Duration },

    /// `peer` has already moved on to a later request than this rank.
    #[error("rank {peer} is on request {peer_epoch}, this rank is still on {epoch}")]
    PeerAhead { peer: usize, epoch: u64, peer_epoch: u64 },

    #[error("connection to rank {peer} closed")]
    Disconnected { peer: usize },
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, NetError>;
