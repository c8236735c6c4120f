//! Messages exchanged between ranks.

use serde::{Deserialize, Serialize};

use clipgen_types::Tensor;

/// Which operation a frame belongs to. Every rank runs the same sequence of
/// operations, so a receiver always knows the kind it should see next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    PointToPoint,
    GatherSizes,
    Gather,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FramePayload {
    Size(u64),
    Tensor(Tensor),
}

/// One message on the wire.
///
/// `epoch` identifies the request the sender was serving. A rank that gave
/// up on a request leaves its frames behind on the link; the receiver uses
/// the epoch to tell those apart from the frames of the request it is in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectiveFrame {
    pub from_rank: u32,
    pub epoch: u64,
    pub kind: FrameKind,
    pub payload: FramePayload,
}

impl CollectiveFrame {
    pub fn tensor(from_rank: usize, epoch: u64, kind: FrameKind, tensor: Tensor) -> Self {
        Self { from_rank: from_rank as u32, epoch, kind, payload: FramePayload::Tensor(tensor) }
    }

    pub fn size(from_rank: usize, epoch: u64, size: usize) -> Self {
        Self {
            from_rank: from_rank as u32,
            epoch,
            kind: FrameKind::GatherSizes,
            payload: FramePayload::Size(size as u64),
        }
    }
}
