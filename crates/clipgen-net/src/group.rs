//! The process-group abstraction every rank talks through.
//!
//! Transports only move frames between pairs of ranks; the point-to-point
//! and collective operations are built on top of that here, so every
//! transport gets identical semantics.
//!
//! Every frame carries the sender's request epoch. A receiver drops frames
//! from earlier epochs and holds back frames from later ones, so a request
//! that failed partway through cannot leak into the next.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError};
use tracing::debug;

use clipgen_types::Tensor;

use crate::error::{NetError, Result};
use crate::frame::{CollectiveFrame, FrameKind, FramePayload};

/// Communication context binding `world_size` ranks.
///
/// Frames between one ordered pair of ranks arrive in the order they were
/// sent. `send_frame` never waits for the receiver, so every rank may send
/// before anyone receives.
pub trait ProcessGroup: Send {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;

    fn send_frame(&mut self, dst: usize, frame: CollectiveFrame) -> Result<()>;
    fn recv_frame(&mut self, src: usize) -> Result<CollectiveFrame>;

    /// Tear down links to every peer. Later operations fail with
    /// `GroupDestroyed`; calling it twice is a no-op.
    fn destroy(&mut self);
    fn is_destroyed(&self) -> bool;

    /// The request this rank is currently serving.
    fn epoch(&self) -> u64;

    /// Enter request `epoch`. Held-back frames older than it are dropped.
    fn set_epoch(&mut self, epoch: u64);

    fn send(&mut self, dst: usize, tensor: &Tensor) -> Result<()> {
        let frame =
            CollectiveFrame::tensor(self.rank(), self.epoch(), FrameKind::PointToPoint, tensor.clone());
        self.send_frame(dst, frame)
    }

    fn recv(&mut self, src: usize) -> Result<Tensor> {
        let frame = self.recv_frame(src)?;
        expect_tensor(frame, src, FrameKind::PointToPoint)
    }

    /// Every rank's `local` value, indexed by rank.
    fn all_gather_sizes(&mut self, local: usize) -> Result<Vec<usize>> {
        let (me, world, epoch) = (self.rank(), self.world_size(), self.epoch());
        for peer in (0..world).filter(|&p| p != me) {
            self.send_frame(peer, CollectiveFrame::size(me, epoch, local))?;
        }

        let mut sizes = Vec::with_capacity(world);
        for peer in 0..world {
            if peer == me {
                sizes.push(local);
                continue;
            }
            let frame = self.recv_frame(peer)?;
            match expect_payload(frame, peer, FrameKind::GatherSizes)? {
                FramePayload::Size(n) => sizes.push(n as usize),
                FramePayload::Tensor(_) => {
                    return Err(NetError::Protocol(format!(
                        "rank {peer} sent a tensor during a size gather"
                    )))
                }
            }
        }
        Ok(sizes)
    }

    /// Every rank's tensor, indexed by rank. Shapes may differ.
    fn all_gather(&mut self, tensor: &Tensor) -> Result<Vec<Tensor>> {
        let (me, world, epoch) = (self.rank(), self.world_size(), self.epoch());
        for peer in (0..world).filter(|&p| p != me) {
            let frame = CollectiveFrame::tensor(me, epoch, FrameKind::Gather, tensor.clone());
            self.send_frame(peer, frame)?;
        }

        let mut gathered = Vec::with_capacity(world);
        for peer in 0..world {
            if peer == me {
                gathered.push(tensor.clone());
            } else {
                let frame = self.recv_frame(peer)?;
                gathered.push(expect_tensor(frame, peer, FrameKind::Gather)?);
            }
        }
        Ok(gathered)
    }
}

/// Establishes a rank's membership in a process group.
pub trait Rendezvous: Send + Sync {
    fn join(&self, rank: usize, world_size: usize) -> Result<Box<dyn ProcessGroup>>;
}

fn expect_payload(frame: CollectiveFrame, src: usize, kind: FrameKind) -> Result<FramePayload> {
    if frame.from_rank as usize != src {
        return Err(NetError::Protocol(format!(
            "expected a frame from rank {src}, got one from rank {}",
            frame.from_rank
        )));
    }
    if frame.kind != kind {
        return Err(NetError::Protocol(format!(
            "rank {src} sent {:?} while {kind:?} was expected",
            frame.kind
        )));
    }
    Ok(frame.payload)
}

fn expect_tensor(frame: CollectiveFrame, src: usize, kind: FrameKind) -> Result<Tensor> {
    match expect_payload(frame, src, kind)? {
        FramePayload::Tensor(t) => Ok(t),
        FramePayload::Size(_) => Err(NetError::Protocol(format!(
            "rank {src} sent a size where a tensor was expected"
        ))),
    }
}

/// Validate a peer index for a rank-to-rank operation.
pub(crate) fn check_peer(rank: usize, world_size: usize, peer: usize) -> Result<()> {
    if peer >= world_size {
        return Err(NetError::PeerOutOfRange { peer, world_size });
    }
    if peer == rank {
        return Err(NetError::Protocol(format!("rank {rank} cannot exchange with itself")));
    }
    Ok(())
}

// ── Inbox ─────────────────────────────────────────────────────────────────────

/// One receiving channel per peer, with an optional stall guard and a
/// per-peer queue of frames that arrived ahead of the current epoch.
pub(crate) struct Inbox {
    rank: usize,
    epoch: u64,
    from_peer: Vec<Option<Receiver<CollectiveFrame>>>,
    ahead: Vec<VecDeque<CollectiveFrame>>,
    timeout: Option<Duration>,
}

impl Inbox {
    pub(crate) fn new(
        rank: usize,
        from_peer: Vec<Option<Receiver<CollectiveFrame>>>,
        timeout: Option<Duration>,
    ) -> Self {
        let ahead = from_peer.iter().map(|_| VecDeque::new()).collect();
        Self { rank, epoch: 0, from_peer, ahead, timeout }
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
        for queue in &mut self.ahead {
            queue.retain(|f| f.epoch >= epoch);
        }
    }

    /// Next frame from `src` for the current epoch. Frames from earlier
    /// epochs are discarded; a frame from a later one is kept for when this
    /// rank gets there, and the receive fails with `PeerAhead`.
    pub(crate) fn recv(&mut self, src: usize) -> Result<CollectiveFrame> {
        let deadline = self.timeout.map(|t| Instant::now() + t);
        loop {
            let held = self.ahead.get_mut(src).and_then(VecDeque::pop_front);
            let frame = match held {
                Some(frame) => frame,
                None => self.next_from(src, deadline)?,
            };
            match frame.epoch.cmp(&self.epoch) {
                Ordering::Equal => return Ok(frame),
                Ordering::Less => {
                    debug!(
                        rank = self.rank,
                        peer = src,
                        stale = frame.epoch,
                        epoch = self.epoch,
                        "dropping frame from an abandoned request"
                    );
                }
                Ordering::Greater => {
                    let peer_epoch = frame.epoch;
                    if let Some(queue) = self.ahead.get_mut(src) {
                        queue.push_front(frame);
                    }
                    return Err(NetError::PeerAhead { peer: src, epoch: self.epoch, peer_epoch });
                }
            }
        }
    }

    fn next_from(&self, src: usize, deadline: Option<Instant>) -> Result<CollectiveFrame> {
        let rx = self
            .from_peer
            .get(src)
            .and_then(Option::as_ref)
            .ok_or(NetError::Disconnected { peer: src })?;

        match (deadline, self.timeout) {
            (Some(deadline), Some(waited)) => rx.recv_deadline(deadline).map_err(|e| match e {
                RecvTimeoutError::Timeout => NetError::CollectiveStall {
                    rank: self.rank,
                    peer: src,
                    waited,
                },
                RecvTimeoutError::Disconnected => NetError::Disconnected { peer: src },
            }),
            _ => rx.recv().map_err(|_| NetError::Disconnected { peer: src }),
        }
    }

    pub(crate) fn close(&mut self) {
        self.from_peer.clear();
        self.ahead.clear();
    }
}
