//! In-process mesh for ranks that are threads of one process.

use std::sync::Mutex;
use std::time::Duration;

use crossbeam::channel::{unbounded, Sender};
use tracing::debug;

use crate::error::{NetError, Result};
use crate::frame::CollectiveFrame;
use crate::group::{check_peer, Inbox, ProcessGroup, Rendezvous};

/// Hands out one pre-wired [`LocalGroup`] per rank.
pub struct LocalMesh {
    world_size: usize,
    slots: Mutex<Vec<Option<LocalGroup>>>,
}

impl LocalMesh {
    /// Wire a full mesh: one unbounded channel per ordered pair of ranks.
    pub fn new(world_size: usize, collective_timeout: Option<Duration>) -> Self {
        let mut outboxes: Vec<Vec<Option<Sender<CollectiveFrame>>>> =
            (0..world_size).map(|_| (0..world_size).map(|_| None).collect()).collect();
        let mut inboxes: Vec<Vec<Option<_>>> =
            (0..world_size).map(|_| (0..world_size).map(|_| None).collect()).collect();

        for src in 0..world_size {
            for dst in (0..world_size).filter(|&d| d != src) {
                let (tx, rx) = unbounded();
                outboxes[src][dst] = Some(tx);
                inboxes[dst][src] = Some(rx);
            }
        }

        let slots = outboxes
            .into_iter()
            .zip(inboxes)
            .enumerate()
            .map(|(rank, (to_peer, from_peer))| {
                Some(LocalGroup {
                    rank,
                    world_size,
                    to_peer,
                    inbox: Inbox::new(rank, from_peer, collective_timeout),
                    destroyed: false,
                })
            })
            .collect();

        Self { world_size, slots: Mutex::new(slots) }
    }

    /// Take every group at once, indexed by rank.
    pub fn into_groups(self) -> Vec<LocalGroup> {
        self.slots
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .into_iter()
            .flatten()
            .collect()
    }
}

impl Rendezvous for LocalMesh {
    fn join(&self, rank: usize, world_size: usize) -> Result<Box<dyn ProcessGroup>> {
        let fail = |reason: String| NetError::GroupJoinFailed { rank, reason };
        if world_size != self.world_size {
            return Err(fail(format!(
                "mesh was built for {} ranks, asked for {world_size}",
                self.world_size
            )));
        }
        let mut slots = self.slots.lock().map_err(|_| fail("mesh lock poisoned".into()))?;
        let group = slots
            .get_mut(rank)
            .ok_or_else(|| fail(format!("rank out of range for world size {world_size}")))?
            .take()
            .ok_or_else(|| fail("rank already joined".into()))?;
        debug!(rank, world_size, "joined local mesh");
        Ok(Box::new(group))
    }
}

pub struct LocalGroup {
    rank: usize,
    world_size: usize,
    to_peer: Vec<Option<Sender<CollectiveFrame>>>,
    inbox: Inbox,
    destroyed: bool,
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn send_frame(&mut self, dst: usize, frame: CollectiveFrame) -> Result<()> {
        if self.destroyed {
            return Err(NetError::GroupDestroyed);
        }
        check_peer(self.rank, self.world_size, dst)?;
        let tx = self.to_peer[dst].as_ref().ok_or(NetError::Disconnected { peer: dst })?;
        tx.send(frame).map_err(|_| NetError::Disconnected { peer: dst })
    }

    fn recv_frame(&mut self, src: usize) -> Result<CollectiveFrame> {
        if self.destroyed {
            return Err(NetError::GroupDestroyed);
        }
        check_peer(self.rank, self.world_size, src)?;
        self.inbox.recv(src)
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.to_peer.clear();
        self.inbox.close();
        self.destroyed = true;
        debug!(rank = self.rank, "local group destroyed");
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    fn epoch(&self) -> u64 {
        self.inbox.epoch()
    }

    fn set_epoch(&mut self, epoch: u64) {
        self.inbox.set_epoch(epoch);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
