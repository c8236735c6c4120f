//! Full TCP mesh between OS processes, on tokio sockets.
//!
//! ```text
//!   rank 0  listens :P        rank 1  listens :P+1       rank 2  listens :P+2
//!      ▲  ◄──── connect + hello(1) ───┘                      │
//!      └────────────── connect + hello(2) ──────────────────┤
//!                               ▲ ◄──── connect + hello(2) ──┘
//! ```
//!
//! Every rank connects to each lower rank and accepts from each higher one.
//! The mesh owns a small tokio runtime: a reader task per peer drains
//! incoming frames into a channel, so a send never waits on the peer
//! reaching its matching receive. The [`ProcessGroup`] calls come from a
//! rank's own worker thread and block on that runtime, which is why a mesh
//! must not be joined or used from inside another tokio runtime.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use crossbeam::channel::{unbounded, Sender};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use clipgen_types::config::NetConfig;

use crate::codec::{read_frame, write_frame};
use crate::error::{NetError, Result};
use crate::frame::CollectiveFrame;
use crate::group::{check_peer, Inbox, ProcessGroup, Rendezvous};

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Joins ranks on `master_addr:master_port + rank`.
#[derive(Debug, Clone)]
pub struct TcpRendezvous {
    config: NetConfig,
}

impl TcpRendezvous {
    pub fn new(config: NetConfig) -> Self {
        Self { config }
    }
}

impl Rendezvous for TcpRendezvous {
    fn join(&self, rank: usize, world_size: usize) -> Result<Box<dyn ProcessGroup>> {
        Ok(Box::new(TcpMesh::join(rank, world_size, &self.config)?))
    }
}

pub struct TcpMesh {
    rank: usize,
    world_size: usize,
    max_frame_bytes: usize,
    runtime: Option<Runtime>,
    to_peer: Vec<Option<OwnedWriteHalf>>,
    inbox: Inbox,
    readers: Vec<JoinHandle<()>>,
    destroyed: bool,
}

impl TcpMesh {
    /// Bind this rank's port and connect to every peer.
    pub fn join(rank: usize, world_size: usize, config: &NetConfig) -> Result<Self> {
        let peers = (0..world_size)
            .map(|r| peer_addr(config, r))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| join_failed(rank, e))?;
        let me = *peers
            .get(rank)
            .ok_or_else(|| join_failed(rank, NetError::PeerOutOfRange { peer: rank, world_size }))?;

        let runtime = mesh_runtime(rank).map_err(|e| join_failed(rank, e))?;
        let listener = runtime
            .block_on(TcpListener::bind(me))
            .map_err(|e| join_failed(rank, e.into()))?;
        Self::start(rank, runtime, listener, &peers, config)
    }

    /// Join using an already-bound listener; `peers[r]` is rank `r`'s address.
    pub fn with_listener(
        rank: usize,
        listener: std::net::TcpListener,
        peers: &[SocketAddr],
        config: &NetConfig,
    ) -> Result<Self> {
        let runtime = mesh_runtime(rank).map_err(|e| join_failed(rank, e))?;
        let listener = {
            let _guard = runtime.enter();
            listener
                .set_nonblocking(true)
                .and_then(|()| TcpListener::from_std(listener))
                .map_err(|e| join_failed(rank, e.into()))?
        };
        Self::start(rank, runtime, listener, peers, config)
    }

    fn start(
        rank: usize,
        runtime: Runtime,
        listener: TcpListener,
        peers: &[SocketAddr],
        config: &NetConfig,
    ) -> Result<Self> {
        let world_size = peers.len();
        if rank >= world_size {
            return Err(join_failed(rank, NetError::PeerOutOfRange { peer: rank, world_size }));
        }
        let limit = config.connect_timeout;
        let streams = runtime
            .block_on(async {
                tokio::time::timeout(limit, connect_all(rank, listener, peers))
                    .await
                    .map_err(|_| {
                        NetError::Protocol(format!("peers did not all connect within {limit:?}"))
                    })?
            })
            .map_err(|e| join_failed(rank, e))?;

        let mut to_peer = Vec::with_capacity(world_size);
        let mut from_peer = Vec::with_capacity(world_size);
        let mut readers = Vec::new();
        for (peer, stream) in streams.into_iter().enumerate() {
            let Some(stream) = stream else {
                to_peer.push(None);
                from_peer.push(None);
                continue;
            };
            let (read_half, write_half) = stream.into_split();
            let (tx, rx) = unbounded();
            readers.push(runtime.spawn(read_frames(rank, peer, read_half, tx, config.max_frame_bytes)));
            to_peer.push(Some(write_half));
            from_peer.push(Some(rx));
        }

        info!(rank, world_size, "joined tcp mesh");
        Ok(Self {
            rank,
            world_size,
            max_frame_bytes: config.max_frame_bytes,
            runtime: Some(runtime),
            to_peer,
            inbox: Inbox::new(rank, from_peer, config.collective_timeout),
            readers,
            destroyed: false,
        })
    }
}

impl ProcessGroup for TcpMesh {
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
        let runtime = self.runtime.as_ref().ok_or(NetError::GroupDestroyed)?;
        let writer = self.to_peer[dst].as_mut().ok_or(NetError::Disconnected { peer: dst })?;
        runtime.block_on(write_frame(writer, &frame, self.max_frame_bytes))
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
        if let Some(runtime) = self.runtime.take() {
            let writers: Vec<_> = self.to_peer.drain(..).flatten().collect();
            runtime.block_on(async {
                for mut writer in writers {
                    let _ = writer.shutdown().await;
                }
            });
            for reader in self.readers.drain(..) {
                reader.abort();
            }
            runtime.shutdown_background();
        }
        self.inbox.close();
        self.destroyed = true;
        info!(rank = self.rank, "tcp mesh destroyed");
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

impl Drop for TcpMesh {
    fn drop(&mut self) {
        self.destroy();
    }
}

// ── Connection setup ──────────────────────────────────────────────────────────

fn mesh_runtime(rank: usize) -> Result<Runtime> {
    let runtime = Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name(format!("clipgen-net-{rank}"))
        .enable_all()
        .build()?;
    Ok(runtime)
}

fn peer_addr(config: &NetConfig, rank: usize) -> Result<SocketAddr> {
    let port = u16::try_from(usize::from(config.master_port) + rank).map_err(|_| {
        NetError::Protocol(format!("port {} + rank {rank} overflows", config.master_port))
    })?;
    (config.master_addr.as_str(), port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| NetError::Protocol(format!("{}:{port} did not resolve", config.master_addr)))
}

async fn connect_all(
    rank: usize,
    listener: TcpListener,
    peers: &[SocketAddr],
) -> Result<Vec<Option<TcpStream>>> {
    let mut streams: Vec<Option<TcpStream>> = peers.iter().map(|_| None).collect();

    for (peer, addr) in peers.iter().enumerate().take(rank) {
        let mut stream = connect_with_retry(*addr).await?;
        stream.set_nodelay(true)?;
        stream.write_u32(rank as u32).await?;
        debug!(rank, peer, %addr, "connected to lower rank");
        streams[peer] = Some(stream);
    }

    for _ in rank + 1..peers.len() {
        let (mut stream, addr) = listener.accept().await?;
        stream.set_nodelay(true)?;
        let peer = stream.read_u32().await? as usize;
        if peer <= rank || peer >= peers.len() || streams[peer].is_some() {
            return Err(NetError::Protocol(format!(
                "unexpected hello from rank {peer} at {addr}"
            )));
        }
        debug!(rank, peer, %addr, "accepted higher rank");
        streams[peer] = Some(stream);
    }
    Ok(streams)
}

/// Keep dialling until the peer is listening; the caller bounds the wait.
async fn connect_with_retry(addr: SocketAddr) -> Result<TcpStream> {
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(%addr, error = %e, "peer not listening yet");
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    }
}

async fn read_frames(
    rank: usize,
    peer: usize,
    stream: OwnedReadHalf,
    tx: Sender<CollectiveFrame>,
    max_frame_bytes: usize,
) {
    let mut reader = BufReader::new(stream);
    loop {
        match read_frame(&mut reader, max_frame_bytes).await {
            Ok(frame) => {
                if tx.send(frame).is_err() {
                    break;
                }
            }
            Err(NetError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!(rank, peer, "peer closed connection");
                break;
            }
            Err(e) => {
                warn!(rank, peer, error = %e, "dropping connection");
                break;
            }
        }
    }
}

fn join_failed(rank: usize, e: NetError) -> NetError {
    match e {
        NetError::GroupJoinFailed { .. } => e,
        other => NetError::GroupJoinFailed { rank, reason: other.to_string() },
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
