//! `clipgen-net` — how ranks talk to each other.
//!
//! A [`ProcessGroup`] moves tensors between ranks with point-to-point
//! `send`/`recv` and the `all_gather` collectives. Two transports:
//!
//! - [`LocalMesh`]: ranks are threads of one process, frames move over
//!   crossbeam channels.
//! - [`TcpMesh`]: ranks are separate processes, frames are length-prefixed
//!   bincode over a full TCP mesh of tokio sockets.
//!
//! A [`Rendezvous`] is what a rank's context holds before it has joined;
//! `join` hands back its group.

pub mod codec;
pub mod error;
pub mod frame;
pub mod group;
pub mod local;
pub mod tcp;

pub use error::{NetError, Result};
pub use frame::{CollectiveFrame, FrameKind, FramePayload};
pub use group::{ProcessGroup, Rendezvous};
pub use local::{LocalGroup, LocalMesh};
pub use tcp::{TcpMesh, TcpRendezvous};
