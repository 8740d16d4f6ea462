//! Download events
//!
//! `PeerEvent` flows from connection tasks into the coordinator loop;
//! `DownloadEvent` is broadcast from the coordinator to subscribers.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::TorrentError;
use crate::protocol::{Handshake, Message};

/// Reported by a peer connection task
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// TCP connection established
    Connected { addr: SocketAddr },
    /// Remote handshake read
    Handshake { addr: SocketAddr, handshake: Handshake },
    /// Decoded message from the remote
    Message { addr: SocketAddr, message: Message },
    /// The task ended; `error` is `None` on a requested shutdown
    Disconnected { addr: SocketAddr, error: Option<TorrentError> },
}

impl PeerEvent {
    pub fn addr(&self) -> SocketAddr {
        match self {
            PeerEvent::Connected { addr }
            | PeerEvent::Handshake { addr, .. }
            | PeerEvent::Message { addr, .. }
            | PeerEvent::Disconnected { addr, .. } => *addr,
        }
    }
}

/// Reported to callers of the download
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    /// A piece passed its hash check and is on disk
    PieceVerified { index: u32 },
    /// A piece failed its hash check and will be downloaded again
    PieceCorrupt { index: u32 },
    /// Writing a piece failed; it will be downloaded again
    DiskError { index: u32, error: String },
    /// A peer session ended
    PeerClosed { addr: SocketAddr, reason: String },
    /// No live peers and no progress for this long
    Stalled { idle: Duration },
    /// Every piece is verified. Sent once.
    Completed,
}
