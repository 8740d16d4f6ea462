//! rust-torrent-engine
//!
//! BitTorrent piece-exchange engine: downloads a single torrent from a known
//! set of peers, verifying every piece before it reaches disk.

pub mod torrent;
pub mod protocol;
pub mod peer;
pub mod storage;
pub mod download;
pub mod cli;
pub mod error;

pub use error::TorrentError;

pub use torrent::{TorrentFile, TorrentMeta, TorrentParser};
pub use protocol::{BitTorrentWire, Bitfield, Handshake, Message, MessageId};
pub use peer::{PeerConnection, PeerSession, PeerState, SessionEvent};
pub use storage::{
    BlockInfo, BlockState, CommitResult, DiskWriter, FileLayout, FileStorage, MemoryStorage, PieceState,
    PieceStatus, PieceStore, ResumeData, ResumeManager, StorageBackend,
};
pub use download::{
    BlockRequester, DownloadConfig, DownloadCoordinator, DownloadEvent, DownloadStats, PeerEvent, ProgressHandle,
};
pub use cli::{CliArgs, Config, ProgressDisplay, ProgressStats};
