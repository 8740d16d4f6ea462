//! Torrent metadata module
//!
//! Provides the immutable torrent descriptor and the `.torrent` file parser.

pub mod info;
pub mod parser;

pub use info::{TorrentFile, TorrentMeta};
pub use parser::TorrentParser;
