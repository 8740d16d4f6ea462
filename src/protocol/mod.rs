//! BitTorrent peer-wire protocol
//!
//! Handshake, message codec, bitfield and stream framing.

pub mod bitfield;
pub mod handshake;
pub mod message;
pub mod wire;

pub use bitfield::Bitfield;
pub use handshake::Handshake;
pub use message::{Message, MessageId, MAX_REQUEST_LEN};
pub use wire::BitTorrentWire;
