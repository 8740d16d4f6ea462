//! Peer module
//!
//! Per-peer protocol state machine and the connection task that drives it.

pub mod connection;
pub mod session;
pub mod state;

pub use connection::PeerConnection;
pub use session::{PeerSession, SessionEvent};
pub use state::PeerState;
