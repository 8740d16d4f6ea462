//! Peer state module
//!
//! Defines the observable state of a peer session.

use std::fmt;

/// Represents the state of a peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// TCP connect in progress
    Connecting,
    /// Connected, waiting for the remote handshake
    Handshaking,
    /// Remote chokes us and we are not interested
    ChokedNotInterested,
    /// Remote chokes us and we are interested
    ChokedInterested,
    /// Remote unchoked us but we are not interested
    UnchokedNotInterested,
    /// Remote unchoked us and we are interested; requests may be sent
    UnchokedInterested,
    /// Terminal
    Closed,
}

impl PeerState {
    /// Build the live state from the choke and interest flags
    pub fn live(peer_choking: bool, am_interested: bool) -> Self {
        match (peer_choking, am_interested) {
            (true, false) => PeerState::ChokedNotInterested,
            (true, true) => PeerState::ChokedInterested,
            (false, false) => PeerState::UnchokedNotInterested,
            (false, true) => PeerState::UnchokedInterested,
        }
    }

    /// Whether the handshake is done and the session not closed
    pub fn is_live(&self) -> bool {
        !matches!(self, PeerState::Connecting | PeerState::Handshaking | PeerState::Closed)
    }

    /// Check if the session can carry block requests
    pub fn can_request(&self) -> bool {
        matches!(self, PeerState::UnchokedInterested)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, PeerState::Closed)
    }
}

impl Default for PeerState {
    fn default() -> Self {
        PeerState::Connecting
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerState::Connecting => "connecting",
            PeerState::Handshaking => "handshaking",
            PeerState::ChokedNotInterested => "choked/not-interested",
            PeerState::ChokedInterested => "choked/interested",
            PeerState::UnchokedNotInterested => "unchoked/not-interested",
            PeerState::UnchokedInterested => "unchoked/interested",
            PeerState::Closed => "closed",
        };
        f.write_str(name)
    }
}
