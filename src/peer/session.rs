//! Peer session
//!
//! The protocol state machine for one peer connection. It performs no I/O:
//! the connection task feeds it the handshake and decoded messages, and the
//! coordinator asks it for the messages to send. Anything malformed is an
//! error, after which the session should be closed.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, trace, warn};

use crate::download::config::DownloadConfig;
use crate::error::TorrentError;
use crate::peer::state::PeerState;
use crate::protocol::{Bitfield, Handshake, Message, MAX_REQUEST_LEN};
use crate::storage::BlockInfo;
use crate::torrent::TorrentMeta;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Handshaking,
    Live,
    Closed,
}

/// Something the coordinator must act on after a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The peer's full piece set
    Bitfield(Bitfield),
    /// The peer gained a piece it did not have
    Have(u32),
    /// The peer choked us; these outstanding requests are void
    Choked { dropped: Vec<BlockInfo> },
    Unchoked,
    /// Block payload
    Block { piece_index: u32, offset: u32, data: Vec<u8> },
}

/// State of a single peer connection
#[derive(Debug)]
pub struct PeerSession {
    addr: SocketAddr,
    meta: Arc<TorrentMeta>,
    phase: Phase,
    peer_id: Option<[u8; 20]>,
    /// Pieces the remote has
    bitfield: Bitfield,
    /// A bitfield is only valid as the first message
    seen_message: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
    /// Requests sent and not yet answered
    outstanding: BTreeSet<BlockInfo>,
    max_outstanding: usize,
    phase_started: Instant,
    last_received: Instant,
    last_sent: Instant,
    handshake_timeout: Duration,
    keepalive_interval: Duration,
    keepalive_timeout: Duration,
    close_reason: Option<String>,
    blocks_received: u64,
}

impl PeerSession {
    /// Create a session for a connection attempt to `addr`
    pub fn new(addr: SocketAddr, meta: Arc<TorrentMeta>, config: &DownloadConfig, now: Instant) -> Self {
        let bitfield = Bitfield::new(meta.piece_count());
        Self {
            addr,
            meta,
            phase: Phase::Connecting,
            peer_id: None,
            bitfield,
            seen_message: false,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            outstanding: BTreeSet::new(),
            max_outstanding: config.max_in_flight_per_peer,
            phase_started: now,
            last_received: now,
            last_sent: now,
            handshake_timeout: config.handshake_timeout,
            keepalive_interval: config.keepalive_interval,
            keepalive_timeout: config.keepalive_timeout,
            close_reason: None,
            blocks_received: 0,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn peer_id(&self) -> Option<[u8; 20]> {
        self.peer_id
    }

    /// Pieces the remote has announced
    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    /// Current state
    pub fn state(&self) -> PeerState {
        match self.phase {
            Phase::Connecting => PeerState::Connecting,
            Phase::Handshaking => PeerState::Handshaking,
            Phase::Live => PeerState::live(self.peer_choking, self.am_interested),
            Phase::Closed => PeerState::Closed,
        }
    }

    pub fn is_live(&self) -> bool {
        self.phase == Phase::Live
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    pub fn is_interested(&self) -> bool {
        self.am_interested
    }

    pub fn peer_interested(&self) -> bool {
        self.peer_interested
    }

    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }

    pub fn blocks_received(&self) -> u64 {
        self.blocks_received
    }

    /// Requests sent and not yet answered, in order
    pub fn outstanding(&self) -> impl Iterator<Item = &BlockInfo> {
        self.outstanding.iter()
    }

    /// How many more requests may be sent right now
    pub fn request_slots(&self) -> usize {
        if self.state().can_request() {
            self.max_outstanding.saturating_sub(self.outstanding.len())
        } else {
            0
        }
    }

    /// TCP connect finished
    pub fn on_connected(&mut self, now: Instant) {
        if self.phase == Phase::Connecting {
            trace!("Session {} connected", self.addr);
            self.phase = Phase::Handshaking;
            self.phase_started = now;
            self.last_received = now;
        }
    }

    /// Remote handshake received
    pub fn on_handshake(&mut self, handshake: &Handshake, now: Instant) -> Result<()> {
        if self.phase != Phase::Handshaking {
            return Err(TorrentError::protocol_error_with_source(
                "Unexpected handshake",
                format!("peer {} in state {}", self.addr, self.state()),
            ).into());
        }
        if !handshake.validate(&self.meta.info_hash) {
            return Err(TorrentError::peer_error_full(
                "Handshake validation failed: info hash mismatch",
                self.addr.to_string(),
                hex::encode(handshake.info_hash),
            ).into());
        }

        debug!("Handshake completed with {} ({})", self.addr, hex::encode(handshake.peer_id));
        self.peer_id = Some(handshake.peer_id);
        self.phase = Phase::Live;
        self.phase_started = now;
        self.last_received = now;
        Ok(())
    }

    /// Apply one message from the remote
    pub fn handle_message(&mut self, message: Message, now: Instant) -> Result<Vec<SessionEvent>> {
        if self.phase != Phase::Live {
            return Err(TorrentError::protocol_error_with_source(
                "Message before handshake",
                format!("peer {} in state {}", self.addr, self.state()),
            ).into());
        }

        self.last_received = now;
        let first = !self.seen_message;
        self.seen_message = true;

        let events = match message {
            Message::KeepAlive => {
                trace!("Keep-alive from {}", self.addr);
                Vec::new()
            }
            Message::Choke => {
                self.peer_choking = true;
                let dropped: Vec<BlockInfo> = std::mem::take(&mut self.outstanding).into_iter().collect();
                debug!("Choked by {}, dropping {} requests", self.addr, dropped.len());
                vec![SessionEvent::Choked { dropped }]
            }
            Message::Unchoke => {
                self.peer_choking = false;
                debug!("Unchoked by {}", self.addr);
                vec![SessionEvent::Unchoked]
            }
            Message::Interested => {
                self.peer_interested = true;
                Vec::new()
            }
            Message::NotInterested => {
                self.peer_interested = false;
                Vec::new()
            }
            Message::Have { piece_index } => {
                self.check_piece_index(piece_index)?;
                if self.bitfield.has(piece_index as usize) {
                    Vec::new()
                } else {
                    self.bitfield.set(piece_index as usize);
                    vec![SessionEvent::Have(piece_index)]
                }
            }
            Message::Bitfield { bitfield } => {
                if !first {
                    return Err(TorrentError::protocol_error_with_source(
                        "Bitfield must be the first message",
                        format!("peer {}", self.addr),
                    ).into());
                }
                self.bitfield = Bitfield::from_bytes(&bitfield, self.meta.piece_count())?;
                debug!("Peer {} has {}/{} pieces", self.addr, self.bitfield.count(), self.bitfield.len());
                vec![SessionEvent::Bitfield(self.bitfield.clone())]
            }
            Message::Request { index, begin, length } => {
                self.check_range(index, begin, length)?;
                if length > MAX_REQUEST_LEN {
                    return Err(TorrentError::protocol_error_with_source(
                        "Request too large",
                        format!("{} > {}", length, MAX_REQUEST_LEN),
                    ).into());
                }
                // we never unchoke, so requests are dropped
                trace!("Ignoring request from {} for piece {}", self.addr, index);
                Vec::new()
            }
            Message::Cancel { index, begin, length } => {
                self.check_range(index, begin, length)?;
                Vec::new()
            }
            Message::Piece { index, begin, block } => {
                self.check_range(index, begin, block.len() as u32)?;
                let info = BlockInfo::new(index, begin, block.len() as u32);
                if !self.outstanding.remove(&info) {
                    debug!("Unrequested block from {}: {:?}", self.addr, info);
                }
                self.blocks_received += 1;
                vec![SessionEvent::Block {
                    piece_index: index,
                    offset: begin,
                    data: block,
                }]
            }
            Message::Port { listen_port } => {
                trace!("Ignoring port {} from {}", listen_port, self.addr);
                Vec::new()
            }
        };

        Ok(events)
    }

    /// Build a request for `block`. Fails unless the session is unchoked and
    /// interested with room under the cap.
    pub fn request(&mut self, block: BlockInfo, now: Instant) -> Result<Message> {
        if !self.state().can_request() {
            return Err(TorrentError::peer_error_with_peer(
                format!("Cannot request in state {}", self.state()),
                self.addr.to_string(),
            ).into());
        }
        if self.outstanding.len() >= self.max_outstanding {
            return Err(TorrentError::peer_error_with_peer("Request cap reached", self.addr.to_string()).into());
        }
        if !self.outstanding.insert(block) {
            return Err(TorrentError::peer_error_with_peer(
                format!("Block {:?} already requested", block),
                self.addr.to_string(),
            ).into());
        }

        self.last_sent = now;
        Ok(Message::Request {
            index: block.piece_index,
            begin: block.offset,
            length: block.length,
        })
    }

    /// Withdraw an outstanding request. Returns the cancel to send, if it was outstanding.
    pub fn cancel(&mut self, block: BlockInfo, now: Instant) -> Option<Message> {
        if !self.outstanding.remove(&block) || !self.is_live() {
            return None;
        }
        self.last_sent = now;
        Some(Message::Cancel {
            index: block.piece_index,
            begin: block.offset,
            length: block.length,
        })
    }

    /// Change our interest. Returns the message to send when it changed.
    pub fn set_interested(&mut self, interested: bool, now: Instant) -> Option<Message> {
        if !self.is_live() || self.am_interested == interested {
            return None;
        }
        self.am_interested = interested;
        self.last_sent = now;
        debug!("{} in {}", if interested { "Interested" } else { "Not interested" }, self.addr);
        Some(if interested { Message::Interested } else { Message::NotInterested })
    }

    /// Record an outgoing message (for keep-alive pacing)
    pub fn record_sent(&mut self, now: Instant) {
        self.last_sent = now;
    }

    /// A keep-alive if nothing was sent for the keep-alive interval
    pub fn keepalive(&mut self, now: Instant) -> Option<Message> {
        if self.is_live() && now.saturating_duration_since(self.last_sent) >= self.keepalive_interval {
            self.last_sent = now;
            Some(Message::KeepAlive)
        } else {
            None
        }
    }

    /// Handshake or keep-alive timeout, if one has elapsed
    pub fn check_timeouts(&self, now: Instant) -> Option<TorrentError> {
        match self.phase {
            Phase::Handshaking if now.saturating_duration_since(self.phase_started) >= self.handshake_timeout => {
                Some(TorrentError::timeout_with_peer("Handshake timed out", self.addr.to_string()))
            }
            Phase::Live if now.saturating_duration_since(self.last_received) >= self.keepalive_timeout => {
                Some(TorrentError::timeout_with_peer("Peer went silent", self.addr.to_string()))
            }
            _ => None,
        }
    }

    /// Close the session. Returns the requests that were outstanding.
    pub fn close(&mut self, reason: impl Into<String>) -> Vec<BlockInfo> {
        if self.phase == Phase::Closed {
            return Vec::new();
        }
        let reason = reason.into();
        warn!("Closing session with {}: {}", self.addr, reason);
        self.phase = Phase::Closed;
        self.close_reason = Some(reason);
        std::mem::take(&mut self.outstanding).into_iter().collect()
    }

    fn check_piece_index(&self, index: u32) -> Result<()> {
        if (index as usize) < self.meta.piece_count() {
            Ok(())
        } else {
            Err(TorrentError::protocol_error_with_source(
                "Piece index out of range",
                format!("peer {} sent index {} of {}", self.addr, index, self.meta.piece_count()),
            ).into())
        }
    }

    fn check_range(&self, index: u32, begin: u32, length: u32) -> Result<()> {
        self.check_piece_index(index)?;
        let piece_size = self.meta.piece_size(index as usize).unwrap_or(0);
        if begin as u64 + length as u64 > piece_size {
            return Err(TorrentError::protocol_error_with_source(
                "Block range out of bounds",
                format!("peer {} sent piece {} begin {} length {} (piece is {})", self.addr, index, begin, length, piece_size),
            ).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::piece::tests::test_meta;

    fn live_session(now: Instant) -> PeerSession {
        let meta = test_meta(64, 256);
        let config = DownloadConfig { max_in_flight_per_peer: 2, ..Default::default() };
        let mut session = PeerSession::new(SocketAddr::from(([127, 0, 0, 1], 7000)), meta.clone(), &config, now);
        session.on_connected(now);
        session.on_handshake(&Handshake::new(meta.info_hash, [3u8; 20]), now).unwrap();
        session
    }

    #[test]
    fn test_lifecycle_states() {
        let now = Instant::now();
        let meta = test_meta(64, 256);
        let mut session = PeerSession::new(SocketAddr::from(([127, 0, 0, 1], 1)), meta.clone(), &DownloadConfig::default(), now);
        assert_eq!(session.state(), PeerState::Connecting);
        session.on_connected(now);
        assert_eq!(session.state(), PeerState::Handshaking);
        session.on_handshake(&Handshake::new(meta.info_hash, [3u8; 20]), now).unwrap();
        assert_eq!(session.state(), PeerState::ChokedNotInterested);
        assert_eq!(session.peer_id(), Some([3u8; 20]));

        assert_eq!(session.set_interested(true, now), Some(Message::Interested));
        assert_eq!(session.set_interested(true, now), None);
        session.handle_message(Message::Unchoke, now).unwrap();
        assert_eq!(session.state(), PeerState::UnchokedInterested);

        session.close("done");
        assert_eq!(session.state(), PeerState::Closed);
        assert_eq!(session.close_reason(), Some("done"));
    }

    #[test]
    fn test_wrong_info_hash_rejected() {
        let now = Instant::now();
        let mut session = PeerSession::new(SocketAddr::from(([127, 0, 0, 1], 1)), test_meta(64, 256), &DownloadConfig::default(), now);
        session.on_connected(now);
        assert!(session.on_handshake(&Handshake::new([0xee; 20], [3u8; 20]), now).is_err());
    }

    #[test]
    fn test_message_before_handshake_rejected() {
        let now = Instant::now();
        let mut session = PeerSession::new(SocketAddr::from(([127, 0, 0, 1], 1)), test_meta(64, 256), &DownloadConfig::default(), now);
        assert!(session.handle_message(Message::Unchoke, now).is_err());
    }

    #[test]
    fn test_bitfield_only_first() {
        let now = Instant::now();
        let mut session = live_session(now);
        let events = session.handle_message(Message::Bitfield { bitfield: vec![0b1010_0000] }, now).unwrap();
        match &events[..] {
            [SessionEvent::Bitfield(bitfield)] => {
                assert!(bitfield.has(0));
                assert!(!bitfield.has(1));
                assert!(bitfield.has(2));
            }
            other => panic!("unexpected events: {:?}", other),
        }
        assert!(session.handle_message(Message::Bitfield { bitfield: vec![0xf0] }, now).is_err());
    }

    #[test]
    fn test_bad_bitfield_rejected() {
        let now = Instant::now();
        // spare bits set
        assert!(live_session(now).handle_message(Message::Bitfield { bitfield: vec![0xff] }, now).is_err());
        // wrong length
        assert!(live_session(now).handle_message(Message::Bitfield { bitfield: vec![0xf0, 0] }, now).is_err());
    }

    #[test]
    fn test_have_updates_bitfield() {
        let now = Instant::now();
        let mut session = live_session(now);
        assert_eq!(session.handle_message(Message::Have { piece_index: 3 }, now).unwrap(), vec![SessionEvent::Have(3)]);
        assert!(session.handle_message(Message::Have { piece_index: 3 }, now).unwrap().is_empty());
        assert!(session.bitfield().has(3));
        assert!(session.handle_message(Message::Have { piece_index: 4 }, now).is_err());
    }

    #[test]
    fn test_request_rules() {
        let now = Instant::now();
        let mut session = live_session(now);
        let block = BlockInfo::new(0, 0, 16);

        // choked and not interested
        assert!(session.request(block, now).is_err());
        session.set_interested(true, now);
        assert!(session.request(block, now).is_err());
        session.handle_message(Message::Unchoke, now).unwrap();
        assert_eq!(session.request_slots(), 2);

        assert_eq!(session.request(block, now).unwrap(), Message::Request { index: 0, begin: 0, length: 16 });
        assert!(session.request(block, now).is_err());
        session.request(BlockInfo::new(0, 16, 16), now).unwrap();
        assert!(session.request(BlockInfo::new(0, 32, 16), now).is_err());
        assert_eq!(session.request_slots(), 0);
    }

    #[test]
    fn test_choke_drops_outstanding() {
        let now = Instant::now();
        let mut session = live_session(now);
        session.set_interested(true, now);
        session.handle_message(Message::Unchoke, now).unwrap();
        session.request(BlockInfo::new(1, 0, 16), now).unwrap();

        let events = session.handle_message(Message::Choke, now).unwrap();
        assert_eq!(events, vec![SessionEvent::Choked { dropped: vec![BlockInfo::new(1, 0, 16)] }]);
        assert_eq!(session.outstanding().count(), 0);
        assert_eq!(session.state(), PeerState::ChokedInterested);
    }

    #[test]
    fn test_piece_and_request_bounds() {
        let now = Instant::now();
        let mut session = live_session(now);

        let events = session
            .handle_message(Message::Piece { index: 1, begin: 48, block: vec![0u8; 16] }, now)
            .unwrap();
        assert!(matches!(&events[..], [SessionEvent::Block { piece_index: 1, offset: 48, .. }]));

        assert!(live_session(now).handle_message(Message::Piece { index: 1, begin: 56, block: vec![0u8; 16] }, now).is_err());
        assert!(live_session(now).handle_message(Message::Piece { index: 9, begin: 0, block: vec![0u8; 16] }, now).is_err());
        assert!(live_session(now).handle_message(Message::Request { index: 0, begin: 0, length: 65 }, now).is_err());
        assert!(live_session(now).handle_message(Message::Cancel { index: 4, begin: 0, length: 1 }, now).is_err());
        assert!(live_session(now).handle_message(Message::Request { index: 0, begin: 0, length: 16 }, now).unwrap().is_empty());
    }

    #[test]
    fn test_oversized_request_rejected() {
        let now = Instant::now();
        let meta = Arc::new(
            TorrentMeta::new(
                "big",
                [1u8; 20],
                1 << 20,
                vec![[0u8; 20]],
                vec![crate::torrent::TorrentFile::new(vec!["big".into()], 1 << 20)],
            )
            .unwrap(),
        );
        let mut session = PeerSession::new(SocketAddr::from(([127, 0, 0, 1], 1)), meta.clone(), &DownloadConfig::default(), now);
        session.on_connected(now);
        session.on_handshake(&Handshake::new(meta.info_hash, [0u8; 20]), now).unwrap();
        assert!(session.handle_message(Message::Request { index: 0, begin: 0, length: MAX_REQUEST_LEN + 1 }, now).is_err());
    }

    #[test]
    fn test_timeouts_and_keepalive() {
        let start = Instant::now();
        let meta = test_meta(64, 256);
        let config = DownloadConfig::default();
        let mut session = PeerSession::new(SocketAddr::from(([127, 0, 0, 1], 1)), meta.clone(), &config, start);
        session.on_connected(start);
        assert!(session.check_timeouts(start + Duration::from_secs(9)).is_none());
        assert!(matches!(
            session.check_timeouts(start + Duration::from_secs(10)),
            Some(TorrentError::Timeout { .. })
        ));

        session.on_handshake(&Handshake::new(meta.info_hash, [0u8; 20]), start).unwrap();
        assert!(session.keepalive(start + Duration::from_secs(59)).is_none());
        assert_eq!(session.keepalive(start + Duration::from_secs(60)), Some(Message::KeepAlive));
        assert!(session.keepalive(start + Duration::from_secs(61)).is_none());

        assert!(session.check_timeouts(start + Duration::from_secs(119)).is_none());
        session.handle_message(Message::KeepAlive, start + Duration::from_secs(100)).unwrap();
        assert!(session.check_timeouts(start + Duration::from_secs(200)).is_none());
        assert!(session.check_timeouts(start + Duration::from_secs(220)).is_some());
    }

    #[test]
    fn test_cancel_and_close_return_outstanding() {
        let now = Instant::now();
        let mut session = live_session(now);
        session.set_interested(true, now);
        session.handle_message(Message::Unchoke, now).unwrap();
        session.request(BlockInfo::new(2, 0, 16), now).unwrap();
        session.request(BlockInfo::new(2, 16, 16), now).unwrap();

        assert_eq!(
            session.cancel(BlockInfo::new(2, 0, 16), now),
            Some(Message::Cancel { index: 2, begin: 0, length: 16 })
        );
        assert_eq!(session.cancel(BlockInfo::new(2, 0, 16), now), None);
        assert_eq!(session.close("bye"), vec![BlockInfo::new(2, 16, 16)]);
        assert!(session.close("again").is_empty());
    }
}
