//! Block requester
//!
//! Decides which blocks to request from which peer: rarest piece first
//! (lowest index on ties), blocks in ascending offset, a per-peer cap on
//! outstanding requests, reassignment of timed out requests, and endgame
//! duplication once few blocks remain.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::download::config::DownloadConfig;
use crate::protocol::Bitfield;
use crate::storage::{BlockInfo, BlockState, PieceStore};

/// Schedules block requests across peers
#[derive(Debug)]
pub struct BlockRequester {
    /// Number of connected peers that have each piece
    availability: Vec<u32>,
    /// Blocks each peer currently has in flight
    assigned: HashMap<SocketAddr, HashSet<BlockInfo>>,
    /// Requests dropped because they timed out, awaiting a cancel
    stale: Vec<(SocketAddr, BlockInfo)>,
    max_in_flight: usize,
    request_timeout: Duration,
    endgame_threshold: usize,
}

impl BlockRequester {
    pub fn new(piece_count: usize, config: &DownloadConfig) -> Self {
        Self {
            availability: vec![0; piece_count],
            assigned: HashMap::new(),
            stale: Vec::new(),
            max_in_flight: config.max_in_flight_per_peer,
            request_timeout: config.request_timeout,
            endgame_threshold: config.endgame_threshold,
        }
    }

    /// Peers holding a piece
    pub fn availability(&self, piece_index: usize) -> u32 {
        self.availability.get(piece_index).copied().unwrap_or(0)
    }

    /// Count every piece in a peer's bitfield
    pub fn add_availability(&mut self, bitfield: &Bitfield) {
        for index in bitfield.iter_set() {
            if let Some(count) = self.availability.get_mut(index) {
                *count = count.saturating_add(1);
            }
        }
    }

    /// Forget a departed peer's pieces
    pub fn remove_availability(&mut self, bitfield: &Bitfield) {
        for index in bitfield.iter_set() {
            if let Some(count) = self.availability.get_mut(index) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// A peer announced one more piece
    pub fn peer_have(&mut self, piece_index: u32) {
        if let Some(count) = self.availability.get_mut(piece_index as usize) {
            *count = count.saturating_add(1);
        }
    }

    /// Blocks `peer` has in flight
    pub fn in_flight(&self, peer: &SocketAddr) -> usize {
        self.assigned.get(peer).map_or(0, HashSet::len)
    }

    /// The set of blocks `peer` has in flight
    pub fn assigned_to(&self, peer: &SocketAddr) -> Vec<BlockInfo> {
        let mut blocks: Vec<BlockInfo> = self.assigned.get(peer).into_iter().flatten().copied().collect();
        blocks.sort();
        blocks
    }

    /// Whether a peer with `peer_has` holds any piece we still need
    pub fn is_interesting(&self, store: &PieceStore, peer_has: &Bitfield) -> bool {
        peer_has
            .iter_set()
            .any(|index| store.piece(index).is_some_and(|p| p.is_wanted()))
    }

    /// Whether the download is in endgame
    pub fn in_endgame(&self, store: &PieceStore) -> bool {
        store.unfinished_blocks() <= self.endgame_threshold
    }

    /// Pick up to `max_new` blocks to request from `peer` and record them as
    /// in flight. Returns fewer (possibly none) when the peer's cap is reached
    /// or it has nothing useful.
    pub fn next_requests(
        &mut self,
        store: &mut PieceStore,
        peer: SocketAddr,
        peer_has: &Bitfield,
        max_new: usize,
        now: Instant,
    ) -> Vec<BlockInfo> {
        let budget = max_new.min(self.max_in_flight.saturating_sub(self.in_flight(&peer)));
        if budget == 0 {
            return Vec::new();
        }

        let endgame = self.in_endgame(store);
        let mut candidates: Vec<usize> = peer_has
            .iter_set()
            .filter(|&index| store.piece(index).is_some_and(|p| p.is_wanted()))
            .collect();
        candidates.sort_by_key(|&index| (self.availability(index), index));

        let mut picked = Vec::with_capacity(budget);
        'pieces: for index in candidates {
            let Some(piece) = store.piece(index) else {
                continue;
            };
            let blocks: Vec<(BlockInfo, BlockState)> =
                piece.blocks().iter().map(|b| (b.info(), b.state().clone())).collect();

            for (block, state) in blocks {
                let wanted = match state {
                    BlockState::Received => false,
                    BlockState::Unrequested => true,
                    BlockState::InFlight(owners) => {
                        if owners.iter().any(|o| o.peer == peer) {
                            false
                        } else {
                            let mut live = owners.len();
                            for owner in owners {
                                if now.saturating_duration_since(owner.requested_at) >= self.request_timeout {
                                    debug!("Reassigning timed out block {:?} from {}", block, owner.peer);
                                    store.release(block, owner.peer);
                                    self.forget(owner.peer, block);
                                    self.stale.push((owner.peer, block));
                                    live -= 1;
                                }
                            }
                            live == 0 || endgame
                        }
                    }
                };

                if wanted && store.assign(block, peer, now) {
                    self.assigned.entry(peer).or_default().insert(block);
                    picked.push(block);
                    if picked.len() == budget {
                        break 'pieces;
                    }
                }
            }
        }

        if !picked.is_empty() {
            trace!("Scheduled {} blocks for {}{}", picked.len(), peer, if endgame { " (endgame)" } else { "" });
        }
        picked
    }

    /// Record that `peer` delivered `block`. Returns the other peers that
    /// still have it in flight and should be sent a cancel.
    pub fn complete_block(&mut self, peer: SocketAddr, block: BlockInfo) -> Vec<SocketAddr> {
        self.forget(peer, block);
        let mut others: Vec<SocketAddr> = self
            .assigned
            .iter()
            .filter(|(_, blocks)| blocks.contains(&block))
            .map(|(owner, _)| *owner)
            .collect();
        others.sort();
        for owner in &others {
            self.forget(*owner, block);
        }
        others
    }

    /// Drop one outstanding request, returning the block to the pool if no
    /// one else has it
    pub fn release_block(&mut self, store: &mut PieceStore, peer: SocketAddr, block: BlockInfo) -> bool {
        let known = self.forget(peer, block);
        store.release(block, peer);
        known
    }

    /// Release everything `peer` has in flight. Returns the released blocks.
    pub fn release_peer(&mut self, store: &mut PieceStore, peer: SocketAddr) -> Vec<BlockInfo> {
        let mut blocks: Vec<BlockInfo> = self.assigned.remove(&peer).into_iter().flatten().collect();
        blocks.sort();
        for block in &blocks {
            store.release(*block, peer);
        }
        if !blocks.is_empty() {
            debug!("Released {} blocks held by {}", blocks.len(), peer);
        }
        blocks
    }

    /// Drop every request older than the request timeout. Returns what was
    /// dropped so the owners can be sent a cancel.
    pub fn expire(&mut self, store: &mut PieceStore, now: Instant) -> Vec<(SocketAddr, BlockInfo)> {
        let mut expired = std::mem::take(&mut self.stale);
        for (peer, block) in store.expire_requests(now, self.request_timeout) {
            self.forget(peer, block);
            expired.push((peer, block));
        }
        expired
    }

    fn forget(&mut self, peer: SocketAddr, block: BlockInfo) -> bool {
        match self.assigned.get_mut(&peer) {
            Some(blocks) => {
                let removed = blocks.remove(&block);
                if blocks.is_empty() {
                    self.assigned.remove(&peer);
                }
                removed
            }
            None => false,
        }
    }
}
