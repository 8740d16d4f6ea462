//! Piece store
//!
//! Tracks per-piece and per-block state, buffers received blocks until a
//! piece is complete, and verifies each piece against its expected SHA1
//! digest. Only verified pieces count toward completed bytes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use sha1::{Digest, Sha1};
use tracing::{debug, trace, warn};

use crate::error::TorrentError;
use crate::protocol::Bitfield;
use crate::torrent::TorrentMeta;

/// Default block size requested over the wire
pub const DEFAULT_BLOCK_SIZE: u32 = 16 * 1024;

/// A sub-range of a piece, the unit requested over the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockInfo {
    /// Piece index this block belongs to
    pub piece_index: u32,
    /// Offset within the piece
    pub offset: u32,
    /// Length of the block
    pub length: u32,
}

impl BlockInfo {
    /// Create a new block descriptor
    pub fn new(piece_index: u32, offset: u32, length: u32) -> Self {
        Self {
            piece_index,
            offset,
            length,
        }
    }
}

/// Status of a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    /// No block received or in flight
    Missing,
    /// At least one block in flight or received
    Requested,
    /// All blocks received and hash matched; commit to disk pending
    Complete,
    /// Hash matched and the piece is on disk
    Verified,
}

impl Default for PieceState {
    fn default() -> Self {
        PieceState::Missing
    }
}

/// An outstanding request for a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlight {
    pub peer: SocketAddr,
    pub requested_at: Instant,
}

/// State of a single block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockState {
    Unrequested,
    /// Requested from one peer, or several during endgame. At most one entry per peer.
    InFlight(Vec<InFlight>),
    Received,
}

/// Outcome of delivering a block to the store
#[derive(Debug)]
pub enum PieceStatus {
    /// Block stored; the piece still needs more blocks
    Pending { received: usize, total: usize },
    /// Block was already received, or its piece is already finished. Nothing changed.
    Duplicate,
    /// Last block arrived and the piece hashed correctly. The buffer is handed
    /// over for writing to disk.
    Verified { index: u32, data: Vec<u8> },
    /// Last block arrived but the piece failed its hash check. All of its
    /// blocks are back to Unrequested.
    Corrupt { index: u32, error: TorrentError },
}

/// A block slot within a piece
#[derive(Debug, Clone)]
pub struct BlockSlot {
    info: BlockInfo,
    state: BlockState,
}

impl BlockSlot {
    pub fn info(&self) -> BlockInfo {
        self.info
    }

    pub fn state(&self) -> &BlockState {
        &self.state
    }

    /// Whether `peer` currently has this block in flight
    pub fn is_in_flight_to(&self, peer: &SocketAddr) -> bool {
        matches!(&self.state, BlockState::InFlight(owners) if owners.iter().any(|o| o.peer == *peer))
    }
}

/// Represents a piece of the torrent
#[derive(Debug)]
pub struct Piece {
    index: u32,
    hash: [u8; 20],
    length: u32,
    state: PieceState,
    blocks: Vec<BlockSlot>,
    received: usize,
    /// Assembly buffer, allocated on the first received block
    buffer: Option<Vec<u8>>,
}

impl Piece {
    /// Create a new piece split into blocks of `block_size`
    pub fn new(index: u32, length: u32, hash: [u8; 20], block_size: u32) -> Self {
        let blocks = (0..length.div_ceil(block_size))
            .map(|i| {
                let offset = i * block_size;
                BlockSlot {
                    info: BlockInfo::new(index, offset, block_size.min(length - offset)),
                    state: BlockState::Unrequested,
                }
            })
            .collect();

        Self {
            index,
            hash,
            length,
            state: PieceState::Missing,
            blocks,
            received: 0,
            buffer: None,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn state(&self) -> PieceState {
        self.state
    }

    pub fn blocks(&self) -> &[BlockSlot] {
        &self.blocks
    }

    /// Number of blocks received so far
    pub fn received_blocks(&self) -> usize {
        self.received
    }

    /// Whether the piece still needs data from peers
    pub fn is_wanted(&self) -> bool {
        matches!(self.state, PieceState::Missing | PieceState::Requested)
    }

    fn refresh_state(&mut self) {
        if !self.is_wanted() {
            return;
        }
        let active = self.received > 0
            || self.blocks.iter().any(|b| matches!(b.state, BlockState::InFlight(_)));
        self.state = if active { PieceState::Requested } else { PieceState::Missing };
    }

    /// Drop all received data and return every block to Unrequested
    fn reset(&mut self) {
        self.buffer = None;
        self.received = 0;
        for block in &mut self.blocks {
            block.state = BlockState::Unrequested;
        }
        self.state = PieceState::Missing;
    }

    fn block_index(&self, offset: u32, len: usize) -> Result<usize> {
        let block_size = self.blocks.first().map(|b| b.info.length).unwrap_or(0);
        if block_size == 0 || offset % block_size != 0 {
            return Err(TorrentError::protocol_error_with_source(
                "Unaligned block offset",
                format!("piece {} offset {}", self.index, offset),
            ).into());
        }
        let block_index = (offset / block_size) as usize;
        let slot = self.blocks.get(block_index).ok_or_else(|| {
            TorrentError::protocol_error_with_source(
                "Block offset out of bounds",
                format!("piece {} offset {} (length {})", self.index, offset, self.length),
            )
        })?;
        if slot.info.length as usize != len {
            return Err(TorrentError::protocol_error_with_source(
                "Block has wrong length",
                format!("piece {} offset {}: expected {} bytes, got {}", self.index, offset, slot.info.length, len),
            ).into());
        }
        Ok(block_index)
    }
}

/// Owns all piece state for a torrent
#[derive(Debug)]
pub struct PieceStore {
    meta: Arc<TorrentMeta>,
    block_size: u32,
    pieces: Vec<Piece>,
    bytes_verified: u64,
    verified_count: usize,
    corrupt_count: u64,
}

impl PieceStore {
    /// Create a new piece store with every piece Missing
    pub fn new(meta: Arc<TorrentMeta>, block_size: u32) -> Self {
        let pieces = (0..meta.piece_count())
            .map(|index| {
                let length = meta.piece_size(index).unwrap_or(0) as u32;
                Piece::new(index as u32, length, meta.pieces[index], block_size)
            })
            .collect();

        debug!("Initialized piece store: {} pieces, block size {}", meta.piece_count(), block_size);
        Self {
            meta,
            block_size,
            pieces,
            bytes_verified: 0,
            verified_count: 0,
            corrupt_count: 0,
        }
    }

    pub fn meta(&self) -> &Arc<TorrentMeta> {
        &self.meta
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn piece(&self, index: usize) -> Option<&Piece> {
        self.pieces.get(index)
    }

    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    pub fn piece_state(&self, index: usize) -> Option<PieceState> {
        self.pieces.get(index).map(|p| p.state)
    }

    /// State of the block starting at `offset` in piece `index`
    pub fn block_state(&self, index: usize, offset: u32) -> Option<&BlockState> {
        self.pieces
            .get(index)?
            .blocks
            .iter()
            .find(|b| b.info.offset == offset)
            .map(|b| &b.state)
    }

    /// Bytes belonging to verified pieces. The only byte count reported as completed.
    pub fn bytes_verified(&self) -> u64 {
        self.bytes_verified
    }

    pub fn total_bytes(&self) -> u64 {
        self.meta.total_size()
    }

    pub fn verified_count(&self) -> usize {
        self.verified_count
    }

    /// Number of pieces that failed their hash check so far
    pub fn corrupt_count(&self) -> u64 {
        self.corrupt_count
    }

    pub fn is_complete(&self) -> bool {
        self.verified_count == self.pieces.len()
    }

    /// Download progress (0.0 to 1.0) by verified bytes
    pub fn progress(&self) -> f64 {
        let total = self.total_bytes();
        if total == 0 {
            1.0
        } else {
            self.bytes_verified as f64 / total as f64
        }
    }

    /// Set of verified pieces
    pub fn piece_bitfield(&self) -> Bitfield {
        let mut bitfield = Bitfield::new(self.pieces.len());
        for piece in self.pieces.iter().filter(|p| p.state == PieceState::Verified) {
            bitfield.set(piece.index as usize);
        }
        bitfield
    }

    /// Blocks not yet received across all pieces that are still wanted
    pub fn unfinished_blocks(&self) -> usize {
        self.pieces
            .iter()
            .filter(|p| p.is_wanted())
            .map(|p| p.blocks.len() - p.received)
            .sum()
    }

    /// Record that `block` has been requested from `peer`.
    ///
    /// Returns false if the block is already received, its piece is finished,
    /// or `peer` already has it in flight.
    pub fn assign(&mut self, block: BlockInfo, peer: SocketAddr, now: Instant) -> bool {
        let Some(slot) = self.slot_mut(block) else {
            return false;
        };
        let assigned = match &mut slot.state {
            BlockState::Received => false,
            BlockState::Unrequested => {
                slot.state = BlockState::InFlight(vec![InFlight { peer, requested_at: now }]);
                true
            }
            BlockState::InFlight(owners) => {
                if owners.iter().any(|o| o.peer == peer) {
                    false
                } else {
                    owners.push(InFlight { peer, requested_at: now });
                    true
                }
            }
        };
        if assigned {
            trace!("Block {:?} assigned to {}", block, peer);
            self.pieces[block.piece_index as usize].refresh_state();
        }
        assigned
    }

    /// Drop `peer`'s request for `block`. The block returns to Unrequested
    /// when no other peer has it in flight.
    pub fn release(&mut self, block: BlockInfo, peer: SocketAddr) -> bool {
        let Some(slot) = self.slot_mut(block) else {
            return false;
        };
        let released = if let BlockState::InFlight(owners) = &mut slot.state {
            let before = owners.len();
            owners.retain(|o| o.peer != peer);
            let removed = owners.len() != before;
            if owners.is_empty() {
                slot.state = BlockState::Unrequested;
            }
            removed
        } else {
            false
        };
        if released {
            self.pieces[block.piece_index as usize].refresh_state();
        }
        released
    }

    /// Peers that currently have `block` in flight
    pub fn owners(&self, block: BlockInfo) -> Vec<SocketAddr> {
        match self.slot(block).map(|s| &s.state) {
            Some(BlockState::InFlight(owners)) => owners.iter().map(|o| o.peer).collect(),
            _ => Vec::new(),
        }
    }

    /// Release every request older than `timeout`, returning what was dropped
    pub fn expire_requests(&mut self, now: Instant, timeout: Duration) -> Vec<(SocketAddr, BlockInfo)> {
        let mut expired = Vec::new();
        for piece in self.pieces.iter_mut().filter(|p| p.is_wanted()) {
            let mut touched = false;
            for slot in &mut piece.blocks {
                if let BlockState::InFlight(owners) = &mut slot.state {
                    owners.retain(|o| {
                        let stale = now.saturating_duration_since(o.requested_at) >= timeout;
                        if stale {
                            expired.push((o.peer, slot.info));
                        }
                        !stale
                    });
                    if owners.is_empty() {
                        slot.state = BlockState::Unrequested;
                        touched = true;
                    }
                }
            }
            if touched {
                piece.refresh_state();
            }
        }
        if !expired.is_empty() {
            debug!("Expired {} timed out requests", expired.len());
        }
        expired
    }

    /// Store a received block.
    ///
    /// `offset` must be block aligned and `data` must be exactly the block's
    /// length. When the last block of a piece arrives the piece is hashed:
    /// a match moves it to Complete and hands its buffer back, a mismatch
    /// discards the buffer and resets all of its blocks.
    pub fn mark_block_received(&mut self, piece_index: u32, offset: u32, data: &[u8]) -> Result<PieceStatus> {
        let piece = self.pieces.get_mut(piece_index as usize).ok_or_else(|| {
            TorrentError::protocol_error_with_source("Block for unknown piece", format!("piece {}", piece_index))
        })?;

        if !piece.is_wanted() {
            trace!("Ignoring block for finished piece {}", piece_index);
            return Ok(PieceStatus::Duplicate);
        }

        let block_index = piece.block_index(offset, data.len())?;
        if piece.blocks[block_index].state == BlockState::Received {
            trace!("Duplicate block: piece {} offset {}", piece_index, offset);
            return Ok(PieceStatus::Duplicate);
        }

        let length = piece.length as usize;
        let buffer = piece.buffer.get_or_insert_with(|| vec![0u8; length]);
        let start = offset as usize;
        buffer[start..start + data.len()].copy_from_slice(data);
        piece.blocks[block_index].state = BlockState::Received;
        piece.received += 1;

        if piece.received < piece.blocks.len() {
            piece.refresh_state();
            return Ok(PieceStatus::Pending {
                received: piece.received,
                total: piece.blocks.len(),
            });
        }

        let data = piece.buffer.take().unwrap_or_default();
        let actual: [u8; 20] = Sha1::digest(&data).into();
        if actual == piece.hash {
            debug!("Piece {} passed hash check", piece_index);
            piece.state = PieceState::Complete;
            Ok(PieceStatus::Verified { index: piece_index, data })
        } else {
            let error = TorrentError::hash_mismatch(piece_index, &piece.hash, &actual);
            warn!("{}", error);
            piece.reset();
            self.corrupt_count += 1;
            Ok(PieceStatus::Corrupt { index: piece_index, error })
        }
    }

    /// Mark a Complete piece as written to disk. Credits its bytes.
    pub fn commit_succeeded(&mut self, index: u32) -> bool {
        match self.pieces.get_mut(index as usize) {
            Some(piece) if piece.state == PieceState::Complete => {
                piece.state = PieceState::Verified;
                self.bytes_verified += piece.length as u64;
                self.verified_count += 1;
                true
            }
            _ => {
                warn!("Commit result for piece {} which is not awaiting commit", index);
                false
            }
        }
    }

    /// Return a Complete piece to Missing after its write failed
    pub fn commit_failed(&mut self, index: u32) -> bool {
        match self.pieces.get_mut(index as usize) {
            Some(piece) if piece.state == PieceState::Complete => {
                piece.reset();
                true
            }
            _ => false,
        }
    }

    /// Credit a piece whose on-disk data was already checked against its digest
    pub fn mark_verified(&mut self, index: u32) -> bool {
        let Some(piece) = self.pieces.get_mut(index as usize) else {
            return false;
        };
        if piece.state == PieceState::Verified {
            return false;
        }
        piece.buffer = None;
        piece.received = piece.blocks.len();
        for block in &mut piece.blocks {
            block.state = BlockState::Received;
        }
        piece.state = PieceState::Verified;
        self.bytes_verified += piece.length as u64;
        self.verified_count += 1;
        true
    }

    fn slot(&self, block: BlockInfo) -> Option<&BlockSlot> {
        let piece = self.pieces.get(block.piece_index as usize)?;
        piece.blocks.get((block.offset / self.block_size) as usize).filter(|s| s.info == block)
    }

    fn slot_mut(&mut self, block: BlockInfo) -> Option<&mut BlockSlot> {
        let block_size = self.block_size;
        let piece = self.pieces.get_mut(block.piece_index as usize)?;
        if !piece.is_wanted() {
            return None;
        }
        piece.blocks.get_mut((block.offset / block_size) as usize).filter(|s| s.info == block)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::torrent::TorrentFile;

    /// Deterministic content for a torrent: byte `i` is `i % 251`
    pub(crate) fn content(total: usize) -> Vec<u8> {
        (0..total).map(|i| (i % 251) as u8).collect()
    }

    /// Build a single-file torrent whose piece hashes match `content(total)`
    pub(crate) fn test_meta(piece_length: u64, total: u64) -> Arc<TorrentMeta> {
        let data = content(total as usize);
        let pieces = data
            .chunks(piece_length as usize)
            .map(|chunk| Sha1::digest(chunk).into())
            .collect();
        Arc::new(
            TorrentMeta::new("test.bin", [9u8; 20], piece_length, pieces, vec![TorrentFile::new(vec!["test.bin".into()], total)])
                .unwrap(),
        )
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn deliver_piece(store: &mut PieceStore, data: &[u8], index: u32) -> PieceStatus {
        let piece_length = store.meta().piece_length as usize;
        let start = index as usize * piece_length;
        let piece_data = &data[start..(start + piece_length).min(data.len())];
        let mut last = PieceStatus::Duplicate;
        for (i, chunk) in piece_data.chunks(store.block_size() as usize).enumerate() {
            last = store.mark_block_received(index, (i * store.block_size() as usize) as u32, chunk).unwrap();
        }
        last
    }

    #[test]
    fn test_piece_block_layout() {
        let piece = Piece::new(3, 40000, [0u8; 20], DEFAULT_BLOCK_SIZE);
        let lengths: Vec<u32> = piece.blocks().iter().map(|b| b.info().length).collect();
        assert_eq!(lengths, vec![16384, 16384, 7232]);
        assert_eq!(piece.blocks()[2].info().offset, 32768);
        assert_eq!(piece.state(), PieceState::Missing);
    }

    #[test]
    fn test_piece_state_default() {
        assert_eq!(PieceState::default(), PieceState::Missing);
    }

    #[test]
    fn test_full_piece_verifies() {
        let meta = test_meta(64, 200);
        let data = content(200);
        let mut store = PieceStore::new(meta, 16);

        match store.mark_block_received(0, 0, &data[0..16]).unwrap() {
            PieceStatus::Pending { received, total } => {
                assert_eq!(received, 1);
                assert_eq!(total, 4);
            }
            other => panic!("unexpected status: {:?}", other),
        }
        assert_eq!(store.piece_state(0), Some(PieceState::Requested));

        // Remaining blocks out of order still assemble by offset
        store.mark_block_received(0, 48, &data[48..64]).unwrap();
        store.mark_block_received(0, 16, &data[16..32]).unwrap();
        match store.mark_block_received(0, 32, &data[32..48]).unwrap() {
            PieceStatus::Verified { index, data: piece } => {
                assert_eq!(index, 0);
                assert_eq!(piece, &data[0..64]);
            }
            other => panic!("unexpected status: {:?}", other),
        }

        // Not yet credited: the piece is awaiting its disk commit
        assert_eq!(store.piece_state(0), Some(PieceState::Complete));
        assert_eq!(store.bytes_verified(), 0);
        assert!(store.commit_succeeded(0));
        assert_eq!(store.piece_state(0), Some(PieceState::Verified));
        assert_eq!(store.bytes_verified(), 64);
        assert!(store.piece_bitfield().has(0));
    }

    #[test]
    fn test_duplicate_block_is_noop() {
        let meta = test_meta(64, 128);
        let data = content(128);
        let mut store = PieceStore::new(meta, 16);

        store.mark_block_received(1, 0, &data[64..80]).unwrap();
        let before = store.piece(1).unwrap().received_blocks();
        assert!(matches!(store.mark_block_received(1, 0, &data[64..80]).unwrap(), PieceStatus::Duplicate));
        assert_eq!(store.piece(1).unwrap().received_blocks(), before);

        // Re-delivering blocks of a finished piece never fires a second verification
        assert!(matches!(deliver_piece(&mut store, &data, 1), PieceStatus::Verified { .. }));
        assert!(matches!(deliver_piece(&mut store, &data, 1), PieceStatus::Duplicate));
        assert!(store.commit_succeeded(1));
        assert!(matches!(deliver_piece(&mut store, &data, 1), PieceStatus::Duplicate));
        assert!(!store.commit_succeeded(1));
        assert_eq!(store.bytes_verified(), 64);
    }

    #[test]
    fn test_corrupt_piece_resets_all_blocks() {
        let meta = test_meta(64, 128);
        let mut data = content(128);
        data[5] ^= 0xff;
        let mut store = PieceStore::new(meta, 16);
        store.assign(BlockInfo::new(0, 16, 16), addr(1), Instant::now());

        match deliver_piece(&mut store, &data, 0) {
            PieceStatus::Corrupt { index, error } => {
                assert_eq!(index, 0);
                assert!(matches!(error, TorrentError::HashMismatch { piece_index: 0, .. }));
            }
            other => panic!("unexpected status: {:?}", other),
        }

        assert_eq!(store.piece_state(0), Some(PieceState::Missing));
        for block in store.piece(0).unwrap().blocks() {
            assert_eq!(block.state(), &BlockState::Unrequested);
        }
        assert_eq!(store.piece(0).unwrap().received_blocks(), 0);
        assert_eq!(store.corrupt_count(), 1);
        assert_eq!(store.bytes_verified(), 0);
        assert!(!store.piece_bitfield().has(0));
    }

    #[test]
    fn test_bounds_checked() {
        let meta = test_meta(64, 100);
        let mut store = PieceStore::new(meta, 16);

        // unaligned offset
        assert!(store.mark_block_received(0, 8, &[0u8; 16]).is_err());
        // beyond the piece
        assert!(store.mark_block_received(0, 64, &[0u8; 16]).is_err());
        // wrong length
        assert!(store.mark_block_received(0, 0, &[0u8; 17]).is_err());
        // last piece is 36 bytes: blocks 16, 16, 4
        assert!(store.mark_block_received(1, 32, &[0u8; 16]).is_err());
        assert!(store.mark_block_received(1, 32, &[0u8; 4]).is_ok());
        // unknown piece
        assert!(store.mark_block_received(2, 0, &[0u8; 16]).is_err());
    }

    #[test]
    fn test_last_piece_shorter_verifies() {
        let meta = test_meta(64, 100);
        let data = content(100);
        let mut store = PieceStore::new(meta, 16);

        assert!(matches!(deliver_piece(&mut store, &data, 1), PieceStatus::Verified { .. }));
        store.commit_succeeded(1);
        assert_eq!(store.bytes_verified(), 36);
    }

    #[test]
    fn test_assign_release_and_owners() {
        let meta = test_meta(64, 64);
        let mut store = PieceStore::new(meta, 16);
        let block = BlockInfo::new(0, 0, 16);
        let now = Instant::now();

        assert!(store.assign(block, addr(1), now));
        assert!(!store.assign(block, addr(1), now));
        assert!(store.assign(block, addr(2), now));
        assert_eq!(store.owners(block), vec![addr(1), addr(2)]);
        assert_eq!(store.piece_state(0), Some(PieceState::Requested));

        assert!(store.release(block, addr(1)));
        assert!(store.release(block, addr(2)));
        assert_eq!(store.block_state(0, 0), Some(&BlockState::Unrequested));
        assert_eq!(store.piece_state(0), Some(PieceState::Missing));
    }

    #[test]
    fn test_expire_requests() {
        let meta = test_meta(64, 64);
        let mut store = PieceStore::new(meta, 16);
        let start = Instant::now();

        store.assign(BlockInfo::new(0, 0, 16), addr(1), start);
        store.assign(BlockInfo::new(0, 16, 16), addr(1), start + Duration::from_secs(20));

        let expired = store.expire_requests(start + Duration::from_secs(30), Duration::from_secs(30));
        assert_eq!(expired, vec![(addr(1), BlockInfo::new(0, 0, 16))]);
        assert_eq!(store.block_state(0, 0), Some(&BlockState::Unrequested));
        assert!(matches!(store.block_state(0, 16), Some(BlockState::InFlight(_))));
    }

    #[test]
    fn test_commit_failed_requeues_piece() {
        let meta = test_meta(64, 128);
        let data = content(128);
        let mut store = PieceStore::new(meta, 16);

        deliver_piece(&mut store, &data, 0);
        assert!(store.commit_failed(0));
        assert_eq!(store.piece_state(0), Some(PieceState::Missing));
        assert_eq!(store.unfinished_blocks(), 8);
        assert_eq!(store.bytes_verified(), 0);
    }

    #[test]
    fn test_mark_verified_and_completion() {
        let meta = test_meta(64, 128);
        let mut store = PieceStore::new(meta, 16);

        assert!(store.mark_verified(0));
        assert!(!store.mark_verified(0));
        assert!(!store.is_complete());
        assert!(store.mark_verified(1));
        assert!(store.is_complete());
        assert_eq!(store.bytes_verified(), store.total_bytes());
        assert_eq!(store.unfinished_blocks(), 0);
        assert!((store.progress() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_bytes_verified_monotonic() {
        let meta = test_meta(64, 256);
        let mut data = content(256);
        let mut store = PieceStore::new(meta, 16);
        let mut last = 0;

        for index in 0..4u32 {
            if index == 2 {
                data[130] ^= 1;
                deliver_piece(&mut store, &data, index);
                data[130] ^= 1;
                assert!(store.bytes_verified() >= last);
            }
            if let PieceStatus::Verified { index, .. } = deliver_piece(&mut store, &data, index) {
                store.commit_succeeded(index);
            }
            assert!(store.bytes_verified() >= last);
            assert!(store.bytes_verified() <= store.total_bytes());
            last = store.bytes_verified();
        }
        assert!(store.is_complete());
    }
}
