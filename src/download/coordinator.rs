//! Download coordinator
//!
//! Owns the piece store, the block requester, the disk writer and every peer
//! session. All state changes happen on one loop that multiplexes peer
//! events, commit results, a periodic tick and shutdown, so none of that
//! state needs a lock. Progress is published through atomics and a watch
//! channel for readers on other tasks.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::download::config::DownloadConfig;
use crate::download::event::{DownloadEvent, PeerEvent};
use crate::download::requester::BlockRequester;
use crate::error::TorrentError;
use crate::peer::{PeerConnection, PeerSession, SessionEvent};
use crate::protocol::{Handshake, Message};
use crate::storage::{
    BlockInfo, CommitResult, DiskWriter, PieceStatus, PieceStore, ResumeData, ResumeManager, StorageBackend,
};
use crate::torrent::TorrentMeta;

const PEER_EVENT_CAPACITY: usize = 1024;
const DOWNLOAD_EVENT_CAPACITY: usize = 256;

/// Download statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadStats {
    /// Pieces verified and written
    pub pieces_verified: usize,
    /// Pieces that failed their hash check
    pub pieces_corrupt: usize,
    /// Piece writes that failed
    pub disk_errors: usize,
    /// Blocks received from peers
    pub blocks_received: u64,
    /// Blocks received that were already stored
    pub duplicate_blocks: u64,
    /// Peer sessions that completed the handshake
    pub peers_connected: usize,
}

/// Read-only view of download progress, safe to use from any task
#[derive(Debug, Clone)]
pub struct ProgressHandle {
    verified: Arc<AtomicU64>,
    peers: Arc<AtomicUsize>,
    total: u64,
    complete: watch::Receiver<bool>,
}

impl ProgressHandle {
    /// `(bytes_verified, total_bytes)`
    pub fn progress(&self) -> (u64, u64) {
        (self.verified.load(Ordering::SeqCst), self.total)
    }

    /// Peers with a completed handshake
    pub fn peers(&self) -> usize {
        self.peers.load(Ordering::SeqCst)
    }

    pub fn is_complete(&self) -> bool {
        *self.complete.borrow()
    }

    /// Resolve once the download completes. Returns false if the download
    /// was dropped first.
    pub async fn wait_complete(&self) -> bool {
        let mut complete = self.complete.clone();
        let done = complete.wait_for(|done| *done).await.is_ok();
        done
    }
}

/// Errors that are not ours to classify end the session
fn ends_session(error: &anyhow::Error) -> bool {
    error.downcast_ref::<TorrentError>().map_or(true, TorrentError::closes_session)
}

struct PeerHandle {
    session: PeerSession,
    outbound: mpsc::UnboundedSender<Message>,
}

impl PeerHandle {
    fn send(&self, message: Message) {
        // a closed queue means the task is ending; its Disconnected event follows
        if self.outbound.send(message).is_err() {
            trace!("Outbound queue closed for {}", self.session.addr());
        }
    }
}

/// Drives one torrent download
pub struct DownloadCoordinator {
    meta: Arc<TorrentMeta>,
    config: DownloadConfig,
    our_peer_id: [u8; 20],
    store: PieceStore,
    requester: BlockRequester,
    writer: DiskWriter,
    commits: mpsc::UnboundedReceiver<CommitResult>,
    peers: HashMap<SocketAddr, PeerHandle>,
    tasks: Vec<JoinHandle<()>>,
    /// Spawned connection tasks that have not reported Disconnected yet
    live_tasks: usize,
    events_tx: mpsc::Sender<PeerEvent>,
    events_rx: mpsc::Receiver<PeerEvent>,
    shutdown_tx: watch::Sender<bool>,
    notify: broadcast::Sender<DownloadEvent>,
    verified_bytes: Arc<AtomicU64>,
    live_peer_count: Arc<AtomicUsize>,
    complete_tx: watch::Sender<bool>,
    completed: bool,
    closing: bool,
    /// Start of the current period without live peers or progress
    stall_clock: Instant,
    stats: DownloadStats,
}

impl DownloadCoordinator {
    /// Create a coordinator writing through `backend`
    pub fn new(meta: Arc<TorrentMeta>, backend: Arc<dyn StorageBackend>, config: DownloadConfig) -> Result<Self> {
        config.validate()?;

        let store = PieceStore::new(Arc::clone(&meta), config.block_size);
        let requester = BlockRequester::new(meta.piece_count(), &config);
        let (writer, commits) = DiskWriter::new(backend, meta.piece_count(), config.disk_workers);
        let (events_tx, events_rx) = mpsc::channel(PEER_EVENT_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);
        let (notify, _) = broadcast::channel(DOWNLOAD_EVENT_CAPACITY);
        let (complete_tx, _) = watch::channel(false);

        info!(
            "Download of '{}' ({} bytes, {} pieces of {})",
            meta.name,
            meta.total_size(),
            meta.piece_count(),
            meta.piece_length
        );

        Ok(Self {
            meta,
            config,
            our_peer_id: Handshake::generate_peer_id(),
            store,
            requester,
            writer,
            commits,
            peers: HashMap::new(),
            tasks: Vec::new(),
            live_tasks: 0,
            events_tx,
            events_rx,
            shutdown_tx,
            notify,
            verified_bytes: Arc::new(AtomicU64::new(0)),
            live_peer_count: Arc::new(AtomicUsize::new(0)),
            complete_tx,
            completed: false,
            closing: false,
            stall_clock: Instant::now(),
            stats: DownloadStats::default(),
        })
    }

    /// Subscribe to download events
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.notify.subscribe()
    }

    /// Handle for reading progress from other tasks
    pub fn progress_handle(&self) -> ProgressHandle {
        ProgressHandle {
            verified: Arc::clone(&self.verified_bytes),
            peers: Arc::clone(&self.live_peer_count),
            total: self.store.total_bytes(),
            complete: self.complete_tx.subscribe(),
        }
    }

    /// `(bytes_verified, total_bytes)`
    pub fn progress(&self) -> (u64, u64) {
        (self.store.bytes_verified(), self.store.total_bytes())
    }

    pub fn is_complete(&self) -> bool {
        self.completed
    }

    pub fn meta(&self) -> &Arc<TorrentMeta> {
        &self.meta
    }

    pub fn store(&self) -> &PieceStore {
        &self.store
    }

    pub fn requester(&self) -> &BlockRequester {
        &self.requester
    }

    pub fn stats(&self) -> &DownloadStats {
        &self.stats
    }

    pub fn session(&self, addr: &SocketAddr) -> Option<&PeerSession> {
        self.peers.get(addr).map(|p| &p.session)
    }

    /// Peers with a completed handshake
    pub fn live_peers(&self) -> usize {
        self.peers.values().filter(|p| p.session.is_live()).count()
    }

    /// Prepare storage and credit any pieces recorded in resume data
    pub async fn start(&mut self) -> Result<()> {
        let backend = Arc::clone(self.writer.backend());
        backend.initialize().await?;

        if self.config.resume {
            let manager = ResumeManager::new(self.config.resume_dir.clone());
            let restored = manager.restore(&mut self.store, backend.as_ref()).await?;
            if restored > 0 {
                self.stats.pieces_verified += restored;
                self.publish_progress();
            }
        }

        self.stall_clock = Instant::now();
        self.check_completion();
        Ok(())
    }

    /// Register a session for `addr` without starting a connection task.
    /// Messages for the peer are delivered on the returned receiver and its
    /// events must be fed to [`handle_event`](Self::handle_event).
    pub fn attach_peer(&mut self, addr: SocketAddr, now: Instant) -> mpsc::UnboundedReceiver<Message> {
        let (outbound, rx) = mpsc::unbounded_channel();
        let session = PeerSession::new(addr, Arc::clone(&self.meta), &self.config, now);
        if self.peers.insert(addr, PeerHandle { session, outbound }).is_some() {
            warn!("Replaced existing session for {}", addr);
        }
        rx
    }

    /// Start a connection task for `addr`
    pub fn connect(&mut self, addr: SocketAddr) {
        if self.peers.contains_key(&addr) {
            debug!("Already connected to {}", addr);
            return;
        }
        let outbound = self.attach_peer(addr, Instant::now());
        let connection = PeerConnection::new(
            addr,
            self.meta.info_hash,
            self.our_peer_id,
            self.config.connect_timeout,
            self.config.handshake_timeout,
        );
        self.tasks
            .push(connection.spawn(self.events_tx.clone(), outbound, self.shutdown_tx.subscribe()));
        self.live_tasks += 1;
    }

    /// Run the download until it completes or `shutdown` resolves, then close.
    pub async fn run<F>(&mut self, peers: &[SocketAddr], shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        if !self.completed {
            for addr in peers {
                self.connect(*addr);
            }
        }

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        while !self.completed {
            tokio::select! {
                Some(event) = self.events_rx.recv() => self.handle_event(event, Instant::now()),
                Some(result) = self.commits.recv() => self.handle_commit(result, Instant::now()),
                _ = ticker.tick() => self.tick(Instant::now()),
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        self.close().await
    }

    /// Apply one event from a peer connection
    pub fn handle_event(&mut self, event: PeerEvent, now: Instant) {
        match event {
            PeerEvent::Connected { addr } => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.session.on_connected(now);
                }
            }
            PeerEvent::Handshake { addr, handshake } => {
                let Some(peer) = self.peers.get_mut(&addr) else {
                    return;
                };
                if let Err(e) = peer.session.on_handshake(&handshake, now) {
                    self.peer_failed(addr, e);
                    return;
                }
                self.stats.peers_connected += 1;
                info!("Peer {} ready", addr);
                self.live_peer_count.fetch_add(1, Ordering::SeqCst);
                if self.store.verified_count() > 0 {
                    let bitfield = self.store.piece_bitfield();
                    peer.send(Message::Bitfield { bitfield: bitfield.as_bytes().to_vec() });
                    peer.session.record_sent(now);
                }
            }
            PeerEvent::Message { addr, message } => self.handle_message(addr, message, now),
            PeerEvent::Disconnected { addr, error } => {
                self.live_tasks = self.live_tasks.saturating_sub(1);
                if self.peers.contains_key(&addr) {
                    let reason = error.map_or_else(|| "connection closed".to_string(), |e| e.to_string());
                    self.close_peer(addr, reason);
                }
            }
        }
    }

    fn handle_message(&mut self, addr: SocketAddr, message: Message, now: Instant) {
        let Some(peer) = self.peers.get_mut(&addr) else {
            trace!("Message from unknown peer {}", addr);
            return;
        };

        let events = match peer.session.handle_message(message, now) {
            Ok(events) => events,
            Err(e) => {
                self.peer_failed(addr, e);
                return;
            }
        };

        for event in events {
            match event {
                SessionEvent::Bitfield(bitfield) => {
                    self.requester.add_availability(&bitfield);
                    self.update_interest(addr, now);
                }
                SessionEvent::Have(piece_index) => {
                    self.requester.peer_have(piece_index);
                    self.update_interest(addr, now);
                }
                SessionEvent::Choked { dropped } => {
                    for block in dropped {
                        self.requester.release_block(&mut self.store, addr, block);
                    }
                }
                SessionEvent::Unchoked => {}
                SessionEvent::Block { piece_index, offset, data } => {
                    self.handle_block(addr, piece_index, offset, data, now);
                    if !self.peers.contains_key(&addr) {
                        return;
                    }
                }
            }
        }

        self.schedule(addr, now);
    }

    fn handle_block(&mut self, addr: SocketAddr, piece_index: u32, offset: u32, data: Vec<u8>, now: Instant) {
        let block = BlockInfo::new(piece_index, offset, data.len() as u32);
        self.stats.blocks_received += 1;

        for other in self.requester.complete_block(addr, block) {
            if let Some(peer) = self.peers.get_mut(&other) {
                if let Some(cancel) = peer.session.cancel(block, now) {
                    trace!("Cancelling {:?} at {}", block, other);
                    peer.send(cancel);
                }
            }
        }

        match self.store.mark_block_received(piece_index, offset, &data) {
            Ok(PieceStatus::Pending { received, total }) => {
                trace!("Piece {}: {}/{} blocks", piece_index, received, total);
            }
            Ok(PieceStatus::Duplicate) => {
                self.stats.duplicate_blocks += 1;
            }
            Ok(PieceStatus::Verified { index, data }) => {
                self.writer.commit(index, data);
            }
            Ok(PieceStatus::Corrupt { index, error }) => {
                warn!("Piece {} from {} is corrupt: {}", index, addr, error);
                self.stats.pieces_corrupt += 1;
                self.broadcast(DownloadEvent::PieceCorrupt { index });
            }
            Err(e) => self.peer_failed(addr, e),
        }
    }

    /// Apply the outcome of a piece write
    pub fn handle_commit(&mut self, result: CommitResult, now: Instant) {
        let index = result.piece_index;
        match result.result {
            Ok(()) => {
                if !self.store.commit_succeeded(index) {
                    return;
                }
                self.stats.pieces_verified += 1;
                self.publish_progress();
                self.stall_clock = now;
                debug!(
                    "Piece {} verified ({}/{})",
                    index,
                    self.store.verified_count(),
                    self.store.piece_count()
                );
                self.broadcast(DownloadEvent::PieceVerified { index });

                for peer in self.peers.values_mut().filter(|p| p.session.is_live()) {
                    peer.send(Message::Have { piece_index: index });
                    peer.session.record_sent(now);
                }
                let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
                for addr in addrs {
                    self.update_interest(addr, now);
                }
                self.check_completion();
            }
            Err(error) => {
                error!("Piece {} could not be written: {}", index, error);
                self.store.commit_failed(index);
                self.stats.disk_errors += 1;
                self.broadcast(DownloadEvent::DiskError {
                    index,
                    error: error.to_string(),
                });
                self.schedule_all(now);
            }
        }
    }

    /// Wait for queued piece writes and apply their results
    pub async fn flush_commits(&mut self) {
        self.writer.wait_idle().await;
        while let Ok(result) = self.commits.try_recv() {
            self.handle_commit(result, Instant::now());
        }
    }

    /// Periodic maintenance: request timeouts, session timeouts, keep-alives,
    /// scheduling and stall detection
    pub fn tick(&mut self, now: Instant) {
        for (addr, block) in self.requester.expire(&mut self.store, now) {
            if let Some(peer) = self.peers.get_mut(&addr) {
                if let Some(cancel) = peer.session.cancel(block, now) {
                    debug!("Request {:?} to {} timed out", block, addr);
                    peer.send(cancel);
                }
            }
        }

        let timed_out: Vec<(SocketAddr, TorrentError)> = self
            .peers
            .iter()
            .filter_map(|(addr, peer)| peer.session.check_timeouts(now).map(|e| (*addr, e)))
            .collect();
        for (addr, error) in timed_out {
            self.peer_failed(addr, error.into());
        }

        for peer in self.peers.values_mut() {
            if let Some(keepalive) = peer.session.keepalive(now) {
                peer.send(keepalive);
            }
        }

        self.schedule_all(now);
        self.check_stall(now);
    }

    /// Shut down: stop connection tasks, wait for pending writes and persist
    /// resume data
    pub async fn close(&mut self) -> Result<()> {
        info!("Closing download");
        self.closing = true;
        let _ = self.shutdown_tx.send(true);

        while self.live_tasks > 0 {
            match self.events_rx.recv().await {
                Some(event) => self.handle_event(event, Instant::now()),
                None => break,
            }
        }
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Peer task failed: {}", e);
            }
        }

        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            self.close_peer(addr, "download closed");
        }

        self.flush_commits().await;

        if self.config.resume {
            let manager = ResumeManager::new(self.config.resume_dir.clone());
            manager.save_resume_data(&ResumeData::from_store(&self.store)).await?;
        }

        let (verified, total) = self.progress();
        info!("Download closed at {}/{} bytes", verified, total);
        Ok(())
    }

    /// Close the peer if the error ends its session, otherwise log it
    fn peer_failed(&mut self, addr: SocketAddr, error: anyhow::Error) {
        if ends_session(&error) {
            self.close_peer(addr, error.to_string());
        } else {
            warn!("Peer {}: {}", addr, error);
        }
    }

    fn close_peer(&mut self, addr: SocketAddr, reason: impl Into<String>) {
        let Some(mut peer) = self.peers.remove(&addr) else {
            return;
        };
        let reason = reason.into();
        if peer.session.is_live() {
            self.live_peer_count.fetch_sub(1, Ordering::SeqCst);
        }
        peer.session.close(reason.clone());
        self.requester.release_peer(&mut self.store, addr);
        self.requester.remove_availability(peer.session.bitfield());
        self.broadcast(DownloadEvent::PeerClosed { addr, reason });
    }

    fn update_interest(&mut self, addr: SocketAddr, now: Instant) {
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };
        let interested = self.requester.is_interesting(&self.store, peer.session.bitfield());
        if let Some(message) = peer.session.set_interested(interested, now) {
            peer.send(message);
        }
    }

    fn schedule(&mut self, addr: SocketAddr, now: Instant) {
        if self.closing || self.completed {
            return;
        }
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };
        let slots = peer.session.request_slots();
        if slots == 0 {
            return;
        }

        let blocks = self
            .requester
            .next_requests(&mut self.store, addr, peer.session.bitfield(), slots, now);
        for block in blocks {
            match peer.session.request(block, now) {
                Ok(request) => peer.send(request),
                Err(e) => {
                    debug!("Could not request {:?} from {}: {}", block, addr, e);
                    self.requester.release_block(&mut self.store, addr, block);
                }
            }
        }
    }

    fn schedule_all(&mut self, now: Instant) {
        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            self.update_interest(addr, now);
            self.schedule(addr, now);
        }
    }

    fn check_stall(&mut self, now: Instant) {
        if self.completed || self.live_peers() > 0 {
            self.stall_clock = now;
            return;
        }
        let idle = now.saturating_duration_since(self.stall_clock);
        if idle >= self.config.stall_timeout {
            warn!("{}", TorrentError::stalled(idle));
            self.broadcast(DownloadEvent::Stalled { idle });
            self.stall_clock = now;
        }
    }

    fn check_completion(&mut self) {
        if self.completed || !self.store.is_complete() {
            return;
        }
        self.completed = true;
        info!("Download of '{}' complete", self.meta.name);
        let _ = self.complete_tx.send(true);
        self.broadcast(DownloadEvent::Completed);
    }

    fn publish_progress(&self) {
        self.verified_bytes.store(self.store.bytes_verified(), Ordering::SeqCst);
    }

    fn broadcast(&self, event: DownloadEvent) {
        // no subscribers is fine
        let _ = self.notify.send(event);
    }
}
