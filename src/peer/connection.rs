//! Peer connection module
//!
//! One task per peer: connects, exchanges handshakes, then pumps decoded
//! messages to the coordinator and writes whatever the coordinator queues.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::download::event::PeerEvent;
use crate::error::TorrentError;
use crate::protocol::{BitTorrentWire, Handshake, Message};

/// Map a failure on the connection to the error reported to the coordinator
fn connection_error(addr: SocketAddr, context: &str, err: anyhow::Error) -> TorrentError {
    match err.downcast::<TorrentError>() {
        Ok(err) => err,
        Err(err) => TorrentError::network_error_full(context, addr.to_string(), err.to_string()),
    }
}

/// Outbound connection to one peer
#[derive(Debug, Clone)]
pub struct PeerConnection {
    addr: SocketAddr,
    info_hash: [u8; 20],
    our_peer_id: [u8; 20],
    connect_timeout: Duration,
    handshake_timeout: Duration,
    wire: BitTorrentWire,
}

impl PeerConnection {
    pub fn new(
        addr: SocketAddr,
        info_hash: [u8; 20],
        our_peer_id: [u8; 20],
        connect_timeout: Duration,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            addr,
            info_hash,
            our_peer_id,
            connect_timeout,
            handshake_timeout,
            wire: BitTorrentWire::default(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Run the connection on its own task. The task always ends by sending
    /// `PeerEvent::Disconnected`, and stops when `shutdown` flips to true or
    /// the outbound queue is dropped.
    pub fn spawn(
        self,
        events: mpsc::Sender<PeerEvent>,
        outbound: mpsc::UnboundedReceiver<Message>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let addr = self.addr;
            let result = tokio::select! {
                result = self.run(&events, outbound) => result,
                _ = shutdown.wait_for(|stop| *stop) => {
                    debug!("Shutting down connection to {}", addr);
                    Ok(())
                }
            };

            let error = result.err();
            if let Some(e) = &error {
                debug!("Connection to {} ended: {}", addr, e);
            }
            // coordinator may already be gone during shutdown
            let _ = events.send(PeerEvent::Disconnected { addr, error }).await;
        })
    }

    async fn run(
        &self,
        events: &mpsc::Sender<PeerEvent>,
        outbound: mpsc::UnboundedReceiver<Message>,
    ) -> Result<(), TorrentError> {
        info!("Connecting to peer: {}", self.addr);
        let stream = timeout(self.connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| {
                warn!("Connection timeout to {}", self.addr);
                TorrentError::timeout_with_peer("Connection timed out", self.addr.to_string())
            })?
            .map_err(|e| {
                error!("Failed to connect to {}: {}", self.addr, e);
                TorrentError::network_error_full("Failed to connect", self.addr.to_string(), e.to_string())
            })?;

        if events.send(PeerEvent::Connected { addr: self.addr }).await.is_err() {
            return Ok(());
        }
        self.drive(stream, events, outbound).await
    }

    /// Handshake and message pump over an established stream
    pub async fn drive<S>(
        &self,
        stream: S,
        events: &mpsc::Sender<PeerEvent>,
        mut outbound: mpsc::UnboundedReceiver<Message>,
    ) -> Result<(), TorrentError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let addr = self.addr;
        let wire = self.wire;

        debug!("Sending handshake to peer: {}", addr);
        wire.write_handshake(&mut writer, &Handshake::new(self.info_hash, self.our_peer_id))
            .await
            .map_err(|e| connection_error(addr, "Failed to send handshake", e))?;

        let handshake = timeout(self.handshake_timeout, wire.read_handshake(&mut reader))
            .await
            .map_err(|_| TorrentError::timeout_with_peer("Handshake timed out", addr.to_string()))?
            .map_err(|e| connection_error(addr, "Failed to read handshake", e))?;
        if events.send(PeerEvent::Handshake { addr, handshake }).await.is_err() {
            return Ok(());
        }

        let read_loop = async {
            loop {
                let message = wire
                    .read_message(&mut reader)
                    .await
                    .map_err(|e| connection_error(addr, "Failed to read message", e))?;
                trace!("Received {:?} from {}", message.message_id(), addr);
                if events.send(PeerEvent::Message { addr, message }).await.is_err() {
                    return Ok::<(), TorrentError>(());
                }
            }
        };

        let write_loop = async {
            while let Some(message) = outbound.recv().await {
                trace!("Sending {:?} to {}", message.message_id(), addr);
                wire.write_message(&mut writer, &message)
                    .await
                    .map_err(|e| connection_error(addr, "Failed to send message", e))?;
            }
            debug!("Outbound queue for {} closed", addr);
            Ok::<(), TorrentError>(())
        };

        tokio::select! {
            result = read_loop => result,
            result = write_loop => result,
        }
    }
}
