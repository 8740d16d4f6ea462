//! Wire framing
//!
//! Reads and writes handshakes and length-prefixed messages on any async
//! byte stream.

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{trace, warn};

use super::handshake::HANDSHAKE_LEN;
use super::{Handshake, Message};
use crate::error::TorrentError;

/// Default ceiling for a single frame body
pub const DEFAULT_MAX_FRAME_LEN: usize = 2 * 1024 * 1024;

/// Peer-wire framing over an async stream
#[derive(Debug, Clone, Copy)]
pub struct BitTorrentWire {
    max_frame_len: usize,
}

impl Default for BitTorrentWire {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl BitTorrentWire {
    /// Create a wire codec that rejects frames larger than `max_frame_len`
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    /// Read a complete message from the stream
    pub async fn read_message<R: AsyncRead + Unpin>(&self, reader: &mut R) -> Result<Message> {
        let length = reader.read_u32().await? as usize;
        if length > self.max_frame_len {
            warn!("Frame of {} bytes exceeds limit of {}", length, self.max_frame_len);
            return Err(TorrentError::protocol_error_with_source(
                "Frame too large",
                format!("{} > {}", length, self.max_frame_len),
            ).into());
        }

        let mut body = vec![0u8; length];
        reader.read_exact(&mut body).await?;
        trace!("Read frame of {} bytes", length);
        Message::decode(&body)
    }

    /// Write a message to the stream
    pub async fn write_message<W: AsyncWrite + Unpin>(&self, writer: &mut W, message: &Message) -> Result<()> {
        writer.write_all(&message.encode()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read a handshake from the stream
    pub async fn read_handshake<R: AsyncRead + Unpin>(&self, reader: &mut R) -> Result<Handshake> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        reader.read_exact(&mut buf).await?;
        Handshake::deserialize(&buf)
    }

    /// Write a handshake to the stream
    pub async fn write_handshake<W: AsyncWrite + Unpin>(&self, writer: &mut W, handshake: &Handshake) -> Result<()> {
        writer.write_all(&handshake.serialize()).await?;
        writer.flush().await?;
        Ok(())
    }
}
