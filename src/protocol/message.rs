//! BitTorrent peer-wire messages
//!
//! Every message after the handshake is `<u32 big-endian length><u8 id><payload>`;
//! a zero length is a keep-alive.

use anyhow::Result;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{error, trace};

use crate::error::TorrentError;

/// Largest block a peer may ask us for (BEP 3 practice)
pub const MAX_REQUEST_LEN: u32 = 128 * 1024;

/// BitTorrent message IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl TryFrom<u8> for MessageId {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            _ => {
                error!("Invalid message ID: {}", value);
                Err(TorrentError::protocol_error_with_source("Invalid message ID", format!("value: {}", value)).into())
            }
        }
    }
}

/// BitTorrent protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Port { listen_port: u16 },
}

impl Message {
    /// Get the message ID (None for KeepAlive)
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield { .. } => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
            Message::Port { .. } => Some(MessageId::Port),
        }
    }

    /// Length of the frame body (excluding the 4-byte length prefix)
    pub fn length(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 1,
            Message::Have { .. } => 5,
            Message::Bitfield { bitfield } => 1 + bitfield.len() as u32,
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { block, .. } => 9 + block.len() as u32,
            Message::Port { .. } => 3,
        }
    }

    /// Encode the message including its length prefix
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.length() as usize);
        buf.put_u32(self.length());
        if let Some(id) = self.message_id() {
            buf.put_u8(id as u8);
        }

        match self {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {}
            Message::Have { piece_index } => buf.put_u32(*piece_index),
            Message::Bitfield { bitfield } => buf.put_slice(bitfield),
            Message::Request { index, begin, length } | Message::Cancel { index, begin, length } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, block } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Port { listen_port } => buf.put_u16(*listen_port),
        }

        trace!("Encoded {:?}: {} bytes", self.message_id(), buf.len());
        buf.freeze()
    }

    /// Decode a frame body (the bytes after the length prefix)
    pub fn decode(mut body: &[u8]) -> Result<Self> {
        if body.is_empty() {
            return Ok(Message::KeepAlive);
        }

        let message_id = MessageId::try_from(body.get_u8())?;
        let payload_len = body.remaining();

        let expect = |len: usize| -> Result<()> {
            if payload_len != len {
                error!("{:?} payload has wrong size: expected {} bytes, got {}", message_id, len, payload_len);
                return Err(TorrentError::protocol_error_with_source(
                    format!("{:?} message has wrong size", message_id),
                    format!("expected {} bytes, got {}", len, payload_len),
                ).into());
            }
            Ok(())
        };

        let message = match message_id {
            MessageId::Choke => {
                expect(0)?;
                Message::Choke
            }
            MessageId::Unchoke => {
                expect(0)?;
                Message::Unchoke
            }
            MessageId::Interested => {
                expect(0)?;
                Message::Interested
            }
            MessageId::NotInterested => {
                expect(0)?;
                Message::NotInterested
            }
            MessageId::Have => {
                expect(4)?;
                Message::Have { piece_index: body.get_u32() }
            }
            MessageId::Bitfield => Message::Bitfield { bitfield: body.to_vec() },
            MessageId::Request => {
                expect(12)?;
                Message::Request { index: body.get_u32(), begin: body.get_u32(), length: body.get_u32() }
            }
            MessageId::Piece => {
                if payload_len < 8 {
                    return Err(TorrentError::protocol_error_with_source(
                        "Piece message too short",
                        format!("expected at least 8 bytes, got {}", payload_len),
                    ).into());
                }
                let index = body.get_u32();
                let begin = body.get_u32();
                Message::Piece { index, begin, block: body.to_vec() }
            }
            MessageId::Cancel => {
                expect(12)?;
                Message::Cancel { index: body.get_u32(), begin: body.get_u32(), length: body.get_u32() }
            }
            MessageId::Port => {
                expect(2)?;
                Message::Port { listen_port: body.get_u16() }
            }
        };

        trace!("Decoded {:?}", message.message_id());
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keepalive_is_four_zero_bytes() {
        assert_eq!(Message::KeepAlive.encode().as_ref(), &[0, 0, 0, 0]);
        assert_eq!(Message::decode(&[]).unwrap(), Message::KeepAlive);
    }

    #[test]
    fn test_request_layout() {
        let bytes = Message::Request { index: 1, begin: 0x4000, length: 0x4000 }.encode();
        assert_eq!(
            bytes.as_ref(),
            &[0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0x40, 0, 0, 0, 0x40, 0]
        );
    }

    #[test]
    fn test_piece_layout_and_decode() {
        let message = Message::Piece { index: 2, begin: 16, block: vec![9, 8, 7] };
        let bytes = message.encode();
        assert_eq!(&bytes[..5], &[0, 0, 0, 12, 7]);
        assert_eq!(Message::decode(&bytes[4..]).unwrap(), message);
    }

    #[test]
    fn test_have_and_bitfield_decode() {
        assert_eq!(Message::decode(&[4, 0, 0, 1, 0]).unwrap(), Message::Have { piece_index: 256 });
        assert_eq!(
            Message::decode(&[5, 0b1010_0000]).unwrap(),
            Message::Bitfield { bitfield: vec![0b1010_0000] }
        );
    }

    #[test]
    fn test_wrong_sizes_rejected() {
        // choke with a payload
        assert!(Message::decode(&[0, 1]).is_err());
        // have with three bytes
        assert!(Message::decode(&[4, 0, 0, 1]).is_err());
        // request with eleven bytes
        assert!(Message::decode(&[6, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
        // piece without begin
        assert!(Message::decode(&[7, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_unknown_id_rejected() {
        assert!(Message::decode(&[20]).is_err());
        assert!(MessageId::try_from(10).is_err());
        assert_eq!(MessageId::try_from(8).unwrap(), MessageId::Cancel);
    }

    #[test]
    fn test_length_matches_encoding() {
        let messages = [
            Message::Choke,
            Message::Have { piece_index: 0 },
            Message::Bitfield { bitfield: vec![0xff; 3] },
            Message::Cancel { index: 0, begin: 0, length: 0 },
            Message::Port { listen_port: 6881 },
        ];
        for message in messages {
            assert_eq!(message.encode().len(), 4 + message.length() as usize);
        }
    }
}
