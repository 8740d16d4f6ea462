//! Error types for the torrent engine
//!
//! This module defines the error taxonomy used across the engine. Only a
//! stalled download is surfaced as a download-level condition; every other
//! kind is scoped to a single peer session or a single piece.

use std::fmt;
use std::time::Duration;

/// Comprehensive error type for engine operations
#[derive(Debug, Clone)]
pub enum TorrentError {
    /// Torrent metadata parsing errors
    ParseError {
        message: String,
        source: Option<String>,
    },

    /// Malformed or unexpected peer-wire data. Closes the session.
    ProtocolError {
        message: String,
        source: Option<String>,
    },

    /// Peer connection errors
    PeerError {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// Assembled piece did not hash to the expected digest. Non-fatal.
    HashMismatch {
        piece_index: u32,
        expected: String,
        actual: String,
    },

    /// File I/O errors. Fatal for the piece, not for the download.
    StorageError {
        message: String,
        path: Option<String>,
        source: Option<String>,
    },

    /// Handshake, request or keepalive timeout
    Timeout {
        message: String,
        peer: Option<String>,
    },

    /// Network errors
    NetworkError {
        message: String,
        address: Option<String>,
        source: Option<String>,
    },

    /// Configuration errors
    ConfigError {
        message: String,
        field: Option<String>,
    },

    /// Validation errors
    ValidationError {
        message: String,
        field: Option<String>,
    },

    /// No live peers and no progress for the configured duration
    Stalled {
        idle: Duration,
    },
}

impl TorrentError {
    /// Create a new ParseError
    pub fn parse_error(message: impl Into<String>) -> Self {
        TorrentError::ParseError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ParseError with source
    pub fn parse_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ParseError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new ProtocolError
    pub fn protocol_error(message: impl Into<String>) -> Self {
        TorrentError::ProtocolError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ProtocolError with source
    pub fn protocol_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ProtocolError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new PeerError
    pub fn peer_error(message: impl Into<String>) -> Self {
        TorrentError::PeerError {
            message: message.into(),
            peer: None,
            source: None,
        }
    }

    /// Create a new PeerError with peer address
    pub fn peer_error_with_peer(message: impl Into<String>, peer: impl Into<String>) -> Self {
        TorrentError::PeerError {
            message: message.into(),
            peer: Some(peer.into()),
            source: None,
        }
    }

    /// Create a new PeerError with peer and source
    pub fn peer_error_full(message: impl Into<String>, peer: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::PeerError {
            message: message.into(),
            peer: Some(peer.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new HashMismatch error
    pub fn hash_mismatch(piece_index: u32, expected: &[u8], actual: &[u8]) -> Self {
        TorrentError::HashMismatch {
            piece_index,
            expected: hex::encode(expected),
            actual: hex::encode(actual),
        }
    }

    /// Create a new StorageError
    pub fn storage_error(message: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: None,
            source: None,
        }
    }

    /// Create a new StorageError with path
    pub fn storage_error_with_path(message: impl Into<String>, path: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: Some(path.into()),
            source: None,
        }
    }

    /// Create a new StorageError with path and source
    pub fn storage_error_full(message: impl Into<String>, path: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: Some(path.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new Timeout
    pub fn timeout(message: impl Into<String>) -> Self {
        TorrentError::Timeout {
            message: message.into(),
            peer: None,
        }
    }

    /// Create a new Timeout for a specific peer
    pub fn timeout_with_peer(message: impl Into<String>, peer: impl Into<String>) -> Self {
        TorrentError::Timeout {
            message: message.into(),
            peer: Some(peer.into()),
        }
    }

    /// Create a new NetworkError
    pub fn network_error(message: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: None,
            source: None,
        }
    }

    /// Create a new NetworkError with address and source
    pub fn network_error_full(message: impl Into<String>, address: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ConfigError
    pub fn config_error(message: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new ValidationError
    pub fn validation_error(message: impl Into<String>) -> Self {
        TorrentError::ValidationError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ValidationError with field
    pub fn validation_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new Stalled condition
    pub fn stalled(idle: Duration) -> Self {
        TorrentError::Stalled { idle }
    }

    /// Whether this error ends the peer session that produced it
    pub fn closes_session(&self) -> bool {
        matches!(
            self,
            TorrentError::ProtocolError { .. }
                | TorrentError::PeerError { .. }
                | TorrentError::NetworkError { .. }
                | TorrentError::Timeout { .. }
        )
    }

    /// Add context to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let ctx = context.into();
        match &mut self {
            TorrentError::ParseError { source, .. }
            | TorrentError::ProtocolError { source, .. }
            | TorrentError::PeerError { source, .. }
            | TorrentError::StorageError { source, .. }
            | TorrentError::NetworkError { source, .. } => {
                *source = Some(source.as_ref().map_or_else(|| ctx.clone(), |s| format!("{}: {}", s, ctx)));
            }
            _ => {}
        }
        self
    }
}

impl fmt::Display for TorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorrentError::ParseError { message, source } => match source {
                Some(s) => write!(f, "Parse error: {} (source: {})", message, s),
                None => write!(f, "Parse error: {}", message),
            },
            TorrentError::ProtocolError { message, source } => match source {
                Some(s) => write!(f, "Protocol error: {} (source: {})", message, s),
                None => write!(f, "Protocol error: {}", message),
            },
            TorrentError::PeerError { message, peer, source } => match (peer, source) {
                (Some(p), Some(s)) => write!(f, "Peer error: {} (peer: {}, source: {})", message, p, s),
                (Some(p), None) => write!(f, "Peer error: {} (peer: {})", message, p),
                (None, Some(s)) => write!(f, "Peer error: {} (source: {})", message, s),
                (None, None) => write!(f, "Peer error: {}", message),
            },
            TorrentError::HashMismatch { piece_index, expected, actual } => {
                write!(f, "Hash mismatch for piece {} (expected: {}, actual: {})", piece_index, expected, actual)
            }
            TorrentError::StorageError { message, path, source } => match (path, source) {
                (Some(p), Some(s)) => write!(f, "Storage error: {} (path: {}, source: {})", message, p, s),
                (Some(p), None) => write!(f, "Storage error: {} (path: {})", message, p),
                (None, Some(s)) => write!(f, "Storage error: {} (source: {})", message, s),
                (None, None) => write!(f, "Storage error: {}", message),
            },
            TorrentError::Timeout { message, peer } => match peer {
                Some(p) => write!(f, "Timeout: {} (peer: {})", message, p),
                None => write!(f, "Timeout: {}", message),
            },
            TorrentError::NetworkError { message, address, source } => match (address, source) {
                (Some(a), Some(s)) => write!(f, "Network error: {} (address: {}, source: {})", message, a, s),
                (Some(a), None) => write!(f, "Network error: {} (address: {})", message, a),
                (None, Some(s)) => write!(f, "Network error: {} (source: {})", message, s),
                (None, None) => write!(f, "Network error: {}", message),
            },
            TorrentError::ConfigError { message, field } => match field {
                Some(field_val) => write!(f, "Config error: {} (field: {})", message, field_val),
                None => write!(f, "Config error: {}", message),
            },
            TorrentError::ValidationError { message, field } => match field {
                Some(field_val) => write!(f, "Validation error: {} (field: {})", message, field_val),
                None => write!(f, "Validation error: {}", message),
            },
            TorrentError::Stalled { idle } => {
                write!(f, "Download stalled: no peers and no progress for {}s", idle.as_secs())
            }
        }
    }
}

impl std::error::Error for TorrentError {}

// Conversions from common error types

impl From<std::io::Error> for TorrentError {
    fn from(err: std::io::Error) -> Self {
        TorrentError::storage_error_full(err.to_string(), "unknown".to_string(), err.kind().to_string())
    }
}

impl From<serde_bencode::Error> for TorrentError {
    fn from(err: serde_bencode::Error) -> Self {
        TorrentError::parse_error_with_source("Failed to parse bencode data", err.to_string())
    }
}

impl From<serde_json::Error> for TorrentError {
    fn from(err: serde_json::Error) -> Self {
        TorrentError::storage_error_full("Failed to parse JSON data", "unknown".to_string(), err.to_string())
    }
}

impl From<std::net::AddrParseError> for TorrentError {
    fn from(err: std::net::AddrParseError) -> Self {
        TorrentError::network_error_full("Failed to parse address", "unknown".to_string(), err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for TorrentError {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        TorrentError::timeout("Operation timed out")
    }
}
