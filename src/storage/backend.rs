//! Storage backend abstraction for torrent downloads
//!
//! The disk writer only talks to this trait, so pieces can be committed to
//! local files or kept in memory without the writer knowing which.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;

use anyhow::Result;

/// Abstract storage backend for torrent data
///
/// Implementations must be safe to call concurrently for different pieces.
/// Calls for the same piece are serialized by the caller.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Prepare storage for the torrent
    ///
    /// For FileStorage: creates directories and files, truncated to their
    /// declared lengths
    async fn initialize(&self) -> Result<()>;

    /// Write a verified piece
    ///
    /// # Arguments
    /// * `piece_index` - Index of the piece in the torrent
    /// * `data` - Verified piece data, exactly the piece's length
    async fn write_piece(&self, piece_index: u32, data: Bytes) -> Result<()>;

    /// Read a piece back (for resume rechecks)
    ///
    /// Returns `None` when the piece's data is not present.
    async fn read_piece(&self, piece_index: u32) -> Result<Option<Bytes>>;

    /// Get storage type identifier
    fn storage_type(&self) -> StorageType;

    /// Get storage-specific metadata
    fn metadata(&self) -> StorageMetadata;
}

/// Storage type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    /// Local filesystem storage
    File,
    /// In-memory storage
    Memory,
}

/// Storage-specific metadata
#[derive(Debug, Clone)]
pub struct StorageMetadata {
    pub storage_type: StorageType,
    pub base_path: Option<PathBuf>,
    pub total_size: u64,
    pub piece_count: usize,
}
