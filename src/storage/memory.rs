//! In-memory storage backend
//!
//! Keeps committed pieces in a map. Useful for tests and for callers that
//! consume piece data directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::error::TorrentError;
use crate::storage::backend::{StorageBackend, StorageMetadata, StorageType};
use crate::torrent::TorrentMeta;

/// Piece storage held in memory
#[derive(Debug)]
pub struct MemoryStorage {
    meta: Arc<TorrentMeta>,
    pieces: Mutex<HashMap<u32, Bytes>>,
    /// Remaining writes to fail before accepting data
    failures: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryStorage {
    pub fn new(meta: Arc<TorrentMeta>) -> Self {
        Self {
            meta,
            pieces: Mutex::new(HashMap::new()),
            failures: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` writes fail with a storage error
    pub fn fail_next_writes(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Number of successful writes so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Copy of a stored piece
    pub fn piece(&self, piece_index: u32) -> Option<Bytes> {
        self.pieces.lock().ok()?.get(&piece_index).cloned()
    }

    /// All stored pieces concatenated in order, if every piece is present
    pub fn contents(&self) -> Option<Vec<u8>> {
        let pieces = self.pieces.lock().ok()?;
        let mut out = Vec::with_capacity(self.meta.total_size() as usize);
        for index in 0..self.meta.piece_count() as u32 {
            out.extend_from_slice(pieces.get(&index)?);
        }
        Some(out)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<u32, Bytes>>> {
        self.pieces
            .lock()
            .map_err(|_| TorrentError::storage_error("Memory storage lock poisoned").into())
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn initialize(&self) -> Result<()> {
        self.lock()?.clear();
        Ok(())
    }

    async fn write_piece(&self, piece_index: u32, data: Bytes) -> Result<()> {
        let expected = self.meta.piece_size(piece_index as usize).ok_or_else(|| {
            TorrentError::validation_error_with_field(format!("Invalid piece index {}", piece_index), "piece_index")
        })?;
        if data.len() as u64 != expected {
            return Err(TorrentError::validation_error_with_field(
                format!("Piece {} is {} bytes, expected {}", piece_index, data.len(), expected),
                "data",
            ).into());
        }

        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(TorrentError::storage_error(format!("Injected write failure for piece {}", piece_index)).into());
        }

        debug!("Storing piece {} in memory ({} bytes)", piece_index, data.len());
        self.lock()?.insert(piece_index, data);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_piece(&self, piece_index: u32) -> Result<Option<Bytes>> {
        Ok(self.lock()?.get(&piece_index).cloned())
    }

    fn storage_type(&self) -> StorageType {
        StorageType::Memory
    }

    fn metadata(&self) -> StorageMetadata {
        StorageMetadata {
            storage_type: StorageType::Memory,
            base_path: None,
            total_size: self.meta.total_size(),
            piece_count: self.meta.piece_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::piece::tests::test_meta;

    #[tokio::test]
    async fn test_store_and_read() {
        let storage = MemoryStorage::new(test_meta(64, 100));
        storage.write_piece(1, Bytes::from(vec![7u8; 36])).await.unwrap();

        assert_eq!(storage.read_piece(1).await.unwrap().unwrap().len(), 36);
        assert!(storage.read_piece(0).await.unwrap().is_none());
        assert!(storage.contents().is_none());
        assert_eq!(storage.write_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let storage = MemoryStorage::new(test_meta(64, 64));
        storage.fail_next_writes(1);

        assert!(storage.write_piece(0, Bytes::from(vec![0u8; 64])).await.is_err());
        assert!(storage.write_piece(0, Bytes::from(vec![0u8; 64])).await.is_ok());
        assert_eq!(storage.contents().unwrap().len(), 64);
    }
}
