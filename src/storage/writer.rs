//! Disk writer
//!
//! Commits verified pieces to a storage backend on a bounded pool of tasks.
//! Distinct pieces are written in parallel; writes to the same piece are
//! serialized. Results come back on a channel so the download loop can
//! credit or requeue each piece.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex, Notify, Semaphore};
use tracing::{debug, error, trace};

use crate::error::TorrentError;
use crate::storage::backend::StorageBackend;

/// Outcome of one piece commit
#[derive(Debug, Clone)]
pub struct CommitResult {
    pub piece_index: u32,
    pub result: Result<(), TorrentError>,
}

/// Writes verified pieces through a [`StorageBackend`]
pub struct DiskWriter {
    backend: Arc<dyn StorageBackend>,
    permits: Arc<Semaphore>,
    /// One lock per piece region
    regions: Arc<Vec<Mutex<()>>>,
    results: mpsc::UnboundedSender<CommitResult>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl DiskWriter {
    /// Create a writer with `workers` concurrent writes. Commit results are
    /// delivered on the returned receiver.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        piece_count: usize,
        workers: usize,
    ) -> (Self, mpsc::UnboundedReceiver<CommitResult>) {
        let (results, rx) = mpsc::unbounded_channel();
        let writer = Self {
            backend,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            regions: Arc::new((0..piece_count).map(|_| Mutex::new(())).collect()),
            results,
            pending: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        };
        (writer, rx)
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Commits started but not yet finished
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Queue a verified piece for writing. Never blocks the caller.
    pub fn commit(&self, piece_index: u32, data: Vec<u8>) {
        let backend = Arc::clone(&self.backend);
        let permits = Arc::clone(&self.permits);
        let regions = Arc::clone(&self.regions);
        let results = self.results.clone();
        let pending = Arc::clone(&self.pending);
        let idle = Arc::clone(&self.idle);

        pending.fetch_add(1, Ordering::SeqCst);
        debug!("Queued piece {} for commit ({} bytes)", piece_index, data.len());

        tokio::spawn(async move {
            let result = Self::write(backend, permits, regions, piece_index, Bytes::from(data)).await;
            if let Err(e) = &result {
                error!("Failed to commit piece {}: {}", piece_index, e);
            }
            // receiver gone means the download was dropped
            let _ = results.send(CommitResult { piece_index, result });

            if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                idle.notify_waiters();
            }
        });
    }

    async fn write(
        backend: Arc<dyn StorageBackend>,
        permits: Arc<Semaphore>,
        regions: Arc<Vec<Mutex<()>>>,
        piece_index: u32,
        data: Bytes,
    ) -> Result<(), TorrentError> {
        let region = regions
            .get(piece_index as usize)
            .ok_or_else(|| TorrentError::storage_error(format!("Invalid piece index {}", piece_index)))?;
        let _region = region.lock().await;
        let _permit = permits
            .acquire()
            .await
            .map_err(|_| TorrentError::storage_error("Disk writer shut down"))?;

        trace!("Writing piece {}", piece_index);
        backend.write_piece(piece_index, data).await.map_err(|e| match e.downcast::<TorrentError>() {
            Ok(err) => err,
            Err(e) => TorrentError::storage_error(e.to_string()),
        })
    }

    /// Wait until every queued commit has finished
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backend::{StorageMetadata, StorageType};
    use crate::storage::memory::MemoryStorage;
    use crate::storage::piece::tests::test_meta;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Backend that records how many writes overlap
    #[derive(Default)]
    struct SlowStorage {
        active: AtomicUsize,
        max_active: AtomicUsize,
        active_on_zero: AtomicUsize,
        max_on_zero: AtomicUsize,
    }

    #[async_trait]
    impl StorageBackend for SlowStorage {
        async fn initialize(&self) -> Result<()> {
            Ok(())
        }

        async fn write_piece(&self, piece_index: u32, _data: Bytes) -> Result<()> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            if piece_index == 0 {
                let now = self.active_on_zero.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_on_zero.fetch_max(now, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            if piece_index == 0 {
                self.active_on_zero.fetch_sub(1, Ordering::SeqCst);
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        async fn read_piece(&self, _piece_index: u32) -> Result<Option<Bytes>> {
            Ok(None)
        }

        fn storage_type(&self) -> StorageType {
            StorageType::Memory
        }

        fn metadata(&self) -> StorageMetadata {
            StorageMetadata {
                storage_type: StorageType::Memory,
                base_path: None,
                total_size: 0,
                piece_count: 8,
            }
        }
    }

    #[tokio::test]
    async fn test_commit_reports_success() {
        let storage = Arc::new(MemoryStorage::new(test_meta(64, 128)));
        let (writer, mut results) = DiskWriter::new(storage.clone(), 2, 2);

        writer.commit(1, vec![5u8; 64]);
        let result = results.recv().await.unwrap();
        assert_eq!(result.piece_index, 1);
        assert!(result.result.is_ok());
        writer.wait_idle().await;
        assert_eq!(writer.pending(), 0);
        assert_eq!(storage.piece(1).unwrap().len(), 64);
    }

    #[tokio::test]
    async fn test_commit_reports_storage_error() {
        let storage = Arc::new(MemoryStorage::new(test_meta(64, 128)));
        storage.fail_next_writes(1);
        let (writer, mut results) = DiskWriter::new(storage, 2, 2);

        writer.commit(0, vec![0u8; 64]);
        let result = results.recv().await.unwrap();
        assert!(matches!(result.result, Err(TorrentError::StorageError { .. })));
    }

    #[tokio::test]
    async fn test_pool_is_bounded_and_regions_serialized() {
        let storage = Arc::new(SlowStorage::default());
        let (writer, mut results) = DiskWriter::new(storage.clone(), 8, 2);

        for index in 0..6u32 {
            writer.commit(index, vec![0u8; 4]);
        }
        writer.commit(0, vec![0u8; 4]);
        writer.commit(0, vec![0u8; 4]);
        writer.wait_idle().await;

        let mut received = 0;
        while results.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 8);
        assert!(storage.max_active.load(Ordering::SeqCst) <= 2);
        assert_eq!(storage.max_on_zero.load(Ordering::SeqCst), 1);
    }
}
