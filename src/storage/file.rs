//! File storage module
//!
//! Maps piece byte ranges onto the torrent's ordered file list and performs
//! positional reads and writes against local files.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, error, info, trace};

use crate::error::TorrentError;
use crate::storage::backend::{StorageBackend, StorageMetadata, StorageType};
use crate::torrent::TorrentMeta;

/// Represents a file entry in the storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    /// Offset of the file's first byte within the torrent
    pub offset: u64,
    pub length: u64,
}

/// A contiguous run of torrent bytes that lies within a single file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSegment {
    pub file_index: usize,
    /// Offset within the file
    pub file_offset: u64,
    pub length: u64,
}

/// Torrent byte space laid out across files in order
#[derive(Debug, Clone)]
pub struct FileLayout {
    entries: Vec<FileEntry>,
    total_size: u64,
}

impl FileLayout {
    /// Lay the torrent's files out under `base_path`
    pub fn new(base_path: &Path, meta: &TorrentMeta) -> Self {
        let mut offset = 0u64;
        let entries = meta
            .files
            .iter()
            .map(|file| {
                let entry = FileEntry {
                    path: base_path.join(file.relative_path()),
                    offset,
                    length: file.length,
                };
                offset += file.length;
                entry
            })
            .collect();

        Self {
            entries,
            total_size: offset,
        }
    }

    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Split the torrent range `[offset, offset + length)` into per-file segments.
    /// Zero-length files never produce a segment.
    pub fn segments(&self, offset: u64, length: u64) -> Result<Vec<FileSegment>> {
        let end = offset.checked_add(length).filter(|&end| end <= self.total_size).ok_or_else(|| {
            TorrentError::validation_error_with_field(
                format!("Range {}+{} exceeds torrent size {}", offset, length, self.total_size),
                "offset",
            )
        })?;

        let mut segments = Vec::new();
        for (file_index, entry) in self.entries.iter().enumerate() {
            let file_end = entry.offset + entry.length;
            if file_end <= offset || entry.length == 0 {
                continue;
            }
            if entry.offset >= end {
                break;
            }
            let start = offset.max(entry.offset);
            let stop = end.min(file_end);
            segments.push(FileSegment {
                file_index,
                file_offset: start - entry.offset,
                length: stop - start,
            });
        }
        Ok(segments)
    }
}

fn storage_failure(message: &str, path: &Path, e: std::io::Error) -> TorrentError {
    error!("{} '{}': {}", message, path.display(), e);
    TorrentError::storage_error_full(message, path.display().to_string(), e.to_string())
}

/// File storage for torrent data
#[derive(Debug)]
pub struct FileStorage {
    /// Base download directory
    base_path: PathBuf,
    meta: Arc<TorrentMeta>,
    layout: FileLayout,
}

impl FileStorage {
    /// Create a new file storage rooted at `base_path`
    pub fn new(base_path: PathBuf, meta: Arc<TorrentMeta>) -> Self {
        info!("Creating file storage for torrent: {}", meta.name);
        info!("Base path: {}", base_path.display());
        let layout = FileLayout::new(&base_path, &meta);
        Self {
            base_path,
            meta,
            layout,
        }
    }

    /// Get the base path
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn layout(&self) -> &FileLayout {
        &self.layout
    }

    /// Create every file, truncated or extended to its declared length
    pub async fn create_files(&self) -> Result<()> {
        info!("Creating {} files for torrent: {}", self.layout.entries.len(), self.meta.name);

        for entry in &self.layout.entries {
            if let Some(parent) = entry.path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| storage_failure("Failed to create directory", parent, e))?;
            }

            debug!("Creating file: {} ({} bytes)", entry.path.display(), entry.length);
            let file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .open(&entry.path)
                .await
                .map_err(|e| storage_failure("Failed to create file", &entry.path, e))?;
            file.set_len(entry.length)
                .await
                .map_err(|e| storage_failure("Failed to set file length", &entry.path, e))?;
        }

        info!("File structure created successfully");
        Ok(())
    }

    /// Write `data` starting at torrent byte `offset`
    async fn write_data(&self, offset: u64, data: &[u8]) -> Result<()> {
        trace!("Writing data at offset {} ({} bytes)", offset, data.len());
        let mut remaining = data;

        for segment in self.layout.segments(offset, data.len() as u64)? {
            let path = &self.layout.entries[segment.file_index].path;
            let (chunk, rest) = remaining.split_at(segment.length as usize);
            trace!("Writing {} bytes to file {} at offset {}", chunk.len(), path.display(), segment.file_offset);

            let mut file = fs::OpenOptions::new()
                .write(true)
                .open(path)
                .await
                .map_err(|e| storage_failure("Failed to open file for writing", path, e))?;
            file.seek(SeekFrom::Start(segment.file_offset))
                .await
                .map_err(|e| storage_failure("Failed to seek in file", path, e))?;
            file.write_all(chunk)
                .await
                .map_err(|e| storage_failure("Failed to write to file", path, e))?;
            file.flush()
                .await
                .map_err(|e| storage_failure("Failed to flush file", path, e))?;

            remaining = rest;
        }

        debug!("Wrote {} bytes at offset {}", data.len(), offset);
        Ok(())
    }

    /// Read `length` bytes starting at torrent byte `offset`. `None` if any
    /// covering file is missing or too short.
    async fn read_data(&self, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        trace!("Reading data at offset {} ({} bytes)", offset, length);
        let mut buffer = Vec::with_capacity(length as usize);

        for segment in self.layout.segments(offset, length)? {
            let path = &self.layout.entries[segment.file_index].path;
            let mut file = match fs::File::open(path).await {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("File not present: {}", path.display());
                    return Ok(None);
                }
                Err(e) => return Err(storage_failure("Failed to open file for reading", path, e).into()),
            };
            file.seek(SeekFrom::Start(segment.file_offset))
                .await
                .map_err(|e| storage_failure("Failed to seek in file", path, e))?;

            let mut chunk = vec![0u8; segment.length as usize];
            match file.read_exact(&mut chunk).await {
                Ok(_) => buffer.extend_from_slice(&chunk),
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!("File too short: {}", path.display());
                    return Ok(None);
                }
                Err(e) => return Err(storage_failure("Failed to read from file", path, e).into()),
            }
        }

        Ok(Some(buffer))
    }

    fn piece_range(&self, piece_index: u32) -> Result<(u64, u64)> {
        self.meta.piece_range(piece_index as usize).ok_or_else(|| {
            error!("Invalid piece index: {}", piece_index);
            TorrentError::validation_error_with_field(format!("Invalid piece index {}", piece_index), "piece_index").into()
        })
    }
}

#[async_trait]
impl StorageBackend for FileStorage {
    async fn initialize(&self) -> Result<()> {
        self.create_files().await
    }

    async fn write_piece(&self, piece_index: u32, data: Bytes) -> Result<()> {
        let (start, end) = self.piece_range(piece_index)?;
        if data.len() as u64 != end - start {
            return Err(TorrentError::validation_error_with_field(
                format!("Piece {} is {} bytes, expected {}", piece_index, data.len(), end - start),
                "data",
            ).into());
        }
        debug!("Writing piece {} to disk ({} bytes)", piece_index, data.len());
        self.write_data(start, &data).await
    }

    async fn read_piece(&self, piece_index: u32) -> Result<Option<Bytes>> {
        let (start, end) = self.piece_range(piece_index)?;
        Ok(self.read_data(start, end - start).await?.map(Bytes::from))
    }

    fn storage_type(&self) -> StorageType {
        StorageType::File
    }

    fn metadata(&self) -> StorageMetadata {
        StorageMetadata {
            storage_type: StorageType::File,
            base_path: Some(self.base_path.clone()),
            total_size: self.layout.total_size,
            piece_count: self.meta.piece_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::TorrentFile;

    fn multi_file_meta() -> Arc<TorrentMeta> {
        // files of 10, 0, 25 and 5 bytes; pieces of 16
        let files = vec![
            TorrentFile::new(vec!["set".into(), "a.bin".into()], 10),
            TorrentFile::new(vec!["set".into(), "empty".into()], 0),
            TorrentFile::new(vec!["set".into(), "sub".into(), "b.bin".into()], 25),
            TorrentFile::new(vec!["set".into(), "c.bin".into()], 5),
        ];
        Arc::new(TorrentMeta::new("set", [1u8; 20], 16, vec![[0u8; 20]; 3], files).unwrap())
    }

    #[test]
    fn test_segments_span_files() {
        let meta = multi_file_meta();
        let layout = FileLayout::new(Path::new("/out"), &meta);

        // piece 0: bytes 0..16 -> a.bin[0..10], b.bin[0..6]
        assert_eq!(
            layout.segments(0, 16).unwrap(),
            vec![
                FileSegment { file_index: 0, file_offset: 0, length: 10 },
                FileSegment { file_index: 2, file_offset: 0, length: 6 },
            ]
        );
        // piece 2: bytes 32..40 -> b.bin[22..25], c.bin[0..5]
        assert_eq!(
            layout.segments(32, 8).unwrap(),
            vec![
                FileSegment { file_index: 2, file_offset: 22, length: 3 },
                FileSegment { file_index: 3, file_offset: 0, length: 5 },
            ]
        );
        assert_eq!(layout.entries()[2].path, PathBuf::from("/out/set/sub/b.bin"));
        assert!(layout.segments(32, 9).is_err());
    }

    #[tokio::test]
    async fn test_write_and_read_across_files() {
        let dir = tempfile::tempdir().unwrap();
        let meta = multi_file_meta();
        let storage = FileStorage::new(dir.path().to_path_buf(), meta);

        // nothing created yet
        assert!(storage.read_piece(0).await.unwrap().is_none());

        storage.initialize().await.unwrap();
        let a = std::fs::metadata(dir.path().join("set/a.bin")).unwrap();
        assert_eq!(a.len(), 10);
        assert!(dir.path().join("set/empty").exists());

        let piece: Vec<u8> = (100..116).collect();
        storage.write_piece(0, Bytes::from(piece.clone())).await.unwrap();
        let last: Vec<u8> = (0..8).collect();
        storage.write_piece(2, Bytes::from(last.clone())).await.unwrap();

        assert_eq!(storage.read_piece(0).await.unwrap().unwrap().as_ref(), piece.as_slice());
        assert_eq!(storage.read_piece(2).await.unwrap().unwrap().as_ref(), last.as_slice());

        let a = std::fs::read(dir.path().join("set/a.bin")).unwrap();
        assert_eq!(a, &piece[..10]);
        let c = std::fs::read(dir.path().join("set/c.bin")).unwrap();
        assert_eq!(c, &last[3..]);
    }

    #[tokio::test]
    async fn test_write_rejects_wrong_length() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().to_path_buf(), multi_file_meta());
        storage.initialize().await.unwrap();

        assert!(storage.write_piece(0, Bytes::from(vec![0u8; 15])).await.is_err());
        assert!(storage.write_piece(3, Bytes::from(vec![0u8; 16])).await.is_err());
    }

    #[tokio::test]
    async fn test_initialize_truncates_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("set")).unwrap();
        std::fs::write(dir.path().join("set/c.bin"), vec![1u8; 64]).unwrap();

        let storage = FileStorage::new(dir.path().to_path_buf(), multi_file_meta());
        storage.initialize().await.unwrap();
        assert_eq!(std::fs::metadata(dir.path().join("set/c.bin")).unwrap().len(), 5);
        assert_eq!(storage.metadata().total_size, 40);
    }
}
