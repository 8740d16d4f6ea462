//! Torrent metadata
//!
//! The immutable descriptor every other component reads from.

use std::path::PathBuf;

use anyhow::Result;
use sha1::{Digest, Sha1};

use crate::error::TorrentError;

/// Represents a file in the torrent's ordered file list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    /// File path components relative to the output directory
    pub path: Vec<String>,
    /// File size in bytes
    pub length: u64,
}

impl TorrentFile {
    /// Create a new file entry
    pub fn new(path: Vec<String>, length: u64) -> Self {
        Self { path, length }
    }

    /// Path relative to the output directory
    pub fn relative_path(&self) -> PathBuf {
        self.path.iter().collect()
    }
}

/// Immutable torrent descriptor
#[derive(Debug, Clone)]
pub struct TorrentMeta {
    /// Torrent name
    pub name: String,
    /// SHA1 hash of the bencoded info dictionary
    pub info_hash: [u8; 20],
    /// Size of each piece in bytes (the last piece may be shorter)
    pub piece_length: u64,
    /// Expected SHA1 digest of every piece, in order
    pub pieces: Vec<[u8; 20]>,
    /// Ordered file list; piece data is the concatenation of these files
    pub files: Vec<TorrentFile>,
    total_length: u64,
}

impl TorrentMeta {
    /// Create and validate a torrent descriptor
    pub fn new(
        name: impl Into<String>,
        info_hash: [u8; 20],
        piece_length: u64,
        pieces: Vec<[u8; 20]>,
        files: Vec<TorrentFile>,
    ) -> Result<Self> {
        let name = name.into();
        if piece_length == 0 {
            return Err(TorrentError::validation_error_with_field("Piece length must be non-zero", "piece_length").into());
        }
        if piece_length > u32::MAX as u64 {
            return Err(TorrentError::validation_error_with_field("Piece length does not fit the wire format", "piece_length").into());
        }
        if files.is_empty() {
            return Err(TorrentError::validation_error_with_field("Torrent has no files", "files").into());
        }
        for file in &files {
            if file.path.is_empty() || file.path.iter().any(|c| c.is_empty() || c == ".." || c == "." || c.contains('/') || c.contains('\\')) {
                return Err(TorrentError::validation_error_with_field(
                    format!("Unsafe file path: {:?}", file.path),
                    "files",
                ).into());
            }
        }

        let total_length: u64 = files.iter().map(|f| f.length).sum();
        let expected_pieces = total_length.div_ceil(piece_length);
        if pieces.len() as u64 != expected_pieces {
            return Err(TorrentError::validation_error_with_field(
                format!("Expected {} piece hashes for {} bytes, got {}", expected_pieces, total_length, pieces.len()),
                "pieces",
            ).into());
        }

        Ok(Self {
            name,
            info_hash,
            piece_length,
            pieces,
            files,
            total_length,
        })
    }

    /// Total size of all files in bytes
    pub fn total_size(&self) -> u64 {
        self.total_length
    }

    /// Number of pieces
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Length of a specific piece
    pub fn piece_size(&self, index: usize) -> Option<u64> {
        self.piece_range(index).map(|(start, end)| end - start)
    }

    /// Expected digest of a specific piece
    pub fn piece_hash(&self, index: usize) -> Option<[u8; 20]> {
        self.pieces.get(index).copied()
    }

    /// Absolute byte range `[start, end)` of a piece within the torrent
    pub fn piece_range(&self, index: usize) -> Option<(u64, u64)> {
        if index >= self.pieces.len() {
            return None;
        }

        let start = (index as u64) * self.piece_length;
        let end = std::cmp::min(start + self.piece_length, self.total_length);
        Some((start, end))
    }

    /// Whether this torrent has more than one file
    pub fn is_multi_file(&self) -> bool {
        self.files.len() > 1
    }

    /// Info hash as a hex string
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// Compute an info hash from the raw bencoded info dictionary
    pub fn generate_info_hash(info_dict_bytes: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(info_dict_bytes);
        hasher.finalize().into()
    }

    /// Split concatenated piece digests into 20-byte hashes
    pub fn parse_piece_hashes(pieces_bytes: &[u8]) -> Result<Vec<[u8; 20]>> {
        if pieces_bytes.len() % 20 != 0 {
            return Err(TorrentError::parse_error(format!(
                "Pieces field length must be a multiple of 20, got {}",
                pieces_bytes.len()
            )).into());
        }

        Ok(pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(piece_length: u64, files: Vec<TorrentFile>, piece_count: usize) -> Result<TorrentMeta> {
        TorrentMeta::new("test", [1u8; 20], piece_length, vec![[0u8; 20]; piece_count], files)
    }

    #[test]
    fn test_single_file_meta() {
        let info = meta(1024, vec![TorrentFile::new(vec!["a.bin".into()], 2048)], 2).unwrap();
        assert_eq!(info.total_size(), 2048);
        assert_eq!(info.piece_count(), 2);
        assert!(!info.is_multi_file());
        assert_eq!(info.info_hash_hex(), hex::encode([1u8; 20]));
    }

    #[test]
    fn test_piece_count_mismatch_rejected() {
        let result = meta(1024, vec![TorrentFile::new(vec!["a.bin".into()], 2049)], 2);
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_piece_length_rejected() {
        assert!(meta(0, vec![TorrentFile::new(vec!["a.bin".into()], 10)], 0).is_err());
    }

    #[test]
    fn test_unsafe_path_rejected() {
        let files = vec![TorrentFile::new(vec!["..".into(), "etc".into()], 10)];
        assert!(meta(1024, files, 1).is_err());
    }

    #[test]
    fn test_piece_range_last_piece_shorter() {
        let info = meta(1024, vec![TorrentFile::new(vec!["a.bin".into()], 1500)], 2).unwrap();
        assert_eq!(info.piece_range(0), Some((0, 1024)));
        assert_eq!(info.piece_range(1), Some((1024, 1500)));
        assert_eq!(info.piece_size(1), Some(476));
        assert_eq!(info.piece_range(2), None);
    }

    #[test]
    fn test_multi_file_total() {
        let files = vec![
            TorrentFile::new(vec!["dir".into(), "one.txt".into()], 500),
            TorrentFile::new(vec!["dir".into(), "two.txt".into()], 524),
        ];
        let info = meta(1024, files, 1).unwrap();
        assert_eq!(info.total_size(), 1024);
        assert!(info.is_multi_file());
        assert_eq!(info.files[0].relative_path(), PathBuf::from("dir").join("one.txt"));
    }

    #[test]
    fn test_parse_piece_hashes() {
        let hashes: Vec<u8> = (0..40).map(|i| i as u8).collect();
        let result = TorrentMeta::parse_piece_hashes(&hashes).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[1][0], 20);
        assert!(TorrentMeta::parse_piece_hashes(&[1u8; 21]).is_err());
    }

    #[test]
    fn test_generate_info_hash() {
        // SHA1("abc")
        let hash = TorrentMeta::generate_info_hash(b"abc");
        assert_eq!(hex::encode(hash), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }
}
