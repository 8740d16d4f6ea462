//! Resume data module
//!
//! Records which pieces are verified on disk so a restarted download can
//! skip them. Listed pieces are re-hashed from storage before being credited.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::TorrentError;
use crate::protocol::Bitfield;
use crate::storage::backend::StorageBackend;
use crate::storage::piece::PieceStore;

/// Resume data for a torrent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeData {
    /// Info hash as hex string
    pub info_hash: String,
    /// Number of pieces in the torrent
    pub piece_count: usize,
    /// Verified pieces as an MSB-first bitfield
    pub downloaded_pieces: Vec<u8>,
}

impl ResumeData {
    /// Create new resume data with no pieces downloaded
    pub fn new(info_hash: String, piece_count: usize) -> Self {
        Self {
            info_hash,
            piece_count,
            downloaded_pieces: Bitfield::new(piece_count).as_bytes().to_vec(),
        }
    }

    /// Snapshot the verified pieces of a store
    pub fn from_store(store: &PieceStore) -> Self {
        Self {
            info_hash: store.meta().info_hash_hex(),
            piece_count: store.piece_count(),
            downloaded_pieces: store.piece_bitfield().as_bytes().to_vec(),
        }
    }

    /// Downloaded pieces as a bitfield
    pub fn bitfield(&self) -> Result<Bitfield> {
        Bitfield::from_bytes(&self.downloaded_pieces, self.piece_count)
    }

    /// Set a piece as downloaded. Ignored if the stored bitfield is malformed.
    pub fn set_piece_downloaded(&mut self, piece_index: usize) {
        if let Ok(mut bitfield) = self.bitfield() {
            bitfield.set(piece_index);
            self.downloaded_pieces = bitfield.as_bytes().to_vec();
        }
    }

    /// Check if a piece is downloaded
    pub fn is_piece_downloaded(&self, piece_index: usize) -> bool {
        self.bitfield().map_or(false, |bitfield| bitfield.has(piece_index))
    }

    /// Get the number of downloaded pieces
    pub fn downloaded_count(&self) -> usize {
        self.bitfield().map_or(0, |bitfield| bitfield.count())
    }

    /// Serialize to bytes
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self).map_err(TorrentError::from)?)
    }

    /// Deserialize from bytes
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data).map_err(TorrentError::from)?)
    }

    /// Save to file
    pub async fn save(&self, path: &Path) -> Result<()> {
        let data = self.serialize()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, data).await?;
        debug!("Saved resume data to {}", path.display());
        Ok(())
    }

    /// Load from file
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        if !fs::try_exists(path).await? {
            return Ok(None);
        }
        let data = fs::read(path).await?;
        Ok(Some(Self::deserialize(&data)?))
    }
}

/// Resume data manager
#[derive(Debug, Clone)]
pub struct ResumeManager {
    resume_dir: PathBuf,
}

impl ResumeManager {
    /// Create a new resume manager
    pub fn new(resume_dir: PathBuf) -> Self {
        Self { resume_dir }
    }

    /// Get the resume file path for a torrent
    pub fn resume_file_path(&self, info_hash: &str) -> PathBuf {
        self.resume_dir.join(format!("{}.resume", info_hash))
    }

    /// Save resume data for a torrent
    pub async fn save_resume_data(&self, resume_data: &ResumeData) -> Result<()> {
        resume_data.save(&self.resume_file_path(&resume_data.info_hash)).await
    }

    /// Load resume data for a torrent
    pub async fn load_resume_data(&self, info_hash: &str) -> Result<Option<ResumeData>> {
        ResumeData::load(&self.resume_file_path(info_hash)).await
    }

    /// Delete resume data for a torrent
    pub async fn delete_resume_data(&self, info_hash: &str) -> Result<()> {
        let resume_path = self.resume_file_path(info_hash);
        if fs::try_exists(&resume_path).await? {
            fs::remove_file(&resume_path).await?;
        }
        Ok(())
    }

    /// Re-hash every piece listed in the resume data and credit the ones whose
    /// stored bytes still match. Returns the number of pieces credited.
    pub async fn restore(&self, store: &mut PieceStore, backend: &dyn StorageBackend) -> Result<usize> {
        let info_hash = store.meta().info_hash_hex();
        let Some(resume) = self.load_resume_data(&info_hash).await? else {
            debug!("No resume data for {}", info_hash);
            return Ok(0);
        };

        if resume.info_hash != info_hash || resume.piece_count != store.piece_count() {
            warn!("Ignoring resume data for a different torrent");
            return Ok(0);
        }

        let listed = resume.bitfield()?;
        let mut restored = 0;
        for index in listed.iter_set() {
            let Some(expected) = store.meta().piece_hash(index) else {
                continue;
            };
            match backend.read_piece(index as u32).await {
                Ok(Some(data)) => {
                    let actual: [u8; 20] = Sha1::digest(&data).into();
                    if actual == expected {
                        store.mark_verified(index as u32);
                        restored += 1;
                    } else {
                        warn!("Piece {} changed on disk since last run; downloading again", index);
                    }
                }
                Ok(None) => debug!("Piece {} missing from storage", index),
                Err(e) => warn!("Failed to read piece {} for resume: {}", index, e),
            }
        }

        info!("Restored {}/{} pieces from resume data", restored, listed.count());
        Ok(restored)
    }
}

impl Default for ResumeManager {
    fn default() -> Self {
        Self::new(PathBuf::from(".resume"))
    }
}
