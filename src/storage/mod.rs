//! Storage module
//!
//! Piece state and verification, file layout, storage backends, the disk
//! writer and resume data.

pub mod backend;
pub mod file;
pub mod memory;
pub mod piece;
pub mod resume;
pub mod writer;

pub use backend::{StorageBackend, StorageMetadata, StorageType};
pub use file::{FileEntry, FileLayout, FileSegment, FileStorage};
pub use memory::MemoryStorage;
pub use piece::{BlockInfo, BlockState, InFlight, Piece, PieceState, PieceStatus, PieceStore, DEFAULT_BLOCK_SIZE};
pub use resume::{ResumeData, ResumeManager};
pub use writer::{CommitResult, DiskWriter};
