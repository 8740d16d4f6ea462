//! Download module
//!
//! Block scheduling and the coordinator that runs a download.

pub mod config;
pub mod coordinator;
pub mod event;
pub mod requester;

pub use config::DownloadConfig;
pub use coordinator::{DownloadCoordinator, DownloadStats, ProgressHandle};
pub use event::{DownloadEvent, PeerEvent};
pub use requester::BlockRequester;
