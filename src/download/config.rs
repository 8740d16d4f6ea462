//! Download configuration
//!
//! Tuning knobs for scheduling, timeouts and disk concurrency.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use crate::error::TorrentError;
use crate::protocol::MAX_REQUEST_LEN;
use crate::storage::DEFAULT_BLOCK_SIZE;

/// Configuration for a single download
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Size of a requested block
    pub block_size: u32,
    /// Outstanding requests allowed per peer
    pub max_in_flight_per_peer: usize,
    /// A request older than this may be reassigned to another peer
    pub request_timeout: Duration,
    /// Time allowed for the handshake once connected
    pub handshake_timeout: Duration,
    /// Time allowed for the TCP connect
    pub connect_timeout: Duration,
    /// Send a keep-alive after this long without sending anything
    pub keepalive_interval: Duration,
    /// Close a session after this long without hearing anything
    pub keepalive_timeout: Duration,
    /// Duplicate requests are allowed once this few blocks remain unfinished
    pub endgame_threshold: usize,
    /// Report a stall after this long with no live peers and no progress
    pub stall_timeout: Duration,
    /// Concurrent piece writes
    pub disk_workers: usize,
    /// Period of the scheduling and timeout tick
    pub tick_interval: Duration,
    /// Load and save resume data
    pub resume: bool,
    /// Where resume data is kept
    pub resume_dir: PathBuf,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_in_flight_per_peer: 16,
            request_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(60),
            keepalive_timeout: Duration::from_secs(120),
            endgame_threshold: 8,
            stall_timeout: Duration::from_secs(60),
            disk_workers: 4,
            tick_interval: Duration::from_millis(500),
            resume: true,
            resume_dir: PathBuf::from(".resume"),
        }
    }
}

impl DownloadConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.block_size > MAX_REQUEST_LEN {
            return Err(TorrentError::config_error_with_field(
                format!("block_size must be between 1 and {}", MAX_REQUEST_LEN),
                "block_size",
            ).into());
        }

        let non_zero = [
            (self.max_in_flight_per_peer == 0, "max_in_flight_per_peer"),
            (self.disk_workers == 0, "disk_workers"),
            (self.request_timeout.is_zero(), "request_timeout"),
            (self.handshake_timeout.is_zero(), "handshake_timeout"),
            (self.connect_timeout.is_zero(), "connect_timeout"),
            (self.keepalive_interval.is_zero(), "keepalive_interval"),
            (self.keepalive_timeout.is_zero(), "keepalive_timeout"),
            (self.stall_timeout.is_zero(), "stall_timeout"),
            (self.tick_interval.is_zero(), "tick_interval"),
        ];
        if let Some((_, field)) = non_zero.iter().find(|(zero, _)| *zero) {
            return Err(TorrentError::config_error_with_field(format!("{} must be non-zero", field), *field).into());
        }

        if self.keepalive_interval >= self.keepalive_timeout {
            return Err(TorrentError::config_error_with_field(
                "keepalive_interval must be shorter than keepalive_timeout",
                "keepalive_interval",
            ).into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = DownloadConfig::default();

        assert_eq!(config.block_size, 16384);
        assert_eq!(config.max_in_flight_per_peer, 16);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.keepalive_interval, Duration::from_secs(60));
        assert_eq!(config.keepalive_timeout, Duration::from_secs(120));
        assert_eq!(config.endgame_threshold, 8);
        assert_eq!(config.stall_timeout, Duration::from_secs(60));
        assert_eq!(config.disk_workers, 4);
        assert_eq!(config.tick_interval, Duration::from_millis(500));
        assert!(config.resume);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let config = DownloadConfig { max_in_flight_per_peer: 0, ..Default::default() };
        assert!(config.validate().is_err());

        let config = DownloadConfig { stall_timeout: Duration::ZERO, ..Default::default() };
        assert!(config.validate().is_err());

        let config = DownloadConfig { block_size: 0, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_block() {
        let config = DownloadConfig { block_size: MAX_REQUEST_LEN + 1, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_keepalive_order() {
        let config = DownloadConfig {
            keepalive_interval: Duration::from_secs(120),
            keepalive_timeout: Duration::from_secs(60),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
