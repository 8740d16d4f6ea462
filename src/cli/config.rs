//! CLI configuration module
//!
//! Turns parsed arguments into the download configuration.

use crate::cli::args::CliArgs;
use crate::download::DownloadConfig;
use crate::error::TorrentError;
use anyhow::Result;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for one CLI run
#[derive(Debug, Clone)]
pub struct Config {
    /// Download directory
    pub output_dir: PathBuf,
    /// Peers to connect to
    pub peers: Vec<SocketAddr>,
    /// Engine settings
    pub download: DownloadConfig,
    /// Treat a stall as fatal
    pub fail_on_stall: bool,
    /// Verbose output
    pub verbose: bool,
    /// Quiet mode
    pub quiet: bool,
}

impl Config {
    /// Create configuration from CLI arguments
    pub fn from_args(args: &CliArgs) -> Self {
        let output_dir = args.output_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("./downloads"));

        let download = DownloadConfig {
            max_in_flight_per_peer: args.max_in_flight,
            request_timeout: Duration::from_secs(args.request_timeout),
            endgame_threshold: args.endgame_threshold,
            stall_timeout: Duration::from_secs(args.stall_timeout),
            disk_workers: args.disk_workers,
            resume: !args.no_resume,
            resume_dir: output_dir.join(".resume"),
            ..DownloadConfig::default()
        };

        Self {
            output_dir,
            peers: args.peers.clone(),
            download,
            fail_on_stall: args.fail_on_stall,
            verbose: args.verbose,
            quiet: args.quiet,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.output_dir.as_os_str().is_empty() {
            return Err(TorrentError::config_error_with_field("output_dir cannot be empty", "output_dir").into());
        }

        if self.peers.is_empty() {
            return Err(TorrentError::config_error_with_field("at least one --peer is required", "peers").into());
        }

        self.download.validate()
    }

    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(extra: &[&str]) -> CliArgs {
        let mut argv = vec!["rust-torrent-engine", "test.torrent"];
        argv.extend_from_slice(extra);
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_config_from_args() {
        let config = Config::from_args(&args(&[
            "--peer",
            "127.0.0.1:6881",
            "-o",
            "/tmp/downloads",
            "--max-in-flight",
            "8",
            "--request-timeout",
            "5",
            "--no-resume",
        ]));

        assert_eq!(config.output_dir, PathBuf::from("/tmp/downloads"));
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.download.max_in_flight_per_peer, 8);
        assert_eq!(config.download.request_timeout, Duration::from_secs(5));
        assert!(!config.download.resume);
        assert_eq!(config.download.resume_dir, PathBuf::from("/tmp/downloads/.resume"));
        // untouched settings keep their defaults
        assert_eq!(config.download.block_size, DownloadConfig::default().block_size);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_requires_peer() {
        let config = Config::from_args(&args(&[]));
        assert_eq!(config.output_dir, PathBuf::from("./downloads"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_rejects_zero_workers() {
        let config = Config::from_args(&args(&["--peer", "127.0.0.1:6881", "--disk-workers", "0"]));
        assert!(config.validate().is_err());
    }
}
