//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// CLI arguments for the torrent engine
#[derive(Debug, Parser)]
#[command(name = "rust-torrent-engine")]
#[command(about = "Download a torrent from a known set of peers", long_about = None)]
pub struct CliArgs {
    /// Path to the .torrent file
    #[arg(value_name = "TORRENT_FILE")]
    pub torrent_file: PathBuf,

    /// Peer to download from (repeatable)
    #[arg(long = "peer", value_name = "ADDR")]
    pub peers: Vec<SocketAddr>,

    /// Download directory
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Outstanding requests per peer
    #[arg(long, default_value_t = 16)]
    pub max_in_flight: usize,

    /// Seconds before an unanswered request is reassigned
    #[arg(long, default_value_t = 30)]
    pub request_timeout: u64,

    /// Blocks remaining when endgame starts
    #[arg(long, default_value_t = 8)]
    pub endgame_threshold: usize,

    /// Seconds without live peers or progress before reporting a stall
    #[arg(long, default_value_t = 60)]
    pub stall_timeout: u64,

    /// Concurrent piece writes
    #[arg(long, default_value_t = 4)]
    pub disk_workers: usize,

    /// Exit with an error when the download stalls
    #[arg(long)]
    pub fail_on_stall: bool,

    /// Do not load or save resume data
    #[arg(long)]
    pub no_resume: bool,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long)]
    pub quiet: bool,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let args = CliArgs::try_parse_from(["rust-torrent-engine", "test.torrent"]).unwrap();

        assert_eq!(args.torrent_file, PathBuf::from("test.torrent"));
        assert!(args.peers.is_empty());
        assert_eq!(args.output_dir, None);
        assert_eq!(args.max_in_flight, 16);
        assert_eq!(args.request_timeout, 30);
        assert_eq!(args.endgame_threshold, 8);
        assert_eq!(args.stall_timeout, 60);
        assert_eq!(args.disk_workers, 4);
        assert!(!args.fail_on_stall);
        assert!(!args.no_resume);
        assert_eq!(args.log_level(), tracing::Level::INFO);
    }

    #[test]
    fn test_repeated_peers() {
        let args = CliArgs::try_parse_from([
            "rust-torrent-engine",
            "test.torrent",
            "--peer",
            "127.0.0.1:6881",
            "--peer",
            "10.0.0.2:51413",
            "-v",
        ])
        .unwrap();

        assert_eq!(args.peers.len(), 2);
        assert_eq!(args.peers[1], "10.0.0.2:51413".parse::<SocketAddr>().unwrap());
        assert_eq!(args.log_level(), tracing::Level::DEBUG);
    }

    #[test]
    fn test_invalid_peer_rejected() {
        let result = CliArgs::try_parse_from(["rust-torrent-engine", "test.torrent", "--peer", "not-an-addr"]);
        assert!(result.is_err());
    }
}
