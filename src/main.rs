//! rust-torrent-engine - Main entry point
//!
//! Downloads one torrent from the peers given on the command line.

use anyhow::{Context, Result};
use rust_torrent_engine::{
    CliArgs, Config, DownloadCoordinator, DownloadEvent, FileStorage, ProgressDisplay, ProgressHandle,
    ProgressStats, TorrentError, TorrentMeta, TorrentParser,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        match panic_info.location() {
            Some(location) => error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            ),
            None => error!("PANIC occurred at unknown location"),
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    init_logging(&args);
    info!("rust-torrent-engine starting");
    debug!("CLI arguments: {:?}", args);

    let meta = Arc::new(load_torrent_file(&args.torrent_file).context("Failed to load torrent file")?);

    let config = Config::from_args(&args);
    config.validate().context("Invalid configuration")?;

    display_torrent_info(&meta, &config);

    tokio::fs::create_dir_all(&config.output_dir)
        .await
        .map_err(|e| {
            TorrentError::storage_error_full(
                "Failed to create output directory",
                config.output_dir.display().to_string(),
                e.to_string(),
            )
        })
        .context("Failed to prepare output directory")?;

    let storage = Arc::new(FileStorage::new(config.output_dir.clone(), Arc::clone(&meta)));
    let mut coordinator = DownloadCoordinator::new(Arc::clone(&meta), storage, config.download.clone())
        .context("Failed to create download")?;

    let progress = ProgressDisplay::new(config.is_quiet());
    progress.print_status("Starting download...")?;

    let (stall_tx, stall_rx) = oneshot::channel();
    let reporter = tokio::spawn(report_progress(
        coordinator.progress_handle(),
        coordinator.subscribe(),
        progress,
        config.fail_on_stall.then_some(stall_tx),
    ));

    let mut stalled = None;
    let shutdown = async {
        tokio::select! {
            _ = shutdown_signal() => {}
            Ok(idle) = stall_rx => stalled = Some(idle),
        }
    };
    coordinator.run(&config.peers, shutdown).await.context("Download failed")?;

    let handle = coordinator.progress_handle();
    // closes the event stream so the reporter returns
    drop(coordinator);
    let progress = reporter.await.context("Progress reporter failed")?;

    if let Some(idle) = stalled {
        progress.print_error(&format!("no progress for {}", ProgressStats::format_duration(idle)))?;
        return Err(TorrentError::stalled(idle).into());
    }

    let (verified, total) = handle.progress();
    if handle.is_complete() {
        progress.print_complete(total)?;
    } else {
        progress.print_status(&format!(
            "Download stopped at {} / {}",
            ProgressStats::format_bytes(verified),
            ProgressStats::format_bytes(total)
        ))?;
    }

    info!("rust-torrent-engine finished");
    Ok(())
}

/// Redraw progress every second and log download events until the
/// coordinator goes away. Hands the display back when done.
async fn report_progress(
    handle: ProgressHandle,
    mut events: broadcast::Receiver<DownloadEvent>,
    mut display: ProgressDisplay,
    mut on_stall: Option<oneshot::Sender<Duration>>,
) -> ProgressDisplay {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let (verified, total) = handle.progress();
                let stats = display.sample(verified, total, handle.peers());
                if let Err(e) = display.update(&stats) {
                    debug!("Failed to draw progress: {}", e);
                }
            }
            event = events.recv() => match event {
                Ok(DownloadEvent::PieceCorrupt { index }) => warn!("Piece {} failed verification", index),
                Ok(DownloadEvent::DiskError { index, error }) => error!("Write of piece {} failed: {}", index, error),
                Ok(DownloadEvent::PeerClosed { addr, reason }) => info!("Peer {} closed: {}", addr, reason),
                Ok(DownloadEvent::Stalled { idle }) => {
                    warn!("Download stalled for {}", ProgressStats::format_duration(idle));
                    if let Some(tx) = on_stall.take() {
                        let _ = tx.send(idle);
                    }
                }
                Ok(DownloadEvent::PieceVerified { .. }) | Ok(DownloadEvent::Completed) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => debug!("Missed {} download events", missed),
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    display
}

/// Resolve on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Shutdown request received, shutting down..."),
        _ = terminate => info!("Terminate signal received, shutting down..."),
    }
}

/// Initialize logging based on verbosity settings
fn init_logging(args: &CliArgs) {
    let level = args.log_level();

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.is_verbose() {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }

    debug!("Logging initialized with level {:?}", level);
}

/// Load and parse the torrent file
fn load_torrent_file(path: &Path) -> Result<TorrentMeta> {
    info!("Loading torrent file: {}", path.display());

    let torrent_data = std::fs::read(path)
        .map_err(|e| {
            error!("Failed to read torrent file '{}': {}", path.display(), e);
            TorrentError::storage_error_full("Failed to read torrent file", path.display().to_string(), e.to_string())
        })?;

    debug!("Torrent file size: {} bytes", torrent_data.len());

    let meta = TorrentParser::parse_bytes(&torrent_data)
        .with_context(|| format!("Failed to parse torrent file '{}'", path.display()))?;

    info!("Successfully loaded torrent file: {}", meta.name);
    Ok(meta)
}

/// Display torrent information
fn display_torrent_info(meta: &TorrentMeta, config: &Config) {
    if config.is_quiet() {
        return;
    }

    println!("Torrent Information:");
    println!("  Name: {}", meta.name);
    println!("  Size: {} ({})",
        meta.total_size(),
        ProgressStats::format_bytes(meta.total_size())
    );
    println!("  Files: {}", meta.files.len());
    println!("  Pieces: {}", meta.piece_count());
    println!("  Piece length: {}", ProgressStats::format_bytes(meta.piece_length));
    println!("  Info hash: {}", meta.info_hash_hex());
    println!();
    println!("Configuration:");
    println!("  Output directory: {}", config.output_dir.display());
    println!("  Peers: {}", config.peers.len());
    println!("  Max in flight per peer: {}", config.download.max_in_flight_per_peer);
    println!("  Resume: {}", if config.download.resume { "enabled" } else { "disabled" });
    println!();
}
