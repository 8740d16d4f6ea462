//! Progress display module
//!
//! Handles displaying download progress in the CLI.

use std::io::{self, Write};
use std::time::{Duration, Instant};

const BAR_WIDTH: usize = 40;

/// Snapshot of a download for display
#[derive(Debug, Clone, Default)]
pub struct ProgressStats {
    /// Verified bytes
    pub downloaded: u64,
    /// Size of the torrent
    pub total: u64,
    /// Download speed in bytes per second
    pub download_speed: f64,
    /// Number of live peers
    pub peers: usize,
}

impl ProgressStats {
    /// Fraction done, 0.0 to 1.0. An empty torrent counts as done.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.downloaded as f64 / self.total as f64
        }
    }

    /// Format bytes to human readable string
    pub fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_index = 0;

        while size >= 1024.0 && unit_index < UNITS.len() - 1 {
            size /= 1024.0;
            unit_index += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_index])
    }

    /// Format speed to human readable string
    pub fn format_speed(bytes_per_sec: f64) -> String {
        format!("{}/s", Self::format_bytes(bytes_per_sec as u64))
    }

    /// Format duration to human readable string
    pub fn format_duration(duration: Duration) -> String {
        let total_secs = duration.as_secs();
        let hours = total_secs / 3600;
        let minutes = (total_secs % 3600) / 60;
        let seconds = total_secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, minutes, seconds)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, seconds)
        } else {
            format!("{}s", seconds)
        }
    }

    /// Calculate ETA based on download speed and remaining bytes
    pub fn calculate_eta(downloaded: u64, total: u64, speed: f64) -> Option<Duration> {
        if speed <= 0.0 || downloaded >= total {
            return None;
        }

        let remaining = total.saturating_sub(downloaded) as f64;
        Some(Duration::from_secs_f64(remaining / speed))
    }
}

/// Render the bar and percentage, e.g. `[████░░…] 10.00%`
pub fn render_bar(fraction: f64) -> String {
    let fraction = fraction.clamp(0.0, 1.0);
    let filled = (fraction * BAR_WIDTH as f64) as usize;
    let empty = BAR_WIDTH - filled;
    format!("[{}{}] {:.2}%", "█".repeat(filled), "░".repeat(empty), fraction * 100.0)
}

/// Progress display for CLI
pub struct ProgressDisplay {
    start_time: Instant,
    last_sample: Option<(Instant, u64)>,
    quiet: bool,
}

impl ProgressDisplay {
    /// Create a new progress display
    pub fn new(quiet: bool) -> Self {
        Self {
            start_time: Instant::now(),
            last_sample: None,
            quiet,
        }
    }

    /// Build display stats from a progress reading, computing speed from the
    /// previous reading
    pub fn sample(&mut self, downloaded: u64, total: u64, peers: usize) -> ProgressStats {
        let now = Instant::now();
        let download_speed = match self.last_sample {
            Some((at, before)) => {
                let elapsed = now.duration_since(at).as_secs_f64();
                if elapsed > 0.0 {
                    downloaded.saturating_sub(before) as f64 / elapsed
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.last_sample = Some((now, downloaded));

        ProgressStats {
            downloaded,
            total,
            download_speed,
            peers,
        }
    }

    /// Redraw the progress line
    pub fn update(&mut self, stats: &ProgressStats) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }

        let eta = ProgressStats::calculate_eta(stats.downloaded, stats.total, stats.download_speed);
        let eta_str = eta
            .map(ProgressStats::format_duration)
            .unwrap_or_else(|| "∞".to_string());

        let line = format!(
            "{} | {} / {} | ↓ {} | Peers: {} | ETA: {}",
            render_bar(stats.fraction()),
            ProgressStats::format_bytes(stats.downloaded),
            ProgressStats::format_bytes(stats.total),
            ProgressStats::format_speed(stats.download_speed),
            stats.peers,
            eta_str,
        );

        let mut stdout = io::stdout();
        write!(stdout, "\r\x1b[2K{}", line)?;
        stdout.flush()
    }

    /// Print completion message
    pub fn print_complete(&self, total: u64) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }

        print!("\r\x1b[2K");
        println!("{}", render_bar(1.0));
        println!("Download completed!");
        println!("  Size: {}", ProgressStats::format_bytes(total));
        println!("  Elapsed Time: {}", ProgressStats::format_duration(self.start_time.elapsed()));
        io::stdout().flush()
    }

    /// Print a status message
    pub fn print_status(&self, message: &str) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }

        println!("\r\x1b[2K{}", message);
        Ok(())
    }

    /// Print an error message
    pub fn print_error(&self, message: &str) -> io::Result<()> {
        eprintln!("\r\x1b[2KError: {}", message);
        Ok(())
    }

    /// Get the elapsed time since start
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(ProgressStats::format_bytes(0), "0.00 B");
        assert_eq!(ProgressStats::format_bytes(1024), "1.00 KB");
        assert_eq!(ProgressStats::format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(ProgressStats::format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(ProgressStats::format_speed(1024.0), "1.00 KB/s");
        assert_eq!(ProgressStats::format_speed(1024.0 * 1024.0), "1.00 MB/s");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(ProgressStats::format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(ProgressStats::format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(ProgressStats::format_duration(Duration::from_secs(3661)), "1h 1m 1s");
    }

    #[test]
    fn test_calculate_eta() {
        assert_eq!(ProgressStats::calculate_eta(50, 100, 10.0), Some(Duration::from_secs(5)));
        assert_eq!(ProgressStats::calculate_eta(100, 100, 10.0), None);
        assert_eq!(ProgressStats::calculate_eta(50, 100, 0.0), None);
    }

    #[test]
    fn test_render_bar() {
        assert_eq!(render_bar(0.0), format!("[{}] 0.00%", "░".repeat(40)));
        assert_eq!(render_bar(1.0), format!("[{}] 100.00%", "█".repeat(40)));
        assert_eq!(
            render_bar(0.25),
            format!("[{}{}] 25.00%", "█".repeat(10), "░".repeat(30))
        );
        // partial cells round down
        assert_eq!(
            render_bar(0.123456),
            format!("[{}{}] 12.35%", "█".repeat(4), "░".repeat(36))
        );
        assert_eq!(render_bar(1.5), render_bar(1.0));
    }

    #[test]
    fn test_fraction() {
        let stats = ProgressStats { downloaded: 256, total: 1024, ..Default::default() };
        assert_eq!(stats.fraction(), 0.25);
        assert_eq!(ProgressStats::default().fraction(), 1.0);
    }

    #[test]
    fn test_sample_speed() {
        let mut display = ProgressDisplay::new(true);
        let first = display.sample(0, 100, 1);
        assert_eq!(first.download_speed, 0.0);
        std::thread::sleep(Duration::from_millis(10));
        let second = display.sample(50, 100, 1);
        assert!(second.download_speed > 0.0);
        assert_eq!(second.peers, 1);
    }

    #[test]
    fn test_progress_display_quiet() {
        let display = ProgressDisplay::new(true);
        assert!(display.is_quiet());
        assert_eq!(display.elapsed().as_secs(), 0);
    }
}
