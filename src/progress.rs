//! Progress reporting for scans
//!
//! Provides real-time progress display using indicatif progress bars.

use crate::config::ScanConfig;
use crate::scan::{ScanProgress, ScanResult};
use console::style;
use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Duration;

/// Spinner showing walk and worker status
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();

        if let Ok(style) = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
        {
            bar.set_style(style.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"));
        }

        bar.enable_steady_tick(Duration::from_millis(100));

        Self { bar }
    }

    /// Update the progress display
    pub fn update(&self, progress: &ScanProgress) {
        let pool = &progress.pool;
        let mut msg = format!(
            "Files: {} | Size: {} | Parsed: {} ({:.0}/s) | Queued: {} | Busy: {}/{}",
            format_number(progress.walk.files),
            format_size(progress.walk.bytes, BINARY),
            format_number(pool.completed),
            pool.jobs_per_second(),
            format_number(pool.queued),
            pool.busy,
            pool.workers,
        );
        if progress.skipped > 0 {
            msg.push_str(&format!(" | Unchanged: {}", format_number(progress.skipped)));
        }
        if pool.crashed > 0 {
            msg.push_str(&format!(" | Crashes: {}", pool.crashed));
        }

        self.bar.set_message(msg);
    }

    /// Set a status message
    pub fn set_status(&self, status: &str) {
        self.bar.set_message(status.to_string());
    }

    /// Finish the progress display with a final message
    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }

    /// Finish and clear the progress display
    pub fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a number with thousands separators
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let bytes: Vec<_> = s.bytes().rev().collect();

    let chunks: Vec<String> = bytes
        .chunks(3)
        .map(|chunk| chunk.iter().rev().map(|&b| b as char).collect::<String>())
        .collect();

    chunks.into_iter().rev().collect::<Vec<_>>().join(",")
}

/// Print a summary of the scan results
pub fn print_summary(result: &ScanResult, output: &Path) {
    let duration_secs = result.duration.as_secs_f64();
    let rate = if duration_secs > 0.0 {
        result.pool.completed as f64 / duration_secs
    } else {
        0.0
    };

    println!();
    println!("{}", style("Scan Complete").green().bold());
    println!("{}", style("─".repeat(50)).dim());
    println!(
        "  {} {}",
        style("Directories:").bold(),
        format_number(result.walk.dirs)
    );
    println!(
        "  {} {}",
        style("Files:").bold(),
        format_number(result.walk.files)
    );
    println!(
        "  {} {}",
        style("Total Size:").bold(),
        format_size(result.walk.bytes, BINARY)
    );
    println!(
        "  {} {} ({} workers started)",
        style("Parsed:").bold(),
        format_number(result.pool.completed),
        result.pool.spawned
    );
    if let Some(copied) = &result.copied {
        println!(
            "  {} {} unchanged, {} deleted",
            style("Incremental:").bold(),
            format_number(copied.copied),
            format_number(copied.deleted)
        );
    }
    println!(
        "  {} {:.1}s ({:.0} files/sec)",
        style("Duration:").bold(),
        duration_secs,
        rate
    );
    if result.walk.errors > 0 {
        println!(
            "  {} {}",
            style("Errors:").yellow().bold(),
            format_number(result.walk.errors)
        );
    }
    if !result.pool.crashes.is_empty() {
        println!(
            "  {} {}",
            style("Crashes:").red().bold(),
            result.pool.crashes.len()
        );
        for crash in &result.pool.crashes {
            println!(
                "    {} {}",
                style(&crash.signal).red(),
                crash.path.as_deref().unwrap_or("<idle>")
            );
        }
    }
    println!(
        "  {} {} ({} shards, store {})",
        style("Index:").bold(),
        output.display(),
        result.shards,
        format_size(result.pool.snapshot.blob_capacity, BINARY)
    );
    println!();
}

/// Print a header at the start of the scan
pub fn print_header(config: &ScanConfig) {
    println!();
    println!(
        "{} {}",
        style("docscan").cyan().bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Source:").bold(), config.root.display());
    println!("  {} {}", style("Workers:").bold(), config.workers);
    println!("  {} {}", style("Output:").bold(), config.output.display());
    if let Some(baseline) = &config.incremental {
        println!("  {} {}", style("Baseline:").bold(), baseline.display());
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234567), "1,234,567");
        assert_eq!(format_number(1234567890), "1,234,567,890");
    }
}
