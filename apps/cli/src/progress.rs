//! Progress bar utilities for CLI downloads

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;

/// Progress bar for the single active transfer
pub struct TransferProgress {
    bar: ProgressBar,
}

impl TransferProgress {
    pub fn new(destination: &Path) -> Self {
        let bar = ProgressBar::new(0);

        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}")
                .unwrap()
                .progress_chars("█▓▒░  "),
        );

        let name = destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        bar.set_message(name);

        Self { bar }
    }

    /// Feed a progress event into the bar. Unknown totals leave the
    /// length untouched so the bar keeps its last known bound.
    pub fn update(&self, bytes_written: u64, bytes_expected: Option<u64>) {
        if let Some(total) = bytes_expected {
            self.bar.set_length(total);
        }
        self.bar.set_position(bytes_written);
    }

    pub fn finish(&self) {
        self.bar
            .finish_with_message(format!("{} complete", style("✓").green().bold()));
    }

    pub fn pause(&self) {
        self.bar
            .abandon_with_message(format!("{} paused", style("⏸").yellow()));
    }

    pub fn cancel(&self) {
        self.bar
            .abandon_with_message(format!("{} stopped", style("○").dim()));
    }

    pub fn fail(&self) {
        self.bar
            .abandon_with_message(format!("{} failed", style("✗").red().bold()));
    }
}
