use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use simpair_core::ProgressReporter;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const TICKS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";

/// CLI progress reporter using indicatif progress bars.
///
/// - Scan: spinner (file count unknown upfront)
/// - Extraction and comparison: bar sized to the task count
pub struct CliReporter {
    bar: Mutex<Option<ProgressBar>>,
}

impl CliReporter {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<ProgressBar>> {
        self.bar.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_bar(&self, pb: ProgressBar) {
        let mut guard = self.lock();
        if let Some(old) = guard.take() {
            old.finish_and_clear();
        }
        *guard = Some(pb);
    }

    fn finish_bar(&self) {
        if let Some(pb) = self.lock().take() {
            pb.finish_and_clear();
        }
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars(TICKS)
}

fn bar_style(description: &str) -> ProgressStyle {
    let template = format!(
        "  {{spinner:.cyan}} {} [{{bar:30.cyan/dim}}] {{pos}}/{{len}} ({{eta}} remaining)",
        description
    );
    ProgressStyle::with_template(&template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("━╸─")
        .tick_chars(TICKS)
}

impl ProgressReporter for CliReporter {
    fn on_scan_start(&self) {
        let pb = ProgressBar::new_spinner();
        pb.set_style(spinner_style());
        pb.set_message("Scanning images...");
        pb.enable_steady_tick(Duration::from_millis(80));
        self.set_bar(pb);
    }

    fn on_scan_complete(&self, total_items: usize, duration_secs: f64) {
        self.finish_bar();
        eprintln!(
            "  {} Scan complete: {} images in {:.2}s",
            style("✓").green(),
            total_items,
            duration_secs
        );
    }

    fn on_phase_start(&self, description: &str, total: usize) {
        let pb = ProgressBar::new(total as u64);
        pb.set_style(bar_style(description));
        pb.enable_steady_tick(Duration::from_millis(80));
        self.set_bar(pb);
    }

    fn on_task_progress(&self, _description: &str, completed: usize, _total: usize) {
        if let Some(pb) = self.lock().as_ref() {
            pb.set_position(completed as u64);
        }
    }

    fn on_checkpoint(&self, description: &str, percent: u8) {
        if let Some(pb) = self.lock().as_ref() {
            pb.println(format!(
                "  {} {}: checkpoint at {}%",
                style("•").dim(),
                description,
                percent
            ));
        }
    }

    fn on_phase_complete(&self, description: &str, done: usize, failed: usize, duration_secs: f64) {
        self.finish_bar();
        let mark = if failed == 0 {
            style("✓").green()
        } else {
            style("!").yellow()
        };
        eprintln!(
            "  {} {} complete: {} done, {} failed in {:.2}s",
            mark, description, done, failed, duration_secs
        );
    }
}
