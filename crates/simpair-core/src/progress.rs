/// Trait for reporting pipeline progress.
///
/// The CLI implements it with indicatif bars. Reporting is purely observational:
/// nothing a reporter does can change what the pipeline computes.
/// All methods have default no-op implementations.
pub trait ProgressReporter: Send + Sync {
    fn on_scan_start(&self) {}
    fn on_scan_complete(&self, _total_items: usize, _duration_secs: f64) {}
    fn on_phase_start(&self, _description: &str, _total: usize) {}
    fn on_task_progress(&self, _description: &str, _completed: usize, _total: usize) {}
    fn on_checkpoint(&self, _description: &str, _percent: u8) {}
    fn on_phase_complete(&self, _description: &str, _done: usize, _failed: usize, _duration_secs: f64) {}
}

/// No-op progress reporter for silent operation.
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}
