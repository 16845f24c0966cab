use crate::config;
use crate::error::Error;
use crate::progress::ProgressReporter;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Terminal state of a dispatched task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Done,
    Failed,
}

/// Work drained by the runner.
///
/// `execute` runs on a worker with no lock held and must only read shared data.
/// `record` and `checkpoint` run under the runner's completion lock, so every
/// completion (state update, progress count, threshold check and any
/// checkpoint write) happens as one unit with respect to other completions.
pub trait Job: Sync {
    type Task: Send + Sync;
    type Output: Send;
    type State: Send;

    fn execute(&self, task: &Self::Task) -> Result<Self::Output, Error>;

    fn record(
        &self,
        state: &mut Self::State,
        task: &Self::Task,
        outcome: Result<Self::Output, Error>,
    ) -> TaskOutcome;

    fn checkpoint(&self, state: &Self::State) -> Result<(), Error>;
}

/// Cooperative drain flag: once raised, workers stop picking up new tasks.
/// Comparisons already running finish normally.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct RunReport<S> {
    pub state: S,
    pub total: usize,
    pub done: usize,
    pub failed: usize,
    /// Tasks never dispatched because a drain was requested.
    pub skipped: usize,
    /// Thresholds whose checkpoint was written, in firing order.
    pub checkpoints: Vec<u8>,
    pub duration: Duration,
}

impl<S> RunReport<S> {
    pub fn drained(&self) -> bool {
        self.skipped > 0
    }
}

struct Shared<S> {
    state: S,
    completed: usize,
    done: usize,
    failed: usize,
    cursor: usize,
    fired: Vec<u8>,
    fatal: Option<Error>,
}

/// Bounded worker pool that drains a task list and writes checkpoints when the
/// completed fraction crosses configured percentages.
pub struct ChunkedRunner {
    pool: ThreadPool,
    workers: usize,
    thresholds: Vec<u8>,
    stop: StopHandle,
}

impl ChunkedRunner {
    /// Fails with a configuration error when `workers` is zero or larger than
    /// the host's available parallelism.
    pub fn new(workers: usize, thresholds: &[u8]) -> Result<Self, Error> {
        let host = config::available_parallelism();
        if workers == 0 || workers > host {
            return Err(Error::Configuration(format!(
                "worker pool of {} is outside 1..={} (available parallelism)",
                workers, host
            )));
        }
        if thresholds.iter().any(|&t| t == 0 || t > 100) {
            return Err(Error::Configuration(format!(
                "checkpoint thresholds must be within 1..=100, got {:?}",
                thresholds
            )));
        }

        let mut thresholds = thresholds.to_vec();
        thresholds.sort_unstable();
        thresholds.dedup();

        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("simpair-worker-{}", i))
            .build()
            .map_err(|e| Error::Configuration(format!("cannot start worker pool: {}", e)))?;

        Ok(Self {
            pool,
            workers,
            thresholds,
            stop: StopHandle::default(),
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn thresholds(&self) -> &[u8] {
        &self.thresholds
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Run every task to a terminal state (or leave it undispatched after a
    /// drain request) and hand the state back. Returns only once no task is in
    /// progress. A failed checkpoint write stops dispatching and is returned as
    /// the run's error.
    pub fn run<J: Job>(
        &self,
        job: &J,
        description: &str,
        tasks: &[J::Task],
        state: J::State,
        reporter: &dyn ProgressReporter,
    ) -> Result<RunReport<J::State>, Error> {
        let total = tasks.len();
        let start = Instant::now();
        info!("Starting {}: {} tasks on {} workers", description, total, self.workers);
        reporter.on_phase_start(description, total);

        let abort = AtomicBool::new(false);
        let shared = Mutex::new(Shared {
            state,
            completed: 0,
            done: 0,
            failed: 0,
            cursor: 0,
            fired: Vec::new(),
            fatal: None,
        });

        self.pool.install(|| {
            tasks.par_iter().for_each(|task| {
                if self.stop.is_stop_requested() || abort.load(Ordering::SeqCst) {
                    return;
                }

                let outcome = job.execute(task);

                let mut guard = shared.lock().unwrap_or_else(PoisonError::into_inner);
                let shared = &mut *guard;
                match job.record(&mut shared.state, task, outcome) {
                    TaskOutcome::Done => shared.done += 1,
                    TaskOutcome::Failed => shared.failed += 1,
                }
                shared.completed += 1;

                let percent = (shared.completed as u64 * 100 / total as u64) as u8;
                let mut crossed = None;
                while shared.cursor < self.thresholds.len() && percent >= self.thresholds[shared.cursor] {
                    crossed = Some(self.thresholds[shared.cursor]);
                    shared.cursor += 1;
                }

                if let Some(threshold) = crossed {
                    match job.checkpoint(&shared.state) {
                        Ok(()) => {
                            debug!("{}: checkpoint at {}%", description, threshold);
                            shared.fired.push(threshold);
                            reporter.on_checkpoint(description, threshold);
                        }
                        Err(err) => {
                            error!("{}: checkpoint at {}% failed: {}", description, threshold, err);
                            if shared.fatal.is_none() {
                                shared.fatal = Some(err);
                            }
                            abort.store(true, Ordering::SeqCst);
                        }
                    }
                }

                reporter.on_task_progress(description, shared.completed, total);
            });
        });

        let shared = shared.into_inner().unwrap_or_else(PoisonError::into_inner);
        if let Some(err) = shared.fatal {
            return Err(err);
        }

        let duration = start.elapsed();
        let skipped = total - shared.completed;
        reporter.on_phase_complete(description, shared.done, shared.failed, duration.as_secs_f64());
        if skipped > 0 {
            info!("{} drained with {} tasks left undispatched", description, skipped);
        }

        Ok(RunReport {
            state: shared.state,
            total,
            done: shared.done,
            failed: shared.failed,
            skipped,
            checkpoints: shared.fired,
            duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::SilentReporter;
    use std::sync::atomic::AtomicUsize;

    struct SquareJob {
        checkpoints: AtomicUsize,
        fail_on: Option<u64>,
    }

    impl Job for SquareJob {
        type Task = u64;
        type Output = u64;
        type State = Vec<u64>;

        fn execute(&self, task: &u64) -> Result<u64, Error> {
            if Some(*task) == self.fail_on {
                return Err(Error::Comparison {
                    left: task.to_string(),
                    right: task.to_string(),
                    reason: "boom".to_string(),
                });
            }
            Ok(task * task)
        }

        fn record(&self, state: &mut Vec<u64>, _task: &u64, outcome: Result<u64, Error>) -> TaskOutcome {
            match outcome {
                Ok(v) => {
                    state.push(v);
                    TaskOutcome::Done
                }
                Err(_) => TaskOutcome::Failed,
            }
        }

        fn checkpoint(&self, _state: &Vec<u64>) -> Result<(), Error> {
            self.checkpoints.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn job(fail_on: Option<u64>) -> SquareJob {
        SquareJob {
            checkpoints: AtomicUsize::new(0),
            fail_on,
        }
    }

    #[test]
    fn test_pool_larger_than_host_is_rejected() {
        let host = config::available_parallelism();
        assert!(matches!(
            ChunkedRunner::new(host + 1, &[50]),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(ChunkedRunner::new(0, &[50]), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_every_task_reaches_a_terminal_state() {
        let runner = ChunkedRunner::new(config::available_parallelism(), &[25, 50, 75, 100]).unwrap();
        let tasks: Vec<u64> = (0..500).collect();
        let job = job(Some(7));
        let report = runner
            .run(&job, "squares", &tasks, Vec::new(), &SilentReporter)
            .unwrap();

        assert_eq!(report.total, 500);
        assert_eq!(report.done, 499);
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.state.len(), 499);
        assert!(!report.state.contains(&49));
    }

    #[test]
    fn test_thresholds_fire_once_each_under_concurrency() {
        let runner = ChunkedRunner::new(config::available_parallelism(), &[75, 25, 50, 100, 50]).unwrap();
        let tasks: Vec<u64> = (0..1000).collect();
        let job = job(None);
        let report = runner
            .run(&job, "squares", &tasks, Vec::new(), &SilentReporter)
            .unwrap();

        assert_eq!(report.checkpoints, vec![25, 50, 75, 100]);
        assert_eq!(job.checkpoints.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_small_run_coalesces_crossed_thresholds() {
        // 3 tasks: 33% crosses 25, 66% crosses 50, 100% crosses 75 and 100 in one write.
        let runner = ChunkedRunner::new(1, &[25, 50, 75, 100]).unwrap();
        let job = job(None);
        let report = runner
            .run(&job, "squares", &[1, 2, 3], Vec::new(), &SilentReporter)
            .unwrap();
        assert_eq!(report.checkpoints, vec![25, 50, 100]);
        assert_eq!(job.checkpoints.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_stop_request_leaves_tasks_undispatched() {
        let runner = ChunkedRunner::new(1, &[100]).unwrap();
        runner.stop_handle().request_stop();
        let report = runner
            .run(&job(None), "squares", &[1, 2, 3], Vec::new(), &SilentReporter)
            .unwrap();
        assert_eq!(report.skipped, 3);
        assert!(report.drained());
        assert!(report.state.is_empty());
    }

    #[test]
    fn test_empty_task_list() {
        let runner = ChunkedRunner::new(1, &[25, 50, 75, 100]).unwrap();
        let report = runner
            .run(&job(None), "squares", &[], Vec::new(), &SilentReporter)
            .unwrap();
        assert_eq!(report.total, 0);
        assert!(report.checkpoints.is_empty());
    }

    struct FailingCheckpoint;

    impl Job for FailingCheckpoint {
        type Task = u64;
        type Output = ();
        type State = usize;

        fn execute(&self, _task: &u64) -> Result<(), Error> {
            Ok(())
        }

        fn record(&self, state: &mut usize, _task: &u64, _outcome: Result<(), Error>) -> TaskOutcome {
            *state += 1;
            TaskOutcome::Done
        }

        fn checkpoint(&self, _state: &usize) -> Result<(), Error> {
            Err(Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")))
        }
    }

    #[test]
    fn test_checkpoint_failure_aborts_run() {
        let runner = ChunkedRunner::new(1, &[50]).unwrap();
        let tasks: Vec<u64> = (0..10).collect();
        let result = runner.run(&FailingCheckpoint, "failing", &tasks, 0, &SilentReporter);
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
