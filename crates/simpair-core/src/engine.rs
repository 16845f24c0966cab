use crate::catalog::{self, ItemCatalog, ItemRecord};
use crate::checkpoint::{self, CheckpointKind, CheckpointPaths};
use crate::config::AppConfig;
use crate::error::Error;
use crate::extract::{ExtractionJob, FeatureExtractor};
use crate::matcher::{self, score_matches, CpuBackend, MatcherBackend};
use crate::progress::ProgressReporter;
use crate::queue::{ComparisonTask, PairQueue};
use crate::runner::{ChunkedRunner, Job, StopHandle, TaskOutcome};
use crate::store::{ComparisonResult, FailedComparison, ResultStore};
use ahash::AHashSet;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const EXTRACT_PHASE: &str = "Extracting descriptors";
const COMPARE_PHASE: &str = "Comparing images";

/// Drives the whole pipeline: scan, extract, queue, match, export. Every phase
/// resumes from the checkpoints under the cache directory.
pub struct Engine {
    config: AppConfig,
    runner: ChunkedRunner,
    backend: Box<dyn MatcherBackend>,
    extractor: Box<dyn FeatureExtractor>,
    paths: CheckpointPaths,
}

#[derive(Debug)]
pub struct ExtractionSummary {
    pub items: usize,
    pub extracted: usize,
    pub unreadable: usize,
    pub from_checkpoint: bool,
    pub drained: bool,
    pub duration: Duration,
}

#[derive(Debug)]
pub struct ComparisonSummary {
    pub backend: String,
    /// Tasks outstanding when the phase started.
    pub scheduled: usize,
    pub compared: usize,
    pub failed: usize,
    pub remaining: usize,
    pub results_total: usize,
    pub checkpoints: Vec<u8>,
    pub exported: bool,
    pub duration: Duration,
}

#[derive(Debug)]
pub struct RunSummary {
    pub extraction: ExtractionSummary,
    pub comparison: Option<ComparisonSummary>,
}

#[derive(Debug)]
pub struct ExportSummary {
    pub rows: usize,
    pub csv_path: PathBuf,
    pub json_path: PathBuf,
}

/// What the checkpoints on disk say about a collection.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CheckpointStatus {
    pub catalog_items: Option<usize>,
    pub quarantined: usize,
    pub extraction_complete: bool,
    pub queue_remaining: Option<usize>,
    pub results: usize,
    pub failures: usize,
}

impl Engine {
    /// Validates the configuration and sizes the worker pool before anything
    /// touches the filesystem.
    pub fn new(config: AppConfig, extractor: Box<dyn FeatureExtractor>) -> Result<Self, Error> {
        config.validate()?;
        let runner = ChunkedRunner::new(config.workers, &config.checkpoint_thresholds)?;
        let backend = matcher::select_backend(&config);
        let paths = CheckpointPaths::new(&config);
        info!(
            "Engine ready: {} workers, extractor '{}', backend '{}'",
            runner.workers(),
            extractor.name(),
            backend.name()
        );
        Ok(Self {
            config,
            runner,
            backend,
            extractor,
            paths,
        })
    }

    pub fn with_backend(mut self, backend: Box<dyn MatcherBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn paths(&self) -> &CheckpointPaths {
        &self.paths
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Raising this flag drains both phases: running work finishes, nothing new starts.
    pub fn stop_handle(&self) -> StopHandle {
        self.runner.stop_handle()
    }

    pub fn run_all(&self, reporter: &dyn ProgressReporter) -> Result<RunSummary, Error> {
        let (catalog, extraction) = self.read_images(reporter)?;
        if extraction.drained || self.runner.stop_handle().is_stop_requested() {
            info!("Stopped before comparing; rerun to continue");
            return Ok(RunSummary {
                extraction,
                comparison: None,
            });
        }
        let comparison = self.compare_images(&catalog, reporter)?;
        Ok(RunSummary {
            extraction,
            comparison: Some(comparison),
        })
    }

    /// Build (or resume) the catalog and fill in every missing descriptor.
    /// Unreadable items are quarantined and dropped from the returned catalog.
    pub fn read_images(&self, reporter: &dyn ProgressReporter) -> Result<(ItemCatalog, ExtractionSummary), Error> {
        catalog::ensure_layout(&self.config)?;
        let start = Instant::now();

        let loaded: Option<ItemCatalog> = checkpoint::read_binary(&self.paths.catalog, CheckpointKind::Catalog)?;
        let from_checkpoint = loaded.is_some();
        let catalog = match loaded {
            Some(catalog) => {
                info!(
                    "Loaded catalog checkpoint: {} items, {} quarantined",
                    catalog.len(),
                    catalog.quarantined().len()
                );
                catalog
            }
            None => {
                reporter.on_scan_start();
                let scan_start = Instant::now();
                let catalog = catalog::scan(&self.config)?;
                let secs = scan_start.elapsed().as_secs_f64();
                reporter.on_scan_complete(catalog.len(), secs);
                info!("Scanned {} images in {:.2}s", catalog.len(), secs);
                catalog
            }
        };

        let tasks = ExtractionJob::tasks(&catalog);
        if tasks.is_empty() && from_checkpoint {
            debug!("Every descriptor is already computed");
            let summary = ExtractionSummary {
                items: catalog.len(),
                extracted: 0,
                unreadable: 0,
                from_checkpoint,
                drained: false,
                duration: start.elapsed(),
            };
            return Ok((catalog, summary));
        }

        let job = ExtractionJob::new(&self.config.root_path(), self.extractor.as_ref(), &self.paths.catalog);
        let report = self.runner.run(&job, EXTRACT_PHASE, &tasks, catalog, reporter)?;
        let drained = report.drained();
        let mut catalog = report.state;

        let dropped = catalog.drop_quarantined();
        if dropped > 0 {
            warn!("{} unreadable images excluded from comparison", dropped);
        }
        checkpoint::write_binary(&self.paths.catalog, CheckpointKind::Catalog, &catalog)?;

        let summary = ExtractionSummary {
            items: catalog.len(),
            extracted: report.done,
            unreadable: report.failed,
            from_checkpoint,
            drained,
            duration: start.elapsed(),
        };
        Ok((catalog, summary))
    }

    /// Match every outstanding pair of a fully extracted catalog. The remaining
    /// queue and the results are checkpointed together at each threshold and
    /// once more when the phase ends; the exports are written once the queue
    /// is empty.
    pub fn compare_images(
        &self,
        catalog: &ItemCatalog,
        reporter: &dyn ProgressReporter,
    ) -> Result<ComparisonSummary, Error> {
        if !catalog.is_complete() {
            return Err(Error::Checkpoint(format!(
                "{} images still need descriptors; finish extraction first",
                catalog.pending_extraction().len()
            )));
        }
        let start = Instant::now();
        let ready: AHashSet<&str> = catalog.ready_ids().into_iter().collect();

        let mut results = ResultStore::load_checkpoint(&self.paths.results)?;
        let retried = if self.config.retry_failed {
            results.take_failures()
        } else {
            Vec::new()
        };

        let mut queue = match PairQueue::load(&self.paths.queue)? {
            Some(queue) => {
                info!("Loaded queue checkpoint: {} pairs remaining", queue.len());
                queue
            }
            None => {
                let queue = PairQueue::generate(&catalog.ready_ids());
                info!("Generated {} pairs over {} images", queue.len(), ready.len());
                queue
            }
        };

        if !retried.is_empty() {
            info!("Re-queueing {} failed comparisons", retried.len());
        }
        for failure in retried {
            queue.insert(ComparisonTask::new(
                failure.sequence_number,
                failure.left_id,
                failure.right_id,
            ));
        }

        let reconciled = queue.retain(|left, right| {
            ready.contains(left) && ready.contains(right) && !results.contains_pair(left, right)
        });
        if reconciled > 0 {
            info!("Dropped {} pairs already recorded or no longer in the catalog", reconciled);
        }

        // Queue first: a re-queued failure must be persisted as a task before
        // it leaves the failures list.
        queue.save(&self.paths.queue)?;
        results.save_checkpoint(&self.paths.results)?;

        let fallback;
        let backend: &dyn MatcherBackend = match self.backend.prepare(catalog, &queue) {
            Ok(()) => self.backend.as_ref(),
            Err(Error::BackendUnavailable(reason)) => {
                warn!("{}; comparing on the CPU instead", reason);
                fallback = CpuBackend::new(self.config.search_checks);
                &fallback
            }
            Err(err) => return Err(err),
        };

        let tasks = queue.tasks();
        let job = MatchJob {
            catalog,
            backend,
            ratio: self.config.ratio_threshold,
            paths: &self.paths,
        };
        let outcome = self
            .runner
            .run(&job, COMPARE_PHASE, &tasks, MatchState { queue, results }, reporter);
        backend.release_all();
        let report = outcome?;

        let MatchState { queue, results } = &report.state;
        results.save_checkpoint(&self.paths.results)?;
        queue.save(&self.paths.queue)?;

        let exported = queue.is_empty();
        if exported {
            self.write_exports(results)?;
        } else {
            info!("{} pairs left; rerun to continue", queue.len());
        }

        Ok(ComparisonSummary {
            backend: backend.name().to_string(),
            scheduled: report.total,
            compared: report.done,
            failed: report.failed,
            remaining: queue.len(),
            results_total: results.len(),
            checkpoints: report.checkpoints.clone(),
            exported,
            duration: start.elapsed(),
        })
    }

    /// Rewrite both export files from the result checkpoint.
    pub fn export(&self) -> Result<ExportSummary, Error> {
        let results = ResultStore::load_checkpoint(&self.paths.results)?;
        self.write_exports(&results)
    }

    fn write_exports(&self, results: &ResultStore) -> Result<ExportSummary, Error> {
        results.export_csv(&self.paths.export_csv)?;
        results.export_json(&self.paths.export_json)?;
        info!(
            "Exported {} results to {}",
            results.len(),
            self.paths.export_csv.display()
        );
        Ok(ExportSummary {
            rows: results.len(),
            csv_path: self.paths.export_csv.clone(),
            json_path: self.paths.export_json.clone(),
        })
    }

    pub fn status(&self) -> Result<CheckpointStatus, Error> {
        let catalog: Option<ItemCatalog> = checkpoint::read_binary(&self.paths.catalog, CheckpointKind::Catalog)?;
        let queue = PairQueue::load(&self.paths.queue)?;
        let results = ResultStore::load_checkpoint(&self.paths.results)?;
        Ok(CheckpointStatus {
            catalog_items: catalog.as_ref().map(|c| c.len()),
            quarantined: catalog.as_ref().map_or(0, |c| c.quarantined().len()),
            extraction_complete: catalog.as_ref().map_or(false, |c| c.is_complete()),
            queue_remaining: queue.map(|q| q.len()),
            results: results.len(),
            failures: results.failures().len(),
        })
    }

    /// Delete the three checkpoints. Returns how many existed.
    pub fn clear_checkpoints(&self) -> Result<usize, Error> {
        let mut removed = 0;
        for path in [&self.paths.catalog, &self.paths.queue, &self.paths.results] {
            if checkpoint::remove_if_exists(path)? {
                debug!("Removed {}", path.display());
                removed += 1;
            }
        }
        Ok(removed)
    }
}

struct MatchState {
    queue: PairQueue,
    results: ResultStore,
}

struct MatchJob<'a> {
    catalog: &'a ItemCatalog,
    backend: &'a dyn MatcherBackend,
    ratio: f64,
    paths: &'a CheckpointPaths,
}

impl MatchJob<'_> {
    fn item(&self, task: &ComparisonTask, id: &str) -> Result<&ItemRecord, Error> {
        self.catalog.get(id).ok_or_else(|| Error::Comparison {
            left: task.left_id.clone(),
            right: task.right_id.clone(),
            reason: format!("{} is not in the catalog", id),
        })
    }
}

impl Job for MatchJob<'_> {
    type Task = ComparisonTask;
    type Output = ComparisonResult;
    type State = MatchState;

    fn execute(&self, task: &ComparisonTask) -> Result<ComparisonResult, Error> {
        let left = self.item(task, &task.left_id)?;
        let right = self.item(task, &task.right_id)?;
        let candidates = self.backend.knn_match(left, right)?;
        let score = score_matches(&candidates, self.ratio);
        Ok(ComparisonResult {
            left_id: left.id.clone(),
            right_id: right.id.clone(),
            left_size: left.byte_size,
            right_size: right.byte_size,
            match_count: score.match_count,
            similarity: score.similarity,
        })
    }

    fn record(
        &self,
        state: &mut MatchState,
        task: &ComparisonTask,
        outcome: Result<ComparisonResult, Error>,
    ) -> TaskOutcome {
        state.queue.remove(task);
        let outcome = match outcome {
            Ok(result) => {
                state.results.append(result);
                TaskOutcome::Done
            }
            Err(err) => {
                warn!("{}", err);
                state.results.record_failure(FailedComparison {
                    sequence_number: task.sequence_number,
                    left_id: task.left_id.clone(),
                    right_id: task.right_id.clone(),
                    reason: err.to_string(),
                });
                TaskOutcome::Failed
            }
        };
        self.backend.pair_finished(&task.left_id, &task.right_id);
        outcome
    }

    fn checkpoint(&self, state: &MatchState) -> Result<(), Error> {
        state.results.save_checkpoint(&self.paths.results)?;
        state.queue.save(&self.paths.queue)
    }
}
