pub mod accelerator;
mod kdtree;

pub use accelerator::{AcceleratorBackend, ComputeDevice, HostArenaDevice};
pub use kdtree::{CpuBackend, KdTree};

use crate::catalog::{ItemCatalog, ItemRecord};
use crate::config::{AppConfig, BackendKind};
use crate::error::Error;
use crate::extract::Descriptor;
use crate::queue::PairQueue;
use tracing::{info, warn};

/// Distances from one query row to its nearest and second-nearest rows on the
/// other side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KnnPair {
    pub best: f32,
    pub second: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchScore {
    pub match_count: u32,
    pub similarity: f64,
}

/// Ratio test over the candidate list: a candidate is a good match when its
/// best distance is below `ratio` times its second-best distance.
/// `similarity = good / candidates`, and exactly 0 when there are no candidates.
pub fn score_matches(candidates: &[KnnPair], ratio: f64) -> MatchScore {
    if candidates.is_empty() {
        return MatchScore {
            match_count: 0,
            similarity: 0.0,
        };
    }
    let good = candidates
        .iter()
        .filter(|pair| (pair.best as f64) < ratio * pair.second as f64)
        .count();
    MatchScore {
        match_count: good as u32,
        similarity: good as f64 / candidates.len() as f64,
    }
}

/// A k=2 nearest-neighbour matcher between two items' descriptors.
pub trait MatcherBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Called once before matching starts, with the tasks still to run.
    fn prepare(&self, _catalog: &ItemCatalog, _queue: &PairQueue) -> Result<(), Error> {
        Ok(())
    }

    fn knn_match(&self, left: &ItemRecord, right: &ItemRecord) -> Result<Vec<KnnPair>, Error>;

    /// A pair involving these items reached a terminal state.
    fn pair_finished(&self, _left_id: &str, _right_id: &str) {}

    fn release_all(&self) {}
}

pub(crate) fn descriptors<'a>(
    left: &'a ItemRecord,
    right: &'a ItemRecord,
) -> Result<(&'a Descriptor, &'a Descriptor), Error> {
    let missing = |item: &ItemRecord| Error::Comparison {
        left: left.id.clone(),
        right: right.id.clone(),
        reason: format!("{} has no descriptor", item.id),
    };
    let l = left.descriptor.as_ref().ok_or_else(|| missing(left))?;
    let r = right.descriptor.as_ref().ok_or_else(|| missing(right))?;
    if !l.is_empty() && !r.is_empty() && l.dims() != r.dims() {
        return Err(Error::Comparison {
            left: left.id.clone(),
            right: right.id.clone(),
            reason: format!("descriptor widths differ ({} vs {})", l.dims(), r.dims()),
        });
    }
    Ok((l, r))
}

/// Pick the configured backend, falling back to the CPU matcher when the
/// accelerator cannot be opened.
pub fn select_backend(config: &AppConfig) -> Box<dyn MatcherBackend> {
    match config.backend {
        BackendKind::Cpu => Box::new(CpuBackend::new(config.search_checks)),
        BackendKind::Accelerator => {
            let capacity = config.device_memory_mb.saturating_mul(1024 * 1024);
            match AcceleratorBackend::open(&config.device, capacity) {
                Ok(backend) => {
                    info!("Using accelerator device '{}'", config.device);
                    Box::new(backend)
                }
                Err(err) => {
                    warn!("{}; falling back to the CPU matcher", err);
                    Box::new(CpuBackend::new(config.search_checks))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(best: f32, second: f32) -> KnnPair {
        KnnPair { best, second }
    }

    #[test]
    fn test_empty_candidates_score_zero() {
        let score = score_matches(&[], 0.7);
        assert_eq!(score.match_count, 0);
        assert_eq!(score.similarity, 0.0);
    }

    #[test]
    fn test_ratio_test_counts_good_matches() {
        let candidates = [pair(1.0, 2.0), pair(0.69, 1.0), pair(0.7, 1.0), pair(0.0, 0.0)];
        let score = score_matches(&candidates, 0.7);
        assert_eq!(score.match_count, 2);
        assert_eq!(score.similarity, 0.5);
    }

    #[test]
    fn test_similarity_stays_in_unit_interval() {
        let candidates: Vec<KnnPair> = (0..50).map(|i| pair(i as f32 * 0.1, 2.0)).collect();
        let score = score_matches(&candidates, 0.7);
        assert!(score.similarity >= 0.0 && score.similarity <= 1.0);
    }

    #[test]
    fn test_unknown_device_falls_back_to_cpu() {
        let config = AppConfig {
            backend: BackendKind::Accelerator,
            device: "no-such-gpu".to_string(),
            ..AppConfig::default()
        };
        assert_eq!(select_backend(&config).name(), "cpu-kdtree");
    }

    #[test]
    fn test_huge_memory_budget_does_not_overflow() {
        let config = AppConfig {
            backend: BackendKind::Accelerator,
            device_memory_mb: u64::MAX,
            ..AppConfig::default()
        };
        assert_eq!(select_backend(&config).name(), "accelerator:host-arena");
    }

    #[test]
    fn test_known_device_is_selected() {
        let config = AppConfig {
            backend: BackendKind::Accelerator,
            ..AppConfig::default()
        };
        assert_eq!(select_backend(&config).name(), "accelerator:host-arena");
    }
}
