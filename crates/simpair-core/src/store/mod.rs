mod export;

use crate::checkpoint::{self, read_if_exists, write_atomic};
use crate::error::Error;
use ahash::AHashSet;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::Path;
use tracing::{debug, warn};

pub const RESULTS_FORMAT_VERSION: u16 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub left_id: String,
    pub right_id: String,
    pub left_size: u64,
    pub right_size: u64,
    pub match_count: u32,
    pub similarity: f64,
}

/// A comparison that raised instead of producing a score. It is out of the
/// remaining-set but has no result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedComparison {
    pub sequence_number: u64,
    pub left_id: String,
    pub right_id: String,
    pub reason: String,
}

#[derive(Serialize)]
struct ResultsFileOut<'a> {
    format_version: u16,
    saved_at: String,
    results: &'a [ComparisonResult],
    failures: &'a [FailedComparison],
}

#[derive(Deserialize)]
struct ResultsFileIn {
    format_version: u16,
    #[serde(default)]
    saved_at: String,
    results: Vec<ComparisonResult>,
    #[serde(default)]
    failures: Vec<FailedComparison>,
}

/// Append-only accumulator of comparison outcomes. Each unordered pair is
/// recorded at most once, either as a result or as a failure.
#[derive(Debug, Default)]
pub struct ResultStore {
    results: Vec<ComparisonResult>,
    failures: Vec<FailedComparison>,
    seen: AHashSet<(String, String)>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` (and keeps the earlier entry) when the pair is already recorded.
    pub fn append(&mut self, result: ComparisonResult) -> bool {
        if !self.seen.insert((result.left_id.clone(), result.right_id.clone())) {
            debug!("Ignoring repeated result for {} / {}", result.left_id, result.right_id);
            return false;
        }
        self.results.push(result);
        true
    }

    pub fn record_failure(&mut self, failure: FailedComparison) -> bool {
        if !self.seen.insert((failure.left_id.clone(), failure.right_id.clone())) {
            return false;
        }
        self.failures.push(failure);
        true
    }

    /// True when the pair has a result or a recorded failure.
    pub fn contains_pair(&self, left_id: &str, right_id: &str) -> bool {
        self.seen.contains(&(left_id.to_string(), right_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn results(&self) -> &[ComparisonResult] {
        &self.results
    }

    pub fn failures(&self) -> &[FailedComparison] {
        &self.failures
    }

    /// Remove and return every recorded failure so the pairs can be queued again.
    pub fn take_failures(&mut self) -> Vec<FailedComparison> {
        let failures = std::mem::take(&mut self.failures);
        for failure in &failures {
            self.seen
                .remove(&(failure.left_id.clone(), failure.right_id.clone()));
        }
        failures
    }

    /// Results by similarity, highest first; ties ordered by `(left_id, right_id)`.
    pub fn sorted(&self) -> Vec<&ComparisonResult> {
        let mut sorted: Vec<&ComparisonResult> = self.results.iter().collect();
        sorted.sort_by(|a, b| by_similarity(a, b));
        sorted
    }

    pub fn save_checkpoint(&self, path: &Path) -> Result<(), Error> {
        let file = ResultsFileOut {
            format_version: RESULTS_FORMAT_VERSION,
            saved_at: Utc::now().to_rfc3339(),
            results: &self.results,
            failures: &self.failures,
        };
        write_atomic(path, &serde_json::to_vec(&file)?)?;
        debug!(
            "Saved {} results and {} failures to {}",
            self.results.len(),
            self.failures.len(),
            path.display()
        );
        Ok(())
    }

    /// Load the result checkpoint, or an empty store when there is none.
    pub fn load_checkpoint(path: &Path) -> Result<Self, Error> {
        let bytes = match read_if_exists(path)? {
            Some(bytes) => bytes,
            None => return Ok(Self::new()),
        };
        let file: ResultsFileIn = serde_json::from_slice(&bytes).map_err(|e| {
            Error::Checkpoint(format!("{} is not a result checkpoint: {}", path.display(), e))
        })?;
        if file.format_version != RESULTS_FORMAT_VERSION {
            return Err(Error::Checkpoint(format!(
                "{} uses format version {}, this build reads version {}",
                path.display(),
                file.format_version,
                RESULTS_FORMAT_VERSION
            )));
        }

        let mut store = Self::new();
        let mut repeated = 0usize;
        for result in file.results {
            if !store.append(result) {
                repeated += 1;
            }
        }
        for failure in file.failures {
            if !store.record_failure(failure) {
                repeated += 1;
            }
        }
        if repeated > 0 {
            warn!("{} held {} repeated pairs; kept the first of each", path.display(), repeated);
        }
        debug!(
            "Loaded {} results saved at {}",
            store.len(),
            file.saved_at
        );
        Ok(store)
    }

    /// Write the sorted tabular export.
    pub fn export_csv(&self, path: &Path) -> Result<(), Error> {
        write_atomic(path, &export::to_csv(&self.sorted())?)
    }

    /// Write the structured export, keyed by a hash of the pair.
    pub fn export_json(&self, path: &Path) -> Result<(), Error> {
        write_atomic(path, &export::to_json(&self.sorted())?)
    }
}

fn by_similarity(a: &ComparisonResult, b: &ComparisonResult) -> Ordering {
    b.similarity
        .total_cmp(&a.similarity)
        .then_with(|| a.left_id.cmp(&b.left_id))
        .then_with(|| a.right_id.cmp(&b.right_id))
}

/// Opaque composite key of a pair in the structured export.
pub fn pair_key(left_id: &str, right_id: &str) -> String {
    let mut bytes = Vec::with_capacity(left_id.len() + right_id.len() + 1);
    bytes.extend_from_slice(left_id.as_bytes());
    bytes.push(0);
    bytes.extend_from_slice(right_id.as_bytes());
    format!("{:016x}", checkpoint::checksum(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn result(left: &str, right: &str, similarity: f64) -> ComparisonResult {
        ComparisonResult {
            left_id: left.to_string(),
            right_id: right.to_string(),
            left_size: 10,
            right_size: 20,
            match_count: (similarity * 100.0) as u32,
            similarity,
        }
    }

    fn failure(left: &str, right: &str) -> FailedComparison {
        FailedComparison {
            sequence_number: 4,
            left_id: left.to_string(),
            right_id: right.to_string(),
            reason: "no descriptor".to_string(),
        }
    }

    #[test]
    fn test_append_rejects_repeated_pair() {
        let mut store = ResultStore::new();
        assert!(store.append(result("a", "b", 0.5)));
        assert!(!store.append(result("a", "b", 0.9)));
        assert!(!store.record_failure(failure("a", "b")));
        assert_eq!(store.len(), 1);
        assert_eq!(store.results()[0].similarity, 0.5);
    }

    #[test]
    fn test_sorted_breaks_ties_by_pair() {
        let mut store = ResultStore::new();
        store.append(result("b", "c", 0.25));
        store.append(result("a", "c", 0.75));
        store.append(result("a", "b", 0.25));
        let order: Vec<(&str, &str)> = store
            .sorted()
            .iter()
            .map(|r| (r.left_id.as_str(), r.right_id.as_str()))
            .collect();
        assert_eq!(order, vec![("a", "c"), ("a", "b"), ("b", "c")]);
    }

    #[test]
    fn test_checkpoint_keeps_results_and_failures() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("results.json");
        let mut store = ResultStore::new();
        store.append(result("a", "b", 0.5));
        store.record_failure(failure("a", "c"));
        store.save_checkpoint(&path).unwrap();

        let loaded = ResultStore::load_checkpoint(&path).unwrap();
        assert_eq!(loaded.results(), store.results());
        assert_eq!(loaded.failures(), store.failures());
        assert!(loaded.contains_pair("a", "c"));
    }

    #[test]
    fn test_missing_checkpoint_is_empty() {
        let tmp = tempdir().unwrap();
        let store = ResultStore::load_checkpoint(&tmp.path().join("absent.json")).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("results.json");
        std::fs::write(&path, r#"{"format_version":9,"results":[]}"#).unwrap();
        assert!(matches!(
            ResultStore::load_checkpoint(&path),
            Err(Error::Checkpoint(_))
        ));
    }

    #[test]
    fn test_take_failures_frees_the_pairs() {
        let mut store = ResultStore::new();
        store.record_failure(failure("a", "c"));
        let taken = store.take_failures();
        assert_eq!(taken.len(), 1);
        assert!(store.failures().is_empty());
        assert!(!store.contains_pair("a", "c"));
        assert!(store.append(result("a", "c", 0.1)));
    }

    #[test]
    fn test_export_is_byte_identical_when_repeated() {
        let tmp = tempdir().unwrap();
        let csv_path = tmp.path().join("out/similarities.csv");
        let json_path = tmp.path().join("out/similarities.json");
        let mut store = ResultStore::new();
        store.append(result("b", "c", 0.5));
        store.append(result("a", "b", 0.5));
        store.append(result("a", "c", 1.0));

        store.export_csv(&csv_path).unwrap();
        store.export_json(&json_path).unwrap();
        let first = (std::fs::read(&csv_path).unwrap(), std::fs::read(&json_path).unwrap());
        store.export_csv(&csv_path).unwrap();
        store.export_json(&json_path).unwrap();
        let second = (std::fs::read(&csv_path).unwrap(), std::fs::read(&json_path).unwrap());
        assert_eq!(first, second);
    }

    #[test]
    fn test_reloaded_checkpoint_exports_identically() {
        let tmp = tempdir().unwrap();
        let checkpoint = tmp.path().join("results.json");
        let json_path = tmp.path().join("similarities.json");
        let csv_path = tmp.path().join("similarities.csv");
        let mut store = ResultStore::new();
        for (i, n) in (3..60u32).enumerate() {
            store.append(result(&format!("a{:03}", i), "z", 1.0 / n as f64));
        }
        store.append(result("b", "c", 1.0 / 11.0));
        store.export_json(&json_path).unwrap();
        store.export_csv(&csv_path).unwrap();
        let before = (std::fs::read(&json_path).unwrap(), std::fs::read(&csv_path).unwrap());

        store.save_checkpoint(&checkpoint).unwrap();
        let mut loaded = ResultStore::load_checkpoint(&checkpoint).unwrap();
        for (original, reloaded) in store.results().iter().zip(loaded.results()) {
            assert_eq!(original.similarity.to_bits(), reloaded.similarity.to_bits());
        }
        loaded.export_json(&json_path).unwrap();
        loaded.export_csv(&csv_path).unwrap();
        let after = (std::fs::read(&json_path).unwrap(), std::fs::read(&csv_path).unwrap());
        assert_eq!(before, after);

        // a fresh result equal to a reloaded one still ties on similarity
        loaded.append(result("a", "c", 1.0 / 11.0));
        let order: Vec<&str> = loaded
            .sorted()
            .iter()
            .filter(|r| r.right_id == "c")
            .map(|r| r.left_id.as_str())
            .collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn test_pair_key_depends_on_order() {
        assert_ne!(pair_key("a", "b"), pair_key("b", "a"));
        assert_ne!(pair_key("ab", "c"), pair_key("a", "bc"));
        assert_eq!(pair_key("a", "b").len(), 16);
    }
}
