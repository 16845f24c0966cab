use crate::checkpoint::{self, CheckpointKind};
use crate::error::Error;
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// One unordered pair of items to compare, referring to the items by id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComparisonTask {
    pub sequence_number: u64,
    pub left_id: String,
    pub right_id: String,
}

impl ComparisonTask {
    pub fn new(sequence_number: u64, left_id: impl Into<String>, right_id: impl Into<String>) -> Self {
        Self {
            sequence_number,
            left_id: left_id.into(),
            right_id: right_id.into(),
        }
    }
}

/// Number of unordered pairs over `n` items.
pub fn pair_count(n: usize) -> u64 {
    let n = n as u64;
    n * n.saturating_sub(1) / 2
}

/// The remaining-set: comparison tasks not yet in a terminal state, keyed by
/// `(left_id, right_id)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PairQueue {
    tasks: BTreeMap<(String, String), u64>,
}

#[derive(Serialize, Deserialize)]
struct QueueSnapshot {
    tasks: Vec<ComparisonTask>,
}

impl PairQueue {
    /// One task per `i < j` over `ordered_ids`, numbered from 0 in generation
    /// order. The caller supplies the catalog's stable ordering so regenerating
    /// after a crash yields the same set.
    pub fn generate(ordered_ids: &[&str]) -> Self {
        let mut tasks = BTreeMap::new();
        let mut sequence = 0u64;
        for (i, left) in ordered_ids.iter().enumerate() {
            for right in &ordered_ids[i + 1..] {
                tasks.insert((left.to_string(), right.to_string()), sequence);
                sequence += 1;
            }
        }
        Self { tasks }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn contains(&self, left_id: &str, right_id: &str) -> bool {
        self.tasks
            .contains_key(&(left_id.to_string(), right_id.to_string()))
    }

    /// Remove a task by pair equality; its sequence number is not consulted.
    pub fn remove(&mut self, task: &ComparisonTask) -> bool {
        self.remove_pair(&task.left_id, &task.right_id).is_some()
    }

    pub fn remove_pair(&mut self, left_id: &str, right_id: &str) -> Option<ComparisonTask> {
        let key = (left_id.to_string(), right_id.to_string());
        self.tasks
            .remove(&key)
            .map(|sequence_number| ComparisonTask::new(sequence_number, key.0, key.1))
    }

    /// Put a task back, e.g. a failed comparison being retried.
    pub fn insert(&mut self, task: ComparisonTask) {
        self.tasks
            .insert((task.left_id, task.right_id), task.sequence_number);
    }

    /// Drop every task for which `keep` returns false. Returns the number dropped.
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&str, &str) -> bool,
    {
        let before = self.tasks.len();
        self.tasks.retain(|(left, right), _| keep(left, right));
        before - self.tasks.len()
    }

    /// Tasks ordered by sequence number.
    pub fn tasks(&self) -> Vec<ComparisonTask> {
        let mut tasks: Vec<ComparisonTask> = self
            .tasks
            .iter()
            .map(|((left, right), &seq)| ComparisonTask::new(seq, left.as_str(), right.as_str()))
            .collect();
        tasks.sort_by_key(|task| task.sequence_number);
        tasks
    }

    /// How many remaining tasks each item takes part in.
    pub fn pending_per_item(&self) -> AHashMap<String, usize> {
        let mut counts: AHashMap<String, usize> = AHashMap::new();
        for (left, right) in self.tasks.keys() {
            *counts.entry(left.clone()).or_default() += 1;
            *counts.entry(right.clone()).or_default() += 1;
        }
        counts
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let snapshot = QueueSnapshot { tasks: self.tasks() };
        checkpoint::write_binary(path, CheckpointKind::Queue, &snapshot)
    }

    /// Load the queue checkpoint verbatim, or `None` when there is none.
    pub fn load(path: &Path) -> Result<Option<Self>, Error> {
        let snapshot: Option<QueueSnapshot> = checkpoint::read_binary(path, CheckpointKind::Queue)?;
        Ok(snapshot.map(|snapshot| {
            let mut queue = PairQueue::default();
            for task in snapshot.tasks {
                queue.insert(task);
            }
            queue
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_generate_three_items() {
        let queue = PairQueue::generate(&["A", "B", "C"]);
        let tasks = queue.tasks();
        assert_eq!(
            tasks,
            vec![
                ComparisonTask::new(0, "A", "B"),
                ComparisonTask::new(1, "A", "C"),
                ComparisonTask::new(2, "B", "C"),
            ]
        );
    }

    #[test]
    fn test_generate_counts_every_pair_once() {
        for n in 0..12usize {
            let ids: Vec<String> = (0..n).map(|i| format!("img{:02}", i)).collect();
            let refs: Vec<&str> = ids.iter().map(|s| s.as_str()).collect();
            let queue = PairQueue::generate(&refs);
            assert_eq!(queue.len() as u64, pair_count(n));

            let seqs: Vec<u64> = queue.tasks().iter().map(|t| t.sequence_number).collect();
            let expected: Vec<u64> = (0..pair_count(n)).collect();
            assert_eq!(seqs, expected);
        }
    }

    #[test]
    fn test_excluding_one_item_removes_its_pairs() {
        let all = ["a", "b", "c", "d", "e", "f"];
        let without_c: Vec<&str> = all.iter().copied().filter(|id| *id != "c").collect();
        let full = PairQueue::generate(&all);
        let reduced = PairQueue::generate(&without_c);
        assert_eq!(full.len() - reduced.len(), all.len() - 1);
        assert!(reduced
            .tasks()
            .iter()
            .all(|t| t.left_id != "c" && t.right_id != "c"));
    }

    #[test]
    fn test_remove_matches_on_pair_not_sequence() {
        let mut queue = PairQueue::generate(&["A", "B", "C"]);
        assert!(queue.remove(&ComparisonTask::new(999, "A", "C")));
        assert!(!queue.remove(&ComparisonTask::new(1, "A", "C")));
        assert_eq!(queue.len(), 2);
        assert!(!queue.contains("A", "C"));
    }

    #[test]
    fn test_pending_per_item() {
        let mut queue = PairQueue::generate(&["A", "B", "C"]);
        queue.remove_pair("A", "B");
        let counts = queue.pending_per_item();
        assert_eq!(counts["A"], 1);
        assert_eq!(counts["B"], 1);
        assert_eq!(counts["C"], 2);
    }

    #[test]
    fn test_saved_queue_loads_with_removals_applied() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("queue.bin");
        let mut queue = PairQueue::generate(&["A", "B", "C", "D"]);
        queue.remove_pair("A", "B");
        queue.remove_pair("B", "D");
        queue.save(&path).unwrap();

        let loaded = PairQueue::load(&path).unwrap().unwrap();
        assert_eq!(loaded, queue);
        assert_eq!(loaded.len(), 4);
        assert_eq!(loaded.tasks()[0], ComparisonTask::new(1, "A", "C"));
    }
}
