mod gradient;

pub use gradient::GradientGridExtractor;

use crate::catalog::ItemCatalog;
use crate::checkpoint::{self, CheckpointKind};
use crate::error::Error;
use crate::runner::{Job, TaskOutcome};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error as ThisError;
use tracing::{trace, warn};

/// Fixed-width feature rows for one image, stored row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    dims: usize,
    values: Vec<f32>,
}

impl Descriptor {
    pub fn new(dims: usize, values: Vec<f32>) -> Result<Self, Error> {
        if dims == 0 || values.len() % dims != 0 {
            return Err(Error::Serialization(format!(
                "descriptor of {} values does not split into rows of {}",
                values.len(),
                dims
            )));
        }
        Ok(Self { dims, values })
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn rows(&self) -> usize {
        self.values.len() / self.dims
    }

    pub fn row(&self, index: usize) -> &[f32] {
        &self.values[index * self.dims..(index + 1) * self.dims]
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn byte_len(&self) -> usize {
        self.values.len() * std::mem::size_of::<f32>()
    }
}

/// The item's bytes could not be turned into a descriptor.
#[derive(Debug, ThisError)]
#[error("{0}")]
pub struct Unreadable(pub String);

/// Turns raw image bytes into a descriptor. Implementations must be
/// deterministic and always emit rows of the same width.
pub trait FeatureExtractor: Send + Sync {
    fn name(&self) -> &str;
    fn extract(&self, bytes: &[u8]) -> Result<Descriptor, Unreadable>;
}

pub struct ExtractionTask {
    pub index: usize,
    pub id: String,
}

/// Runner job computing one descriptor per task. Unreadable items are
/// quarantined; the catalog checkpoint is rewritten at each threshold.
pub struct ExtractionJob<'a> {
    root: PathBuf,
    extractor: &'a dyn FeatureExtractor,
    checkpoint_path: PathBuf,
}

impl<'a> ExtractionJob<'a> {
    pub fn new(root: &Path, extractor: &'a dyn FeatureExtractor, checkpoint_path: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            extractor,
            checkpoint_path: checkpoint_path.to_path_buf(),
        }
    }

    pub fn tasks(catalog: &ItemCatalog) -> Vec<ExtractionTask> {
        catalog
            .pending_extraction()
            .into_iter()
            .map(|index| ExtractionTask {
                index,
                id: catalog.items()[index].id.clone(),
            })
            .collect()
    }
}

impl Job for ExtractionJob<'_> {
    type Task = ExtractionTask;
    type Output = Descriptor;
    type State = ItemCatalog;

    fn execute(&self, task: &ExtractionTask) -> Result<Descriptor, Error> {
        let path = self.root.join(&task.id);
        let bytes = fs::read(&path).map_err(|err| Error::UnreadableItem {
            id: task.id.clone(),
            reason: err.to_string(),
        })?;
        self.extractor
            .extract(&bytes)
            .map_err(|Unreadable(reason)| Error::UnreadableItem {
                id: task.id.clone(),
                reason,
            })
    }

    fn record(
        &self,
        catalog: &mut ItemCatalog,
        task: &ExtractionTask,
        outcome: Result<Descriptor, Error>,
    ) -> TaskOutcome {
        match outcome {
            Ok(descriptor) => {
                trace!("Extracted {} rows for {}", descriptor.rows(), task.id);
                catalog.set_descriptor(task.index, descriptor);
                TaskOutcome::Done
            }
            Err(err) => {
                warn!("Could not read image {}: {}", task.id, err);
                catalog.quarantine(task.index, err.to_string());
                TaskOutcome::Failed
            }
        }
    }

    fn checkpoint(&self, catalog: &ItemCatalog) -> Result<(), Error> {
        checkpoint::write_binary(&self.checkpoint_path, CheckpointKind::Catalog, catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_rows() {
        let d = Descriptor::new(3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(d.rows(), 2);
        assert_eq!(d.row(1), &[4.0, 5.0, 6.0]);
        assert_eq!(d.byte_len(), 24);
    }

    #[test]
    fn test_descriptor_rejects_ragged_rows() {
        assert!(Descriptor::new(4, vec![1.0; 6]).is_err());
        assert!(Descriptor::new(0, vec![]).is_err());
    }

    #[test]
    fn test_empty_descriptor_is_valid() {
        let d = Descriptor::new(128, Vec::new()).unwrap();
        assert!(d.is_empty());
        assert_eq!(d.rows(), 0);
    }
}
