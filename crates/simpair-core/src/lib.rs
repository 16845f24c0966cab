pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod extract;
pub mod matcher;
pub mod progress;
pub mod queue;
pub mod runner;
pub mod store;

pub use catalog::{ItemCatalog, ItemRecord};
pub use config::{AppConfig, BackendKind};
pub use engine::{CheckpointStatus, ComparisonSummary, Engine, ExportSummary, ExtractionSummary, RunSummary};
pub use error::Error;
pub use extract::{Descriptor, FeatureExtractor, GradientGridExtractor, Unreadable};
pub use matcher::MatcherBackend;
pub use progress::{ProgressReporter, SilentReporter};
pub use queue::{ComparisonTask, PairQueue};
pub use runner::StopHandle;
pub use store::{ComparisonResult, ResultStore};
