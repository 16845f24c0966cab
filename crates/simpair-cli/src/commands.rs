use clap::{Parser, Subcommand, ValueEnum};
use simpair_core::BackendKind;

#[derive(Debug, Parser)]
#[command(name = "simpair")]
#[command(about = "Resumable pairwise image similarity", long_about = None)]
pub struct Cli {
    /// Collection root (overrides `root` from Config.toml)
    #[arg(long, global = true)]
    pub root: Option<String>,

    /// Worker pool size, at most the host's available parallelism
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    #[arg(long, global = true, value_enum)]
    pub backend: Option<BackendArg>,

    /// Stop dispatching new work after this many seconds; progress is checkpointed
    #[arg(long, global = true)]
    pub budget_secs: Option<u64>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Scan, extract descriptors, compare every pair and export
    Run,
    /// Scan and extract descriptors only
    Extract,
    /// Compare pairs of an already extracted catalog
    Compare,
    /// Rewrite the similarity exports from the result checkpoint
    Export,
    /// Show what the checkpoints hold
    Status,
    /// Print configuration values
    PrintConfig,
    /// Delete all checkpoints
    ClearCache,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum BackendArg {
    Cpu,
    Accelerator,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Cpu => BackendKind::Cpu,
            BackendArg::Accelerator => BackendKind::Accelerator,
        }
    }
}
