use crate::error::Error;
use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::thread;

/// Cores left free for the rest of the machine when no worker count is configured.
const RESERVED_CORES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Cpu,
    Accelerator,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub root: String,
    pub image_dirs: Vec<String>,
    pub albums_dir: String,
    pub extensions: Vec<String>,
    pub ignore_patterns: Vec<String>,
    pub meta_dir: String,
    pub cache_dir: String,
    pub output_dir: String,
    pub output_basename: String,
    pub workers: usize,
    pub checkpoint_thresholds: Vec<u8>,
    pub backend: BackendKind,
    pub device: String,
    pub device_memory_mb: u64,
    pub ratio_threshold: f64,
    pub search_checks: usize,
    pub retry_failed: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            root: ".".to_string(),
            image_dirs: vec!["Images".to_string()],
            albums_dir: "Albums".to_string(),
            extensions: ["jpeg", "jpg", "png", "bmp", "gif"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ignore_patterns: Vec::new(),
            meta_dir: "meta".to_string(),
            cache_dir: ".cache".to_string(),
            output_dir: "meta".to_string(),
            output_basename: "similarities".to_string(),
            workers: default_workers(),
            checkpoint_thresholds: vec![25, 50, 75, 100],
            backend: BackendKind::Cpu,
            device: "host-arena".to_string(),
            device_memory_mb: 1024,
            ratio_threshold: 0.7,
            search_checks: 50,
            retry_failed: false,
        }
    }
}

/// Load `Config.toml` (optional) layered with `SIMPAIR_*` environment variables.
pub fn load_configuration() -> Result<AppConfig, ConfigError> {
    let builder = Config::builder()
        .add_source(ConfigFile::with_name("Config").required(false))
        .add_source(
            Environment::with_prefix("SIMPAIR")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("extensions")
                .with_list_parse_key("image_dirs")
                .with_list_parse_key("ignore_patterns")
                .with_list_parse_key("checkpoint_thresholds"),
        )
        .build()?;
    builder.try_deserialize::<AppConfig>()
}

pub fn available_parallelism() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_workers() -> usize {
    available_parallelism().saturating_sub(RESERVED_CORES).max(1)
}

impl AppConfig {
    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.root = root.into();
        self
    }

    pub fn root_path(&self) -> PathBuf {
        PathBuf::from(&self.root)
    }

    pub fn meta_path(&self) -> PathBuf {
        self.root_path().join(&self.meta_dir)
    }

    pub fn cache_path(&self) -> PathBuf {
        self.meta_path().join(&self.cache_dir)
    }

    pub fn output_path(&self) -> PathBuf {
        self.root_path().join(&self.output_dir)
    }

    /// Check every setting that must be right before any file is touched.
    pub fn validate(&self) -> Result<(), Error> {
        let host = available_parallelism();
        if self.workers == 0 {
            return Err(Error::Configuration(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.workers > host {
            return Err(Error::Configuration(format!(
                "workers ({}) exceeds available parallelism ({}); reduce it",
                self.workers, host
            )));
        }
        if self.checkpoint_thresholds.iter().any(|&t| t == 0 || t > 100) {
            return Err(Error::Configuration(format!(
                "checkpoint thresholds must be within 1..=100, got {:?}",
                self.checkpoint_thresholds
            )));
        }
        if !(self.ratio_threshold > 0.0 && self.ratio_threshold <= 1.0) {
            return Err(Error::Configuration(format!(
                "ratio_threshold must be within (0, 1], got {}",
                self.ratio_threshold
            )));
        }
        if self.search_checks == 0 {
            return Err(Error::Configuration(
                "search_checks must be at least 1".to_string(),
            ));
        }
        if self.extensions.is_empty() {
            return Err(Error::Configuration(
                "at least one image extension is required".to_string(),
            ));
        }
        Ok(())
    }
}
