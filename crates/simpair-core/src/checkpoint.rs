use crate::config::AppConfig;
use crate::error::Error;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::hash::Hasher as _;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tracing::debug;
use twox_hash::XxHash64;

const MAGIC: [u8; 8] = *b"SIMPAIR\0";
pub const FORMAT_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointKind {
    Catalog,
    Queue,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    magic: [u8; 8],
    kind: CheckpointKind,
    version: u16,
    saved_at: String,
    checksum: u64,
    payload: Vec<u8>,
}

/// Locations of the persisted state under the metadata directory.
#[derive(Debug, Clone)]
pub struct CheckpointPaths {
    pub catalog: PathBuf,
    pub queue: PathBuf,
    pub results: PathBuf,
    pub export_csv: PathBuf,
    pub export_json: PathBuf,
}

impl CheckpointPaths {
    pub fn new(config: &AppConfig) -> Self {
        let cache = config.cache_path();
        let output = config.output_path();
        Self {
            catalog: cache.join("catalog.bin"),
            queue: cache.join("queue.bin"),
            results: cache.join("results.json"),
            export_csv: output.join(format!("{}.csv", config.output_basename)),
            export_json: output.join(format!("{}.json", config.output_basename)),
        }
    }
}

pub fn checksum(bytes: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(bytes);
    hasher.finish()
}

/// Replace `path` as a whole: write a sibling temp file, then rename over it.
/// A crash mid-write leaves the previous file intact.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, bytes).map_err(|err| {
        io::Error::new(err.kind(), format!("Error writing {}: {}", tmp.display(), err))
    })?;
    fs::rename(&tmp, path).map_err(|err| {
        io::Error::new(err.kind(), format!("Error replacing {}: {}", path.display(), err))
    })?;
    Ok(())
}

/// Read a whole file, mapping "not found" to `None`.
pub fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>, Error> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(Error::Io(io::Error::new(
            err.kind(),
            format!("Error reading {}: {}", path.display(), err),
        ))),
    }
}

pub fn write_binary<T: Serialize>(path: &Path, kind: CheckpointKind, value: &T) -> Result<(), Error> {
    let payload = bincode::serialize(value)?;
    let envelope = Envelope {
        magic: MAGIC,
        kind,
        version: FORMAT_VERSION,
        saved_at: Utc::now().to_rfc3339(),
        checksum: checksum(&payload),
        payload,
    };
    write_atomic(path, &bincode::serialize(&envelope)?)?;
    debug!("Saved {:?} checkpoint to {}", kind, path.display());
    Ok(())
}

pub fn read_binary<T: DeserializeOwned>(path: &Path, kind: CheckpointKind) -> Result<Option<T>, Error> {
    let bytes = match read_if_exists(path)? {
        Some(bytes) => bytes,
        None => return Ok(None),
    };

    let envelope: Envelope = bincode::deserialize(&bytes).map_err(|e| {
        Error::Checkpoint(format!("{} is not a checkpoint: {}", path.display(), e))
    })?;
    if envelope.magic != MAGIC {
        return Err(Error::Checkpoint(format!("{} has a foreign header", path.display())));
    }
    if envelope.kind != kind {
        return Err(Error::Checkpoint(format!(
            "{} holds a {:?} checkpoint, expected {:?}",
            path.display(),
            envelope.kind,
            kind
        )));
    }
    if envelope.version != FORMAT_VERSION {
        return Err(Error::Checkpoint(format!(
            "{} uses format version {}, this build reads version {}",
            path.display(),
            envelope.version,
            FORMAT_VERSION
        )));
    }
    if checksum(&envelope.payload) != envelope.checksum {
        return Err(Error::Checkpoint(format!("{} failed its checksum", path.display())));
    }

    debug!("Loaded {:?} checkpoint saved at {}", kind, envelope.saved_at);
    let value = bincode::deserialize(&envelope.payload)?;
    Ok(Some(value))
}

pub fn remove_if_exists(path: &Path) -> Result<bool, Error> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}
