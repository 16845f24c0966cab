#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use simpair_core::catalog::ItemRecord;
use simpair_core::matcher::{CpuBackend, KnnPair, MatcherBackend};
use simpair_core::{AppConfig, Descriptor, Error, FeatureExtractor, StopHandle, Unreadable};

pub const A: &str = "Images/a.png";
pub const B: &str = "Images/b.png";
pub const C: &str = "Images/c.png";

/// Reads the file as rows of 4 bytes. Files starting with `BAD` are unreadable.
pub struct ByteRowExtractor;

impl FeatureExtractor for ByteRowExtractor {
    fn name(&self) -> &str {
        "byte-rows"
    }

    fn extract(&self, bytes: &[u8]) -> Result<Descriptor, Unreadable> {
        if bytes.starts_with(b"BAD") {
            return Err(Unreadable("corrupt header".to_string()));
        }
        let values = bytes.chunks_exact(4).flatten().map(|&b| b as f32).collect();
        Descriptor::new(4, values).map_err(|e| Unreadable(e.to_string()))
    }
}

pub fn noise(seed: u32, len: usize) -> Vec<u8> {
    let mut state = seed;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 24) as u8
        })
        .collect()
}

/// root/Images/{a,b,c}.png with byte-row content. `b` can be made unreadable.
pub fn write_abc(root: &Path, b_unreadable: bool) {
    let images = root.join("Images");
    fs::create_dir_all(&images).unwrap();
    fs::write(images.join("a.png"), noise(1, 64)).unwrap();
    let mut b = noise(2, 64);
    if b_unreadable {
        b[..3].copy_from_slice(b"BAD");
    }
    fs::write(images.join("b.png"), b).unwrap();
    // c shares half of a's rows
    let mut c = noise(1, 32);
    c.extend(noise(3, 32));
    fs::write(images.join("c.png"), c).unwrap();
}

pub fn config_for(root: &Path) -> AppConfig {
    AppConfig {
        root: root.to_string_lossy().into_owned(),
        workers: 1,
        ..AppConfig::default()
    }
}

/// CPU matcher that raises the drain flag once it has served `limit` pairs.
pub struct StopAfter {
    inner: CpuBackend,
    stop: StopHandle,
    served: AtomicUsize,
    limit: usize,
}

impl StopAfter {
    pub fn new(stop: StopHandle, limit: usize) -> Self {
        Self {
            inner: CpuBackend::new(50),
            stop,
            served: AtomicUsize::new(0),
            limit,
        }
    }
}

impl MatcherBackend for StopAfter {
    fn name(&self) -> &str {
        "stop-after"
    }

    fn knn_match(&self, left: &ItemRecord, right: &ItemRecord) -> Result<Vec<KnnPair>, Error> {
        let matches = self.inner.knn_match(left, right);
        if self.served.fetch_add(1, Ordering::SeqCst) + 1 == self.limit {
            self.stop.request_stop();
        }
        matches
    }
}

/// CPU matcher that fails one specific pair.
pub struct FailPair {
    inner: CpuBackend,
    left: String,
    right: String,
}

impl FailPair {
    pub fn new(left: &str, right: &str) -> Self {
        Self {
            inner: CpuBackend::new(50),
            left: left.to_string(),
            right: right.to_string(),
        }
    }
}

impl MatcherBackend for FailPair {
    fn name(&self) -> &str {
        "fail-pair"
    }

    fn knn_match(&self, left: &ItemRecord, right: &ItemRecord) -> Result<Vec<KnnPair>, Error> {
        if left.id == self.left && right.id == self.right {
            return Err(Error::Comparison {
                left: left.id.clone(),
                right: right.id.clone(),
                reason: "matcher crashed".to_string(),
            });
        }
        self.inner.knn_match(left, right)
    }
}
