use super::kdtree::insert_neighbour;
use super::{descriptors, KnnPair, MatcherBackend};
use crate::catalog::{ItemCatalog, ItemRecord};
use crate::error::Error;
use crate::extract::Descriptor;
use crate::queue::PairQueue;
use ahash::AHashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// A matching device with its own memory. Descriptors are uploaded once and
/// matched by handle.
pub trait ComputeDevice: Send + Sync {
    type Buffer: Send + Sync;

    fn name(&self) -> &str;
    fn capacity_bytes(&self) -> u64;
    fn upload(&self, descriptor: &Descriptor) -> Result<Self::Buffer, Error>;
    fn buffer_bytes(&self, buffer: &Self::Buffer) -> u64;
    /// Brute-force k=2 match of every query row against every train row.
    fn knn2(&self, query: &Self::Buffer, train: &Self::Buffer) -> Result<Vec<KnnPair>, Error>;
}

/// Descriptor packed for the host arena: contiguous rows plus their squared norms.
pub struct ArenaBuffer {
    dims: usize,
    rows: usize,
    values: Box<[f32]>,
    norms: Box<[f32]>,
}

/// In-process device: an arena of packed descriptors matched brute-force with
/// the `|q|^2 + |t|^2 - 2 q.t` expansion, the same contract as a device BF
/// matcher under the L2 norm.
pub struct HostArenaDevice {
    capacity_bytes: u64,
}

impl HostArenaDevice {
    pub const NAME: &'static str = "host-arena";

    pub fn new(capacity_bytes: u64) -> Self {
        Self { capacity_bytes }
    }
}

impl ComputeDevice for HostArenaDevice {
    type Buffer = ArenaBuffer;

    fn name(&self) -> &str {
        Self::NAME
    }

    fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    fn upload(&self, descriptor: &Descriptor) -> Result<ArenaBuffer, Error> {
        let dims = descriptor.dims();
        let norms = descriptor
            .values()
            .chunks(dims)
            .map(|row| row.iter().map(|v| v * v).sum())
            .collect();
        Ok(ArenaBuffer {
            dims,
            rows: descriptor.rows(),
            values: descriptor.values().into(),
            norms,
        })
    }

    fn buffer_bytes(&self, buffer: &ArenaBuffer) -> u64 {
        ((buffer.values.len() + buffer.norms.len()) * std::mem::size_of::<f32>()) as u64
    }

    fn knn2(&self, query: &ArenaBuffer, train: &ArenaBuffer) -> Result<Vec<KnnPair>, Error> {
        if train.rows < 2 || query.rows == 0 {
            return Ok(Vec::new());
        }
        let dims = query.dims;
        let mut out = Vec::with_capacity(query.rows);
        for q in 0..query.rows {
            let qrow = &query.values[q * dims..(q + 1) * dims];
            let mut found = [(f32::INFINITY, usize::MAX); 2];
            for t in 0..train.rows {
                let trow = &train.values[t * dims..(t + 1) * dims];
                let dot: f32 = qrow.iter().zip(trow).map(|(a, b)| a * b).sum();
                let dist = (query.norms[q] + train.norms[t] - 2.0 * dot).max(0.0);
                insert_neighbour(&mut found, dist, t);
            }
            out.push(KnnPair {
                best: found[0].0.sqrt(),
                second: found[1].0.sqrt(),
            });
        }
        Ok(out)
    }
}

struct Resident<B> {
    buffer: Arc<B>,
    pending: usize,
    bytes: u64,
}

struct Residency<B> {
    items: AHashMap<String, Resident<B>>,
    used_bytes: u64,
}

/// Matcher that stages each item's descriptor on the device once, before
/// matching, and frees it as soon as the item's last pending pair finishes.
pub struct AcceleratorBackend<D: ComputeDevice> {
    device: D,
    label: String,
    residency: Mutex<Residency<D::Buffer>>,
}

impl AcceleratorBackend<HostArenaDevice> {
    /// Open a device by name. Unknown names and zero capacity report the
    /// backend as unavailable.
    pub fn open(device: &str, capacity_bytes: u64) -> Result<Self, Error> {
        if device != HostArenaDevice::NAME {
            return Err(Error::BackendUnavailable(format!(
                "no compute device named '{}'",
                device
            )));
        }
        if capacity_bytes == 0 {
            return Err(Error::BackendUnavailable(format!(
                "device '{}' has no memory budget",
                device
            )));
        }
        Ok(Self::with_device(HostArenaDevice::new(capacity_bytes)))
    }
}

impl<D: ComputeDevice> AcceleratorBackend<D> {
    pub fn with_device(device: D) -> Self {
        let label = format!("accelerator:{}", device.name());
        Self {
            device,
            label,
            residency: Mutex::new(Residency {
                items: AHashMap::new(),
                used_bytes: 0,
            }),
        }
    }

    pub fn resident_items(&self) -> usize {
        self.lock().items.len()
    }

    pub fn resident_bytes(&self) -> u64 {
        self.lock().used_bytes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Residency<D::Buffer>> {
        self.residency.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn buffer(&self, id: &str) -> Option<Arc<D::Buffer>> {
        self.lock().items.get(id).map(|r| Arc::clone(&r.buffer))
    }

    fn finish_one(residency: &mut Residency<D::Buffer>, id: &str) {
        let release = match residency.items.get_mut(id) {
            Some(resident) => {
                resident.pending = resident.pending.saturating_sub(1);
                resident.pending == 0
            }
            None => false,
        };
        if release {
            if let Some(resident) = residency.items.remove(id) {
                residency.used_bytes -= resident.bytes;
                debug!("Released device buffer for {}", id);
            }
        }
    }
}

impl<D: ComputeDevice> MatcherBackend for AcceleratorBackend<D> {
    fn name(&self) -> &str {
        &self.label
    }

    /// Stage every item with at least one pending pair. Staging more than the
    /// device holds reports the backend unavailable (nothing stays staged).
    fn prepare(&self, catalog: &ItemCatalog, queue: &PairQueue) -> Result<(), Error> {
        self.release_all();
        let pending = queue.pending_per_item();

        let needed: u64 = catalog
            .items()
            .iter()
            .filter(|item| pending.contains_key(&item.id))
            .filter_map(|item| item.descriptor.as_ref())
            .map(|d| d.byte_len() as u64 + (d.rows() * std::mem::size_of::<f32>()) as u64)
            .sum();
        if needed > self.device.capacity_bytes() {
            return Err(Error::BackendUnavailable(format!(
                "{} bytes of descriptors exceed the {} byte budget of '{}'",
                needed,
                self.device.capacity_bytes(),
                self.device.name()
            )));
        }

        let mut residency = self.lock();
        for item in catalog.items() {
            let count = match pending.get(&item.id) {
                Some(&count) => count,
                None => continue,
            };
            let descriptor = match item.descriptor.as_ref() {
                Some(d) => d,
                None => continue,
            };
            let buffer = self.device.upload(descriptor)?;
            let bytes = self.device.buffer_bytes(&buffer);
            residency.used_bytes += bytes;
            residency.items.insert(
                item.id.clone(),
                Resident {
                    buffer: Arc::new(buffer),
                    pending: count,
                    bytes,
                },
            );
        }
        info!(
            "Staged {} descriptors ({} bytes) on '{}'",
            residency.items.len(),
            residency.used_bytes,
            self.device.name()
        );
        Ok(())
    }

    fn knn_match(&self, left: &ItemRecord, right: &ItemRecord) -> Result<Vec<KnnPair>, Error> {
        descriptors(left, right)?;
        let not_staged = |id: &str| Error::Comparison {
            left: left.id.clone(),
            right: right.id.clone(),
            reason: format!("{} is not staged on the device", id),
        };
        let query = self.buffer(&left.id).ok_or_else(|| not_staged(&left.id))?;
        let train = self.buffer(&right.id).ok_or_else(|| not_staged(&right.id))?;
        self.device.knn2(&query, &train)
    }

    fn pair_finished(&self, left_id: &str, right_id: &str) {
        let mut residency = self.lock();
        Self::finish_one(&mut residency, left_id);
        Self::finish_one(&mut residency, right_id);
    }

    fn release_all(&self) {
        let mut residency = self.lock();
        residency.items.clear();
        residency.used_bytes = 0;
    }
}
