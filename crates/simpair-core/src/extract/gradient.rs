use super::{Descriptor, FeatureExtractor, Unreadable};
use image::imageops::{self, FilterType};
use std::f32::consts::PI;

const SAMPLE_SIZE: usize = 128;
const PATCH: usize = 16;
const STRIDE: usize = 8;
const CELLS: usize = 4;
const CELL: usize = PATCH / CELLS;
const BINS: usize = 8;
pub const DIMS: usize = CELLS * CELLS * BINS;

// Histogram entries are clipped here after the first normalisation.
const CLIP: f32 = 0.2;
// Mean gradient magnitude below which a patch counts as flat.
const ENERGY_FLOOR: f32 = 0.01;

/// Dense gradient-orientation descriptor.
///
/// The image is decoded, converted to grayscale and resampled to a fixed
/// 128x128 grid. Every 16x16 patch (stride 8) is split into 4x4 cells, each
/// holding an 8-bin orientation histogram weighted by gradient magnitude, giving
/// 128 values per patch. Flat patches are dropped, the rest are normalised,
/// clipped and renormalised.
#[derive(Debug, Default, Clone, Copy)]
pub struct GradientGridExtractor;

impl GradientGridExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl FeatureExtractor for GradientGridExtractor {
    fn name(&self) -> &str {
        "gradient-grid"
    }

    fn extract(&self, bytes: &[u8]) -> Result<Descriptor, Unreadable> {
        let decoded = image::load_from_memory(bytes).map_err(|e| Unreadable(e.to_string()))?;
        let gray = decoded.to_luma8();
        if gray.width() == 0 || gray.height() == 0 {
            return Err(Unreadable("image has no pixels".to_string()));
        }
        let sampled = imageops::resize(
            &gray,
            SAMPLE_SIZE as u32,
            SAMPLE_SIZE as u32,
            FilterType::Triangle,
        );

        let pixels: Vec<f32> = sampled.as_raw().iter().map(|&p| p as f32 / 255.0).collect();
        let (magnitude, bin) = gradients(&pixels);

        let mut values = Vec::new();
        for py in (0..=SAMPLE_SIZE - PATCH).step_by(STRIDE) {
            for px in (0..=SAMPLE_SIZE - PATCH).step_by(STRIDE) {
                if let Some(row) = patch_histogram(&magnitude, &bin, px, py) {
                    values.extend_from_slice(&row);
                }
            }
        }

        Descriptor::new(DIMS, values).map_err(|e| Unreadable(e.to_string()))
    }
}

fn gradients(pixels: &[f32]) -> (Vec<f32>, Vec<usize>) {
    let at = |x: usize, y: usize| pixels[y * SAMPLE_SIZE + x];
    let mut magnitude = vec![0.0f32; pixels.len()];
    let mut bin = vec![0usize; pixels.len()];

    for y in 0..SAMPLE_SIZE {
        for x in 0..SAMPLE_SIZE {
            let gx = at((x + 1).min(SAMPLE_SIZE - 1), y) - at(x.saturating_sub(1), y);
            let gy = at(x, (y + 1).min(SAMPLE_SIZE - 1)) - at(x, y.saturating_sub(1));
            let idx = y * SAMPLE_SIZE + x;
            magnitude[idx] = (gx * gx + gy * gy).sqrt();
            let angle = gy.atan2(gx) + PI;
            bin[idx] = ((angle / (2.0 * PI)) * BINS as f32) as usize % BINS;
        }
    }

    (magnitude, bin)
}

fn patch_histogram(magnitude: &[f32], bin: &[usize], px: usize, py: usize) -> Option<[f32; DIMS]> {
    let mut hist = [0.0f32; DIMS];
    let mut energy = 0.0f32;

    for dy in 0..PATCH {
        for dx in 0..PATCH {
            let idx = (py + dy) * SAMPLE_SIZE + (px + dx);
            let cell = (dy / CELL) * CELLS + dx / CELL;
            hist[cell * BINS + bin[idx]] += magnitude[idx];
            energy += magnitude[idx];
        }
    }

    if energy / ((PATCH * PATCH) as f32) < ENERGY_FLOOR {
        return None;
    }

    normalize(&mut hist);
    for v in hist.iter_mut() {
        *v = v.min(CLIP);
    }
    normalize(&mut hist);
    Some(hist)
}

fn normalize(values: &mut [f32]) {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in values.iter_mut() {
            *v /= norm;
        }
    }
}
