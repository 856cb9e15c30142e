//! Merging t-digest for approximate percentiles
//!
//! The pacer keeps one digest of call durations and one of wait times inside
//! the shared document, so the structure has to be small, serializable and
//! cheap to update one sample at a time. Samples are buffered as unit-weight
//! centroids and folded together once the buffer grows past twice the
//! compression, using the arcsine scale function so that the tails keep
//! small centroids while the middle gets coarse ones.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;


const DEFAULT_COMPRESSION: f64 = 100.0;
const BUFFER_FACTOR: f64 = 2.0;

/// A cluster of samples summarized by its mean and weight
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Centroid {
    pub mean: f64,
    pub weight: f64,
}

/// Constant-space summary of a stream of samples
///
/// # Example
///
/// ```
/// use pacecrab::Digest;
///
/// let mut digest = Digest::new();
/// for i in 1..=1000 {
///     digest.insert(i as f64);
/// }
///
/// let p50 = digest.quantile(0.5).unwrap();
/// assert!((p50 - 500.0).abs() < 25.0);
/// assert_eq!(digest.min(), Some(1.0));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Digest {
    compression: f64,
    centroids: Vec<Centroid>,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Default for Digest {
    fn default() -> Self {
        Self::new()
    }
}

impl Digest {
    /// Create an empty digest with the default compression (100)
    pub fn new() -> Self {
        Self::with_compression(DEFAULT_COMPRESSION)
    }

    /// Create an empty digest
    ///
    /// Higher compression keeps more centroids and gives tighter estimates.
    /// Values below 10 are raised to 10.
    pub fn with_compression(compression: f64) -> Self {
        Digest {
            compression: compression.max(10.0),
            centroids: Vec::new(),
            count: 0,
            sum: 0.0,
            min: 0.0,
            max: 0.0,
        }
    }

    /// Add one sample; NaN and infinities are ignored
    pub fn insert(&mut self, value: f64) {
        // Non-finite values cannot be stored in JSON
        if !value.is_finite() {
            return;
        }
        self.centroids.push(Centroid {
            mean: value,
            weight: 1.0,
        });
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;

        if self.centroids.len() as f64 > BUFFER_FACTOR * self.compression {
            self.compress();
        }
    }

    /// Number of samples seen
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn min(&self) -> Option<f64> {
        (!self.is_empty()).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (!self.is_empty()).then_some(self.max)
    }

    pub fn mean(&self) -> Option<f64> {
        (!self.is_empty()).then(|| self.sum / self.count as f64)
    }

    /// Number of centroids currently held
    pub fn centroid_count(&self) -> usize {
        self.centroids.len()
    }

    /// Estimate the value at quantile `q` (0.0 to 1.0)
    ///
    /// Returns `None` for an empty digest.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        let q = if q.is_nan() { 0.5 } else { q.clamp(0.0, 1.0) };
        if q == 0.0 {
            return Some(self.min);
        }
        if q == 1.0 {
            return Some(self.max);
        }

        let centroids = sorted(&self.centroids);
        if centroids.len() == 1 {
            return Some(centroids[0].mean);
        }

        let total: f64 = centroids.iter().map(|c| c.weight).sum();
        let target = q * total;

        // Left of the first centroid's center: interpolate from the minimum
        let first = centroids[0];
        if target < first.weight / 2.0 {
            let fraction = target / (first.weight / 2.0);
            return Some(self.min + (first.mean - self.min) * fraction);
        }

        let mut cumulative = 0.0;
        for pair in centroids.windows(2) {
            let (left, right) = (pair[0], pair[1]);
            let left_center = cumulative + left.weight / 2.0;
            let right_center = cumulative + left.weight + right.weight / 2.0;
            if target <= right_center {
                let fraction = (target - left_center) / (right_center - left_center);
                return Some(left.mean + (right.mean - left.mean) * fraction);
            }
            cumulative += left.weight;
        }

        // Right of the last centroid's center: interpolate to the maximum
        let last = centroids[centroids.len() - 1];
        let last_center = total - last.weight / 2.0;
        let fraction = ((target - last_center) / (last.weight / 2.0)).min(1.0);
        Some(last.mean + (self.max - last.mean) * fraction)
    }

    /// Estimate the value at percentile `p` (0 to 100)
    pub fn percentile(&self, p: f64) -> Option<f64> {
        self.quantile(p / 100.0)
    }

    /// Fold buffered samples into as few centroids as the scale function allows
    pub fn compress(&mut self) {
        if self.centroids.len() <= 1 {
            return;
        }
        let centroids = sorted(&self.centroids);
        let total: f64 = centroids.iter().map(|c| c.weight).sum();

        let mut merged = Vec::with_capacity(self.compression as usize + 1);
        let mut current = centroids[0];
        let mut weight_before = 0.0;
        let mut k_left = self.k_scale(0.0);

        for next in centroids.into_iter().skip(1) {
            let proposed = weight_before + current.weight + next.weight;
            if self.k_scale(proposed / total) - k_left <= 1.0 {
                let weight = current.weight + next.weight;
                current.mean += (next.mean - current.mean) * next.weight / weight;
                current.weight = weight;
            } else {
                weight_before += current.weight;
                merged.push(current);
                k_left = self.k_scale(weight_before / total);
                current = next;
            }
        }
        merged.push(current);

        self.centroids = merged;
    }

    fn k_scale(&self, q: f64) -> f64 {
        self.compression / (2.0 * PI) * (2.0 * q - 1.0).clamp(-1.0, 1.0).asin()
    }
}

fn sorted(centroids: &[Centroid]) -> Vec<Centroid> {
    let mut sorted = centroids.to_vec();
    sorted.sort_by(|a, b| a.mean.total_cmp(&b.mean));
    sorted
}
