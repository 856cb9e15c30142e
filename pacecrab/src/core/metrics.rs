//! Rolling statistics kept in the shared document
//!
//! [`PacerMetrics`] owns the configuration (rate windows, minimum sample count)
//! and a set of pure operations over the persisted [`Statistics`]: each takes
//! the previous statistics (or `None`) plus one new sample and returns the new
//! statistics for the caller to persist under the lock.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::SECONDS_PER_HOUR;
use super::digest::Digest;

#[cfg(test)]
mod tests;

/// Trailing windows, in seconds, used for throughput by default
pub const DEFAULT_RATE_WINDOWS: [u64; 3] = [60, 300, 900];

/// Samples required before percentiles are reported
pub const DEFAULT_MIN_SAMPLES: u64 = 10;

/// The `statistics` object of the shared document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    /// Time spent inside the protected section, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_digest: Option<Digest>,
    /// Time spent waiting for a token, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_digest: Option<Digest>,
    #[serde(default)]
    pub sample_count: u64,
    /// Unix timestamps of recent calls, oldest first
    #[serde(default)]
    pub call_timestamps: Vec<f64>,
}

/// Statistics operations for one pacer
#[derive(Debug, Clone)]
pub struct PacerMetrics {
    rate_windows: Vec<u64>,
    min_samples: u64,
}

impl Default for PacerMetrics {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_WINDOWS.to_vec(), DEFAULT_MIN_SAMPLES)
    }
}

impl PacerMetrics {
    /// Create metrics over the given windows (seconds)
    pub fn new(rate_windows: Vec<u64>, min_samples: u64) -> Self {
        PacerMetrics {
            rate_windows,
            min_samples,
        }
    }

    pub fn rate_windows(&self) -> &[u64] {
        &self.rate_windows
    }

    pub fn min_samples(&self) -> u64 {
        self.min_samples
    }

    /// Add a call duration sample and bump the sample count
    pub fn update_duration_stats(&self, stats: Option<&Statistics>, duration: f64) -> Statistics {
        let mut stats = stats.cloned().unwrap_or_default();
        stats
            .duration_digest
            .get_or_insert_with(Digest::new)
            .insert(duration);
        stats.sample_count += 1;
        stats
    }

    /// Add a wait time sample
    pub fn update_wait_stats(&self, stats: Option<&Statistics>, wait_time: f64) -> Statistics {
        let mut stats = stats.cloned().unwrap_or_default();
        stats
            .wait_digest
            .get_or_insert_with(Digest::new)
            .insert(wait_time);
        stats
    }

    /// Append a call timestamp and drop the ones older than the largest window
    ///
    /// Without any window there is nothing to compute rates over, so no
    /// timestamp is kept.
    pub fn track_call_timestamp(&self, stats: Option<&Statistics>, timestamp: f64) -> Statistics {
        let mut stats = stats.cloned().unwrap_or_default();
        let Some(max_window) = self.rate_windows.iter().max().copied() else {
            stats.call_timestamps.clear();
            return stats;
        };

        // Calls finish out of order across processes: keep the list sorted
        let position = stats
            .call_timestamps
            .partition_point(|existing| *existing <= timestamp);
        stats.call_timestamps.insert(position, timestamp);

        let newest = stats.call_timestamps.last().copied().unwrap_or(timestamp);
        let cutoff = newest - max_window as f64;
        stats.call_timestamps.retain(|ts| *ts >= cutoff);
        stats
    }

    /// Record everything known about one finished call
    pub fn record_call(
        &self,
        stats: Option<&Statistics>,
        duration: f64,
        wait_time: f64,
        timestamp: f64,
    ) -> Statistics {
        let stats = self.update_duration_stats(stats, duration);
        let stats = self.update_wait_stats(Some(&stats), wait_time);
        self.track_call_timestamp(Some(&stats), timestamp)
    }

    /// Calls per hour over each configured window ending at `now`
    pub fn windowed_rates(&self, stats: Option<&Statistics>, now: f64) -> BTreeMap<u64, f64> {
        let timestamps = stats.map(|s| s.call_timestamps.as_slice()).unwrap_or(&[]);
        self.rate_windows
            .iter()
            .map(|&window| {
                if window == 0 {
                    return (window, 0.0);
                }
                let cutoff = now - window as f64;
                let calls = timestamps.iter().filter(|ts| **ts >= cutoff).count();
                (window, calls as f64 / window as f64 * SECONDS_PER_HOUR)
            })
            .collect()
    }

    /// Duration digest, once enough samples exist to make percentiles meaningful
    pub fn duration_digest(&self, stats: Option<&Statistics>) -> Option<Digest> {
        let stats = stats.filter(|s| s.sample_count >= self.min_samples)?;
        stats.duration_digest.clone()
    }

    /// Wait digest, once enough samples exist to make percentiles meaningful
    pub fn wait_digest(&self, stats: Option<&Statistics>) -> Option<Digest> {
        let stats = stats.filter(|s| s.sample_count >= self.min_samples)?;
        stats.wait_digest.clone()
    }

    pub fn sample_count(&self, stats: Option<&Statistics>) -> u64 {
        stats.map_or(0, |s| s.sample_count)
    }
}
