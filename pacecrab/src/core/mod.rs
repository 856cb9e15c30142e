//! Core components of the pacecrab pacing library
//!
//! This module contains the pure building blocks that the [`TokenBucketPacer`](crate::TokenBucketPacer)
//! composes under the shared-state lock:
//! - [`rate`]: Target rates expressed in calls per hour
//! - [`bucket`]: The reservation-based token bucket algorithm
//! - [`digest`]: Constant-space percentile estimation
//! - [`metrics`]: Rolling statistics stored in the shared document
//! - [`monitor`]: Drift, periodic and max-calls notifications
//! - [`events`]: Payloads handed to notification handlers

pub mod bucket;
pub mod digest;
pub mod events;
pub mod metrics;
pub mod monitor;
pub mod rate;
pub mod state;
#[cfg(test)]
mod tests;

pub use bucket::{BucketState, Reservation, TokenBucket};
pub use digest::Digest;
pub use events::{DriftEvent, MaxCallsEvent, PeriodicCheckEvent};
pub use metrics::{PacerMetrics, Statistics};
pub use monitor::{DriftHandler, MaxCallsHandler, PeriodicCheckHandler, RateMonitor};
pub use rate::{Rate, RateSpec};
pub use state::PacerState;

use crate::shared::SharedStateError;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub(crate) const SECONDS_PER_HOUR: f64 = 3600.0;

/// Errors that can occur while pacing
///
/// # Variants
///
/// - [`Timeout`](PacerError::Timeout): The wait for a token would exceed the caller's timeout
/// - [`InvalidConfig`](PacerError::InvalidConfig): Construction parameters (or a resolved rate) are invalid
/// - [`SharedState`](PacerError::SharedState): The shared document could not be locked, read or written
/// - [`Join`](PacerError::Join): A blocking task used by the async API did not complete
///
/// # Example
///
/// ```
/// use pacecrab::{PacerError, SharedJson, TokenBucketPacer, Rate};
/// use std::time::Duration;
///
/// let dir = tempfile::tempdir().unwrap();
/// let shared = SharedJson::new(dir.path().join("api.json"), dir.path().join("api.lock"));
/// let pacer = TokenBucketPacer::builder(shared, Rate::per_hour(1))
///     .burst_capacity(1)
///     .build()
///     .unwrap();
///
/// // The first call consumes the only token
/// drop(pacer.acquire(None).unwrap());
///
/// // The second one would have to wait an hour
/// match pacer.acquire(Some(Duration::from_millis(10))) {
///     Err(PacerError::Timeout { required_wait, .. }) => {
///         assert!(required_wait > Duration::from_secs(3500));
///     }
///     _ => panic!("expected a timeout"),
/// }
/// ```
#[derive(Debug, thiserror::Error)]
pub enum PacerError {
    /// The computed wait exceeds the timeout given to the acquisition
    #[error(
        "pacer '{id}' timeout of {:.2}s exceeded, would need to wait {:.2}s to acquire a token",
        .timeout.as_secs_f64(),
        .required_wait.as_secs_f64()
    )]
    Timeout {
        id: String,
        timeout: Duration,
        required_wait: Duration,
    },

    /// Invalid construction parameters or an unusable resolved rate
    #[error("invalid pacer configuration: {0}")]
    InvalidConfig(String),

    /// Locking, reading or writing the shared document failed
    #[error(transparent)]
    SharedState(#[from] SharedStateError),

    /// A blocking task spawned by the async API panicked or was cancelled
    #[error("pacer task failed: {0}")]
    Join(String),
}

/// Convert a wall-clock time to fractional Unix seconds, as stored in the shared document
pub(crate) fn unix_seconds(time: SystemTime) -> f64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since) => since.as_secs_f64(),
        // Clock before the epoch: keep ordering instead of failing
        Err(e) => -e.duration().as_secs_f64(),
    }
}

/// Seconds (possibly fractional) as a `Duration`, clamping negatives and NaN to zero
pub(crate) fn seconds_to_duration(seconds: f64) -> Duration {
    if seconds.is_nan() || seconds <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
}
