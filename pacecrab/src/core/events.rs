//! Payloads handed to drift, periodic-check and max-calls handlers
//!
//! Every event owns a copy of the shared state taken when the triggering
//! reservation was granted. Handlers can read it freely; nothing they do to
//! the copy reaches the shared document.

use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

use super::digest::Digest;
use super::state::PacerState;

/// Context common to all pacer events
pub trait PacerEvent {
    /// Name of the pacer that fired the event
    fn limiter_id(&self) -> &str;

    /// Shared state as of the triggering reservation
    fn state_snapshot(&self) -> &PacerState;

    /// Total number of calls made
    fn call_count(&self) -> u64 {
        self.state_snapshot().call_count
    }

    /// Total number of failed protected sections
    fn exceptions(&self) -> u64 {
        self.state_snapshot().exceptions
    }

    /// Unix timestamp of the first call
    fn start_time(&self) -> Option<f64> {
        self.state_snapshot().start_time
    }

    /// Seconds since the first call
    fn elapsed_time(&self) -> f64 {
        self.state_snapshot().elapsed_time(SystemTime::now())
    }
}

/// Fired when the observed rate drifts further from the target than allowed
#[derive(Debug, Clone)]
pub struct DriftEvent {
    pub limiter_id: String,
    pub state_snapshot: PacerState,
    /// Observed rate in calls per hour
    pub current_rate: f64,
    /// Target rate in calls per hour
    pub target_rate: f64,
    /// Deviation as a fraction of the target (0.1 = 10%)
    pub drift: f64,
    /// Configured maximum drift
    pub max_drift: f64,
}

/// Fired once, when the call count reaches the configured maximum
#[derive(Debug, Clone)]
pub struct MaxCallsEvent {
    pub limiter_id: String,
    pub state_snapshot: PacerState,
    pub max_calls: u64,
}

/// Fired every `num_calls_between_checks` calls with the current metrics
///
/// The digests are `None` until enough samples exist for percentiles to be
/// meaningful, and `drift` is `None` before the first rate check is due.
#[derive(Debug, Clone)]
pub struct PeriodicCheckEvent {
    pub limiter_id: String,
    pub state_snapshot: PacerState,
    /// Number of workers sharing the pacer, as configured by the host
    pub worker_count: usize,
    pub duration_digest: Option<Digest>,
    pub wait_digest: Option<Digest>,
    /// Calls per hour over each trailing window (seconds)
    pub windowed_rates: BTreeMap<u64, f64>,
    pub sample_count: u64,
    pub target_rate: f64,
    pub current_rate: f64,
    pub drift: Option<f64>,
}

macro_rules! impl_pacer_event {
    ($($event:ty),*) => {
        $(
            impl PacerEvent for $event {
                fn limiter_id(&self) -> &str {
                    &self.limiter_id
                }

                fn state_snapshot(&self) -> &PacerState {
                    &self.state_snapshot
                }
            }
        )*
    };
}

impl_pacer_event!(DriftEvent, MaxCallsEvent, PeriodicCheckEvent);

impl PeriodicCheckEvent {
    /// Median call duration in seconds
    pub fn duration_p50(&self) -> Option<f64> {
        self.duration_digest.as_ref()?.percentile(50.0)
    }

    /// 90th percentile call duration in seconds
    pub fn duration_p90(&self) -> Option<f64> {
        self.duration_digest.as_ref()?.percentile(90.0)
    }

    /// 99th percentile call duration in seconds
    pub fn duration_p99(&self) -> Option<f64> {
        self.duration_digest.as_ref()?.percentile(99.0)
    }

    /// Median wait time in seconds
    pub fn wait_p50(&self) -> Option<f64> {
        self.wait_digest.as_ref()?.percentile(50.0)
    }

    /// 90th percentile wait time in seconds
    pub fn wait_p90(&self) -> Option<f64> {
        self.wait_digest.as_ref()?.percentile(90.0)
    }

    /// 99th percentile wait time in seconds
    pub fn wait_p99(&self) -> Option<f64> {
        self.wait_digest.as_ref()?.percentile(99.0)
    }

    /// Median wait divided by median call duration
    ///
    /// Below 0.1 the callers spend most of their time in the system under
    /// test, which is the bottleneck. Above 1.0 they mostly wait for the
    /// pacer, and the target rate could be raised.
    pub fn wait_ratio(&self) -> Option<f64> {
        let duration = self.duration_p50().filter(|d| *d > 0.0)?;
        let wait = self.wait_p50().filter(|w| *w > 0.0)?;
        Some(wait / duration)
    }
}

impl fmt::Display for PeriodicCheckEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Periodic check for {}: workers={} samples={}",
            self.limiter_id, self.worker_count, self.sample_count
        )?;
        if let Some(p50) = self.duration_p50() {
            write!(f, " duration_p50={p50:.3}s")?;
        }
        if let Some(p50) = self.wait_p50() {
            write!(f, " wait_p50={p50:.3}s")?;
        }
        if let Some(ratio) = self.wait_ratio() {
            write!(f, " wait_ratio={ratio:.2}")?;
        }
        write!(f, " current_rate={:.0}/hr", self.current_rate)?;
        match self.drift {
            Some(drift) => write!(f, " drift={:.2}%", drift * 100.0),
            None => write!(f, " drift=N/A"),
        }
    }
}
