//! Drift detection and notification dispatch
//!
//! The monitor is stateless: the pacer hands it a snapshot of the shared
//! state taken under the lock and calls it after the lock is released, so a
//! slow handler never holds up other workers. Handlers run on the calling
//! thread; a panicking handler is logged and otherwise ignored.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::SystemTime;

use super::SECONDS_PER_HOUR;
use super::events::{DriftEvent, MaxCallsEvent, PeriodicCheckEvent};
use super::metrics::PacerMetrics;
use super::state::PacerState;
use super::unix_seconds;

#[cfg(test)]
mod tests;

/// Called when the observed rate drifts beyond `max_drift`
pub type DriftHandler = Arc<dyn Fn(&DriftEvent) + Send + Sync>;
/// Called every `num_calls_between_checks` calls
pub type PeriodicCheckHandler = Arc<dyn Fn(&PeriodicCheckEvent) + Send + Sync>;
/// Called once when the call count reaches `max_calls`
pub type MaxCallsHandler = Arc<dyn Fn(&MaxCallsEvent) + Send + Sync>;

/// Rate checks and handler registry for one pacer
#[derive(Clone)]
pub struct RateMonitor {
    max_drift: f64,
    seconds_before_first_check: f64,
    worker_count: usize,
    on_drift: Option<DriftHandler>,
    on_periodic_check: Option<PeriodicCheckHandler>,
    on_max_calls: Option<MaxCallsHandler>,
}

impl RateMonitor {
    pub fn new(max_drift: f64, seconds_before_first_check: f64) -> Self {
        RateMonitor {
            max_drift,
            seconds_before_first_check,
            worker_count: 1,
            on_drift: None,
            on_periodic_check: None,
            on_max_calls: None,
        }
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_drift_handler(mut self, handler: Option<DriftHandler>) -> Self {
        self.on_drift = handler;
        self
    }

    pub fn with_periodic_check_handler(mut self, handler: Option<PeriodicCheckHandler>) -> Self {
        self.on_periodic_check = handler;
        self
    }

    pub fn with_max_calls_handler(mut self, handler: Option<MaxCallsHandler>) -> Self {
        self.on_max_calls = handler;
        self
    }

    pub fn max_drift(&self) -> f64 {
        self.max_drift
    }

    pub fn seconds_before_first_check(&self) -> f64 {
        self.seconds_before_first_check
    }

    /// Calls per hour given a call count and the seconds it took
    pub fn current_rate(call_count: u64, elapsed: f64) -> f64 {
        if elapsed <= 0.0 {
            return 0.0;
        }
        call_count as f64 / elapsed * SECONDS_PER_HOUR
    }

    /// Deviation from the target as a fraction of the target
    ///
    /// A zero target has zero drift if nothing ran and infinite drift otherwise.
    pub fn drift(current_rate: f64, target_rate: f64) -> f64 {
        if target_rate > 0.0 {
            (current_rate - target_rate).abs() / target_rate
        } else if current_rate == 0.0 {
            0.0
        } else {
            f64::INFINITY
        }
    }

    /// Compare the observed rate to the target and notify on excessive drift
    ///
    /// Returns the drift, or `None` while the first check is not due yet.
    /// This is advisory only: nothing is throttled or failed.
    pub fn check_rate(
        &self,
        snapshot: &PacerState,
        limiter_id: &str,
        target_rate: f64,
        now: SystemTime,
    ) -> Option<f64> {
        snapshot.start_time?;
        let elapsed = snapshot.elapsed_time(now);
        if elapsed <= 0.0 || elapsed < self.seconds_before_first_check {
            return None;
        }

        let current_rate = Self::current_rate(snapshot.call_count, elapsed);
        let drift = Self::drift(current_rate, target_rate);

        tracing::info!(
            "Rate check for {}: current={:.2}/hr, target={}/hr, drift={:.2}%. Total calls: {}. Exceptions: {}",
            limiter_id,
            current_rate,
            target_rate,
            drift * 100.0,
            snapshot.call_count,
            snapshot.exceptions
        );

        if drift > self.max_drift {
            tracing::error!(
                "Rate drift for {} exceeds maximum allowed: current={:.2}/hr, target={}/hr, drift={:.2}% (max allowed: {:.2}%)",
                limiter_id,
                current_rate,
                target_rate,
                drift * 100.0,
                self.max_drift * 100.0
            );
            if let Some(handler) = &self.on_drift {
                let event = DriftEvent {
                    limiter_id: limiter_id.to_string(),
                    state_snapshot: snapshot.clone(),
                    current_rate,
                    target_rate,
                    drift,
                    max_drift: self.max_drift,
                };
                notify("drift", limiter_id, || handler(&event));
            }
        }

        Some(drift)
    }

    /// Gather the current metrics and hand them to the periodic-check handler
    pub fn periodic_check(
        &self,
        snapshot: &PacerState,
        limiter_id: &str,
        target_rate: f64,
        metrics: &PacerMetrics,
        now: SystemTime,
    ) {
        let Some(handler) = &self.on_periodic_check else {
            return;
        };

        let stats = snapshot.statistics.as_ref();
        let elapsed = snapshot.elapsed_time(now);
        let current_rate = Self::current_rate(snapshot.call_count, elapsed);
        let drift = (elapsed >= self.seconds_before_first_check && target_rate > 0.0)
            .then(|| Self::drift(current_rate, target_rate));

        let event = PeriodicCheckEvent {
            limiter_id: limiter_id.to_string(),
            state_snapshot: snapshot.clone(),
            worker_count: self.worker_count,
            duration_digest: metrics.duration_digest(stats),
            wait_digest: metrics.wait_digest(stats),
            windowed_rates: metrics.windowed_rates(stats, unix_seconds(now)),
            sample_count: metrics.sample_count(stats),
            target_rate,
            current_rate,
            drift,
        };
        tracing::debug!("{}", event);
        notify("periodic check", limiter_id, || handler(&event));
    }

    /// Notify when this reservation is the one that reached `max_calls`
    ///
    /// Call counts are unique per reservation, so across all workers exactly
    /// one reservation sees `call_count == max_calls`.
    pub fn check_max_calls(&self, snapshot: &PacerState, limiter_id: &str, max_calls: Option<u64>) {
        let Some(max_calls) = max_calls.filter(|max| *max > 0) else {
            return;
        };
        if snapshot.call_count != max_calls {
            return;
        }

        tracing::info!(
            "Pacer {} reached max_calls limit of {}",
            limiter_id,
            max_calls
        );
        if let Some(handler) = &self.on_max_calls {
            let event = MaxCallsEvent {
                limiter_id: limiter_id.to_string(),
                state_snapshot: snapshot.clone(),
                max_calls,
            };
            notify("max calls", limiter_id, || handler(&event));
        }
    }
}

fn notify(kind: &str, limiter_id: &str, call: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(call)) {
        tracing::error!(
            "{} handler for {} panicked: {}",
            kind,
            limiter_id,
            panic_message(payload.as_ref())
        );
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
