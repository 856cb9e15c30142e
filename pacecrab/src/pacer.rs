//! The pacer: token-bucket admission over a shared document
//!
//! One acquisition runs the whole protocol:
//!
//! 1. Lock the document and reserve a slot with [`TokenBucket::reserve`],
//!    persisting the new bucket state and call count before unlocking.
//! 2. Run the rate checks on the snapshot taken under the lock, after it is
//!    released.
//! 3. Sleep until the reserved slot, outside any lock.
//! 4. Hand a [`Permit`] to the caller. Dropping it re-locks the document to
//!    record the call duration, the wait, the call timestamp and, if the
//!    protected section failed, an exception.
//!
//! Because every reservation moves the bucket's refill time to its own slot
//! before the lock is released, callers that race for the lock are lined up
//! one slot apart no matter when their sleeps end.

use std::ops::Deref;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use crate::core::metrics::{DEFAULT_MIN_SAMPLES, DEFAULT_RATE_WINDOWS};
use crate::core::{
    DriftEvent, DriftHandler, MaxCallsEvent, MaxCallsHandler, PacerError, PacerMetrics,
    PacerState, PeriodicCheckEvent, PeriodicCheckHandler, RateMonitor, RateSpec, Reservation,
    TokenBucket, unix_seconds,
};
use crate::shared::SharedJson;


const DEFAULT_MAX_DRIFT: f64 = 0.1;
const DEFAULT_CALLS_BETWEEN_CHECKS: u64 = 10;
const DEFAULT_SECONDS_BEFORE_FIRST_CHECK: f64 = 60.0;

/// Read-only view of the shared state at the moment a slot was granted
#[derive(Debug, Clone, PartialEq)]
pub struct ReservationContext {
    /// Pacer name
    pub id: String,
    /// Target rate used for this reservation, in calls per hour
    pub hourly_rate: u64,
    /// Calls granted so far, this one included
    pub call_count: u64,
    /// Failed protected sections so far
    pub exceptions: u64,
    /// Unix timestamp of the first call ever granted
    pub start_time: f64,
    /// Seconds this call had to wait for its slot
    pub seconds_waited: f64,
}

/// Builder for [`TokenBucketPacer`]
///
/// Every knob has a default; [`build`](Self::build) validates the whole
/// configuration before the shared document is touched.
pub struct PacerBuilder {
    shared: SharedJson,
    rate: RateSpec,
    max_drift: f64,
    num_calls_between_checks: u64,
    seconds_before_first_check: f64,
    burst_capacity: Option<u64>,
    max_calls: Option<u64>,
    rate_windows: Vec<u64>,
    min_samples: u64,
    worker_count: usize,
    on_drift: Option<DriftHandler>,
    on_periodic_check: Option<PeriodicCheckHandler>,
    on_max_calls: Option<MaxCallsHandler>,
}

impl PacerBuilder {
    fn new(shared: SharedJson, rate: RateSpec) -> Self {
        PacerBuilder {
            shared,
            rate,
            max_drift: DEFAULT_MAX_DRIFT,
            num_calls_between_checks: DEFAULT_CALLS_BETWEEN_CHECKS,
            seconds_before_first_check: DEFAULT_SECONDS_BEFORE_FIRST_CHECK,
            burst_capacity: None,
            max_calls: None,
            rate_windows: DEFAULT_RATE_WINDOWS.to_vec(),
            min_samples: DEFAULT_MIN_SAMPLES,
            worker_count: 1,
            on_drift: None,
            on_periodic_check: None,
            on_max_calls: None,
        }
    }

    /// Largest tolerated drift from the target rate, as a fraction in `[0, 1]` (default 0.1)
    pub fn max_drift(mut self, max_drift: f64) -> Self {
        self.max_drift = max_drift;
        self
    }

    /// Run the rate checks every this many calls (default 10)
    pub fn num_calls_between_checks(mut self, calls: u64) -> Self {
        self.num_calls_between_checks = calls;
        self
    }

    /// Do not check drift until this many seconds after the first call (default 60)
    pub fn seconds_before_first_check(mut self, seconds: f64) -> Self {
        self.seconds_before_first_check = seconds;
        self
    }

    /// Maximum number of stored tokens
    ///
    /// Defaults to 10% of the hourly rate at build time, at least one.
    pub fn burst_capacity(mut self, capacity: u64) -> Self {
        self.burst_capacity = Some(capacity);
        self
    }

    /// Notify the max-calls handler when the call count reaches `max_calls`
    ///
    /// Advisory only: calls past the limit are still granted.
    pub fn max_calls(mut self, max_calls: u64) -> Self {
        self.max_calls = Some(max_calls);
        self
    }

    /// Trailing windows, in seconds, reported in periodic checks (default 60, 300, 900)
    pub fn rate_windows(mut self, windows: impl Into<Vec<u64>>) -> Self {
        self.rate_windows = windows.into();
        self
    }

    /// Samples needed before percentiles are reported (default 10)
    pub fn min_samples(mut self, min_samples: u64) -> Self {
        self.min_samples = min_samples;
        self
    }

    /// Number of workers sharing the pacer, reported in periodic checks (default 1)
    pub fn worker_count(mut self, workers: usize) -> Self {
        self.worker_count = workers;
        self
    }

    /// Called when a rate check finds the drift above `max_drift`
    pub fn on_drift(mut self, handler: impl Fn(&DriftEvent) + Send + Sync + 'static) -> Self {
        self.on_drift = Some(Arc::new(handler));
        self
    }

    /// Called on every rate check with the current metrics
    pub fn on_periodic_check(
        mut self,
        handler: impl Fn(&PeriodicCheckEvent) + Send + Sync + 'static,
    ) -> Self {
        self.on_periodic_check = Some(Arc::new(handler));
        self
    }

    /// Called once, by the reservation that reaches `max_calls`
    pub fn on_max_calls(
        mut self,
        handler: impl Fn(&MaxCallsEvent) + Send + Sync + 'static,
    ) -> Self {
        self.on_max_calls = Some(Arc::new(handler));
        self
    }

    /// Validate the configuration and create the pacer
    ///
    /// # Errors
    ///
    /// [`PacerError::InvalidConfig`] if the rate resolves to zero, `max_drift`
    /// is outside `[0, 1]`, the check cadence or burst capacity is zero, or the
    /// first-check delay is negative.
    pub fn build(self) -> Result<TokenBucketPacer, PacerError> {
        if !(0.0..=1.0).contains(&self.max_drift) {
            return Err(PacerError::InvalidConfig(format!(
                "max_drift must be between 0 and 1, got {}",
                self.max_drift
            )));
        }
        if self.num_calls_between_checks < 1 {
            return Err(PacerError::InvalidConfig(
                "num_calls_between_checks must be positive, got 0".to_string(),
            ));
        }
        if self.seconds_before_first_check.is_nan() || self.seconds_before_first_check < 0.0 {
            return Err(PacerError::InvalidConfig(format!(
                "seconds_before_first_check must be non-negative, got {}",
                self.seconds_before_first_check
            )));
        }
        if self.burst_capacity == Some(0) {
            return Err(PacerError::InvalidConfig(
                "burst_capacity must be positive, got 0".to_string(),
            ));
        }
        let rate = self.rate.resolve();
        if rate.is_zero() {
            return Err(PacerError::InvalidConfig(
                "rate must be at least one call per hour".to_string(),
            ));
        }

        let burst_capacity = self
            .burst_capacity
            .unwrap_or_else(|| TokenBucket::default_burst_capacity(rate));
        let monitor = RateMonitor::new(self.max_drift, self.seconds_before_first_check)
            .with_worker_count(self.worker_count)
            .with_drift_handler(self.on_drift)
            .with_periodic_check_handler(self.on_periodic_check)
            .with_max_calls_handler(self.on_max_calls);

        Ok(TokenBucketPacer {
            inner: Arc::new(PacerInner {
                shared: self.shared,
                rate: self.rate,
                burst_capacity,
                num_calls_between_checks: self.num_calls_between_checks,
                max_calls: self.max_calls,
                metrics: PacerMetrics::new(self.rate_windows, self.min_samples),
                monitor,
            }),
        })
    }
}

struct PacerInner {
    shared: SharedJson,
    rate: RateSpec,
    burst_capacity: u64,
    num_calls_between_checks: u64,
    max_calls: Option<u64>,
    metrics: PacerMetrics,
    monitor: RateMonitor,
}

/// Paces calls to a target rate across every process sharing its document
///
/// Cloning is cheap and clones share the configuration. Separate instances,
/// in this process or others, built over the same [`SharedJson`] paths share
/// the rate.
///
/// # Example
///
/// ```
/// use pacecrab::{Rate, SharedJson, TokenBucketPacer};
///
/// let dir = tempfile::tempdir().unwrap();
/// let shared = SharedJson::new(dir.path().join("pacecrab_api.json"), dir.path().join("api.lock"));
/// let pacer = TokenBucketPacer::builder(shared, Rate::per_second(100))
///     .burst_capacity(5)
///     .build()
///     .unwrap();
///
/// for _ in 0..5 {
///     let permit = pacer.acquire(None).unwrap();
///     // Within the burst: no wait
///     assert_eq!(permit.seconds_waited, 0.0);
/// }
///
/// let result: Result<u64, pacecrab::PacerError> = pacer.pace(None, |ctx| Ok(ctx.call_count));
/// assert_eq!(result.unwrap(), 6);
/// assert_eq!(pacer.id(), "api");
/// ```
#[derive(Clone)]
pub struct TokenBucketPacer {
    inner: Arc<PacerInner>,
}

/// A slot granted by [`TokenBucketPacer::acquire`]
///
/// Dereferences to the [`ReservationContext`]. Dropping the permit ends the
/// protected section and records its statistics. The call is counted as an
/// exception if [`fail`](Self::fail) was called or the thread is panicking.
#[must_use = "the protected section ends when the permit is dropped"]
pub struct Permit {
    pacer: TokenBucketPacer,
    context: ReservationContext,
    entered: Instant,
    entered_at: f64,
    failed: bool,
}

impl TokenBucketPacer {
    /// Start configuring a pacer over `shared` at `rate`
    pub fn builder(shared: SharedJson, rate: impl Into<RateSpec>) -> PacerBuilder {
        PacerBuilder::new(shared, rate.into())
    }

    /// Pacer name, derived from the shared document
    pub fn id(&self) -> String {
        self.inner.shared.name()
    }

    /// Current target rate in calls per hour, resolved on every call
    pub fn hourly_rate(&self) -> u64 {
        self.inner.rate.resolve().calls_per_hour()
    }

    pub fn burst_capacity(&self) -> u64 {
        self.inner.burst_capacity
    }

    pub fn shared(&self) -> &SharedJson {
        &self.inner.shared
    }

    /// Snapshot of the shared state; never writes
    pub fn state(&self) -> Result<PacerState, PacerError> {
        Ok(self.inner.shared.read()?)
    }

    /// Wait for a slot and enter the protected section
    ///
    /// # Errors
    ///
    /// - [`PacerError::Timeout`]: The slot is further away than `timeout`.
    ///   Nothing is recorded and the call is not counted.
    /// - [`PacerError::SharedState`]: The shared document could not be locked
    ///   or accessed
    /// - [`PacerError::InvalidConfig`]: A dynamic rate resolved to zero
    pub fn acquire(&self, timeout: Option<Duration>) -> Result<Permit, PacerError> {
        let granted = self.reserve(timeout)?;

        let remaining = granted.reservation.remaining_wait(SystemTime::now());
        if !remaining.is_zero() {
            tracing::debug!(
                "Token bucket pacer {} waiting for {:.2} seconds",
                granted.context.id,
                remaining.as_secs_f64()
            );
            thread::sleep(remaining);
        }

        Ok(self.enter(granted.context))
    }

    /// Run `f` as the protected section of one paced call
    ///
    /// An `Err` from `f` is counted as an exception and returned unchanged.
    /// A panic is counted as well and keeps unwinding.
    pub fn pace<T, E, F>(&self, timeout: Option<Duration>, f: F) -> Result<T, E>
    where
        E: From<PacerError>,
        F: FnOnce(&ReservationContext) -> Result<T, E>,
    {
        let mut permit = self.acquire(timeout)?;
        let result = f(permit.context());
        if result.is_err() {
            permit.fail();
        }
        result
    }

    /// [`acquire`](Self::acquire) for async callers
    ///
    /// The locked section runs on the blocking pool and the pacing sleep is a
    /// tokio timer. Recording statistics when the permit drops still does
    /// blocking file I/O on the current thread.
    #[cfg(feature = "tokio")]
    pub async fn acquire_async(&self, timeout: Option<Duration>) -> Result<Permit, PacerError> {
        let pacer = self.clone();
        let granted = tokio::task::spawn_blocking(move || pacer.reserve(timeout))
            .await
            .map_err(|e| PacerError::Join(e.to_string()))??;

        let remaining = granted.reservation.remaining_wait(SystemTime::now());
        if !remaining.is_zero() {
            tracing::debug!(
                "Token bucket pacer {} waiting for {:.2} seconds",
                granted.context.id,
                remaining.as_secs_f64()
            );
            tokio::time::sleep(remaining).await;
        }

        Ok(self.enter(granted.context))
    }

    /// [`pace`](Self::pace) for async callers
    #[cfg(feature = "tokio")]
    pub async fn pace_async<T, E, F, Fut>(&self, timeout: Option<Duration>, f: F) -> Result<T, E>
    where
        E: From<PacerError>,
        F: FnOnce(ReservationContext) -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let mut permit = self.acquire_async(timeout).await?;
        let result = f(permit.context().clone()).await;
        if result.is_err() {
            permit.fail();
        }
        result
    }

    /// Reserve a slot under the lock, then run the rate checks outside it
    fn reserve(&self, timeout: Option<Duration>) -> Result<Granted, PacerError> {
        let id = self.id();
        let rate = self.inner.rate.resolve();
        let bucket = TokenBucket::new(rate, self.inner.burst_capacity);

        let (reservation, snapshot) = self.inner.shared.locked(|state: &mut PacerState| {
            let now = SystemTime::now();
            if state.start_time.is_none() {
                state.start_time = Some(unix_seconds(now));
                state.call_count = 0;
                state.exceptions = 0;
            }

            let reservation = bucket.reserve(state.token_bucket.as_ref(), now, &id, timeout)?;
            state.token_bucket = Some(reservation.state);
            state.call_count += 1;
            Ok::<_, PacerError>((reservation, state.clone()))
        })?;

        if snapshot.call_count % self.inner.num_calls_between_checks == 0 {
            let now = SystemTime::now();
            let target_rate = self.hourly_rate() as f64;
            let monitor = &self.inner.monitor;
            monitor.check_rate(&snapshot, &id, target_rate, now);
            monitor.periodic_check(&snapshot, &id, target_rate, &self.inner.metrics, now);
        }
        self.inner
            .monitor
            .check_max_calls(&snapshot, &id, self.inner.max_calls);

        let context = ReservationContext {
            id,
            hourly_rate: rate.calls_per_hour(),
            call_count: snapshot.call_count,
            exceptions: snapshot.exceptions,
            start_time: snapshot.start_time.unwrap_or_default(),
            seconds_waited: reservation.wait_time,
        };
        Ok(Granted {
            reservation,
            context,
        })
    }

    fn enter(&self, context: ReservationContext) -> Permit {
        Permit {
            pacer: self.clone(),
            context,
            entered: Instant::now(),
            entered_at: unix_seconds(SystemTime::now()),
            failed: false,
        }
    }

    /// Record a finished protected section
    fn complete(
        &self,
        duration: f64,
        wait_time: f64,
        timestamp: f64,
        failed: bool,
    ) -> Result<(), PacerError> {
        let metrics = &self.inner.metrics;
        self.inner.shared.locked(|state: &mut PacerState| {
            if failed {
                state.exceptions += 1;
            }
            state.statistics = Some(metrics.record_call(
                state.statistics.as_ref(),
                duration,
                wait_time,
                timestamp,
            ));
            Ok::<_, PacerError>(())
        })
    }
}

struct Granted {
    reservation: Reservation,
    context: ReservationContext,
}

impl Permit {
    pub fn context(&self) -> &ReservationContext {
        &self.context
    }

    /// Count this call as an exception when the permit is dropped
    pub fn fail(&mut self) {
        self.failed = true;
    }
}

impl Deref for Permit {
    type Target = ReservationContext;

    fn deref(&self) -> &ReservationContext {
        &self.context
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        let failed = self.failed || thread::panicking();
        let duration = self.entered.elapsed().as_secs_f64();
        if let Err(e) = self.pacer.complete(
            duration,
            self.context.seconds_waited,
            self.entered_at,
            failed,
        ) {
            tracing::error!(
                "Failed to record call statistics for {}: {}",
                self.context.id,
                e
            );
        }
    }
}
