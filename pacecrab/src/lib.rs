//! # PaceCrab
//!
//! A token bucket pacer shared by independent processes through a lock-protected JSON file.
//!
//! ## Overview
//!
//! PaceCrab keeps a group of workers (test runners, load generators, batch jobs)
//! at a combined target rate without any server or shared memory:
//! - **One file per pacer**: The bucket, counters and statistics live in a JSON document
//! - **Reservation-based waiting**: Slots are decided under the lock, sleeps happen outside it
//! - **No double admission**: Every reservation moves the bucket to its own slot
//! - **Monitoring**: Drift, periodic and max-calls notifications with percentile statistics
//!
//! ## Quick Start
//!
//! ```
//! use pacecrab::{Rate, SharedJsonFactory};
//!
//! // Every worker builds the same factory over a directory they all see
//! let dir = tempfile::tempdir().unwrap();
//! let factory = SharedJsonFactory::new(dir.path());
//!
//! // 10 calls per second across all workers, bursts of up to 2
//! let pacer = factory
//!     .pacer("api", Rate::per_second(10))?
//!     .burst_capacity(2)
//!     .build()?;
//!
//! for _ in 0..3 {
//!     let permit = pacer.acquire(None)?;
//!     println!("call {} waited {:.2}s", permit.call_count, permit.seconds_waited);
//!     // The protected section ends when the permit is dropped
//! }
//!
//! assert_eq!(pacer.state()?.call_count, 3);
//! # Ok::<(), pacecrab::PacerError>(())
//! ```
//!
//! ## Protected Sections
//!
//! [`TokenBucketPacer::pace`] runs a closure as the protected section. Errors
//! are counted in the shared `exceptions` counter and returned unchanged:
//!
//! ```
//! use pacecrab::{PacerError, Rate, SharedJson, TokenBucketPacer};
//! use std::time::Duration;
//!
//! #[derive(Debug)]
//! enum ApiError {
//!     Unavailable,
//!     Pacer(PacerError),
//! }
//!
//! impl From<PacerError> for ApiError {
//!     fn from(e: PacerError) -> Self {
//!         ApiError::Pacer(e)
//!     }
//! }
//!
//! let dir = tempfile::tempdir().unwrap();
//! let shared = SharedJson::new(dir.path().join("api.json"), dir.path().join("api.lock"));
//! let pacer = TokenBucketPacer::builder(shared, Rate::per_minute(600)).build().unwrap();
//!
//! let result: Result<(), ApiError> = pacer.pace(Some(Duration::from_secs(5)), |_ctx| {
//!     Err(ApiError::Unavailable)
//! });
//! assert!(matches!(result, Err(ApiError::Unavailable)));
//! assert_eq!(pacer.state().unwrap().exceptions, 1);
//! ```
//!
//! ## Monitoring
//!
//! Handlers run on the thread that made the reservation, after the lock is
//! released, with a copy of the shared state:
//!
//! ```
//! use pacecrab::{Rate, SharedJson, TokenBucketPacer};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let shared = SharedJson::new(dir.path().join("jobs.json"), dir.path().join("jobs.lock"));
//! let pacer = TokenBucketPacer::builder(shared, Rate::per_hour(3600))
//!     .max_drift(0.2)
//!     .num_calls_between_checks(50)
//!     .on_drift(|event| eprintln!("{} drifted by {:.0}%", event.limiter_id, event.drift * 100.0))
//!     .on_periodic_check(|event| eprintln!("{event}"))
//!     .max_calls(10_000)
//!     .on_max_calls(|event| eprintln!("{} reached {} calls", event.limiter_id, event.max_calls))
//!     .build()
//!     .unwrap();
//! # drop(pacer);
//! ```
//!
//! ## Shared State Layout
//!
//! ```json
//! {
//!   "start_time": 1760000000.5,
//!   "call_count": 42,
//!   "exceptions": 1,
//!   "token_bucket": {"last_refill_time": 1760000041.2, "tokens": 0.0},
//!   "statistics": {"duration_digest": {}, "wait_digest": {}, "sample_count": 41, "call_timestamps": []}
//! }
//! ```
//!
//! Other keys in the document are left alone.
//!
//! ## Features
//!
//! - `tokio` (default): `acquire_async` and `pace_async`

pub mod core;
pub mod pacer;
pub mod shared;

pub use crate::core::{
    BucketState, Digest, DriftEvent, MaxCallsEvent, PacerError, PacerMetrics, PacerState,
    PeriodicCheckEvent, Rate, RateMonitor, RateSpec, Reservation, Statistics, TokenBucket,
};
pub use crate::core::events::PacerEvent;
pub use pacer::{PacerBuilder, Permit, ReservationContext, TokenBucketPacer};
pub use shared::{
    InitialData, LastWorkerCallback, SharedJson, SharedJsonFactory, SharedJsonOptions,
    SharedStateError,
};
