//! Target rates for the token bucket
//!
//! This module provides the [`Rate`] type, a whole number of calls per hour,
//! and [`RateSpec`], which lets a pacer either hold a fixed rate or ask a
//! resolver for the current one every time the rate matters.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::SECONDS_PER_HOUR;


/// Rate expressed as calls per hour
///
/// Fractional inputs to the unit constructors are truncated to whole calls
/// per hour, so `Rate::per_day(12)` is zero. A zero rate can be represented
/// but is rejected by the pacer.
///
/// # Examples
///
/// ```
/// use pacecrab::Rate;
/// use std::time::Duration;
///
/// // 10 calls per second
/// let rate = Rate::per_second(10);
/// assert_eq!(rate.calls_per_hour(), 36_000);
/// assert_eq!(rate.period(), Some(Duration::from_millis(100)));
///
/// // 600 calls per minute is the same rate
/// assert_eq!(Rate::per_minute(600), rate);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Rate {
    calls_per_hour: u64,
}

impl Rate {
    /// Creates a rate of n calls per hour
    pub fn per_hour(n: u64) -> Self {
        Rate { calls_per_hour: n }
    }

    /// Creates a rate of n calls per second
    ///
    /// # Example
    ///
    /// ```
    /// use pacecrab::Rate;
    ///
    /// // One call every two seconds
    /// assert_eq!(Rate::per_second(0.5).calls_per_hour(), 1800);
    /// ```
    pub fn per_second(n: impl Into<f64>) -> Self {
        Self::from_hourly(n.into() * SECONDS_PER_HOUR)
    }

    /// Creates a rate of n calls per minute
    pub fn per_minute(n: impl Into<f64>) -> Self {
        Self::from_hourly(n.into() * 60.0)
    }

    /// Creates a rate of n calls per day
    pub fn per_day(n: impl Into<f64>) -> Self {
        Self::from_hourly(n.into() / 24.0)
    }

    // `as` saturates: negatives and NaN become zero
    fn from_hourly(calls: f64) -> Self {
        Rate {
            calls_per_hour: calls as u64,
        }
    }

    /// Number of calls admitted per hour
    pub fn calls_per_hour(&self) -> u64 {
        self.calls_per_hour
    }

    /// Tokens added to the bucket per second
    pub fn tokens_per_second(&self) -> f64 {
        self.calls_per_hour as f64 / SECONDS_PER_HOUR
    }

    /// Interval between two token emissions, `None` for a zero rate
    pub fn period(&self) -> Option<Duration> {
        if self.calls_per_hour == 0 {
            return None;
        }
        Some(Duration::from_secs_f64(
            SECONDS_PER_HOUR / self.calls_per_hour as f64,
        ))
    }

    /// Whether the rate admits any call at all
    pub fn is_zero(&self) -> bool {
        self.calls_per_hour == 0
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/hr", self.calls_per_hour)
    }
}

/// Where a pacer gets its target rate from
///
/// A [`RateSpec::Dynamic`] resolver is invoked on every rate query and its
/// answer is never cached, so the target can be moved while workers run.
///
/// # Example
///
/// ```
/// use pacecrab::{Rate, RateSpec};
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicU64, Ordering};
///
/// let target = Arc::new(AtomicU64::new(100));
/// let handle = target.clone();
/// let spec = RateSpec::dynamic(move || Rate::per_hour(handle.load(Ordering::Relaxed)));
///
/// assert_eq!(spec.resolve().calls_per_hour(), 100);
/// target.store(250, Ordering::Relaxed);
/// assert_eq!(spec.resolve().calls_per_hour(), 250);
/// ```
#[derive(Clone)]
pub enum RateSpec {
    /// A rate fixed for the life of the pacer
    Fixed(Rate),
    /// A zero-argument resolver queried every time
    Dynamic(Arc<dyn Fn() -> Rate + Send + Sync>),
}

impl RateSpec {
    /// Wrap a resolver closure
    pub fn dynamic<F>(resolver: F) -> Self
    where
        F: Fn() -> Rate + Send + Sync + 'static,
    {
        RateSpec::Dynamic(Arc::new(resolver))
    }

    /// The rate in effect right now
    pub fn resolve(&self) -> Rate {
        match self {
            RateSpec::Fixed(rate) => *rate,
            RateSpec::Dynamic(resolver) => resolver(),
        }
    }
}

impl From<Rate> for RateSpec {
    fn from(rate: Rate) -> Self {
        RateSpec::Fixed(rate)
    }
}

impl fmt::Debug for RateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateSpec::Fixed(rate) => f.debug_tuple("Fixed").field(rate).finish(),
            RateSpec::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}
