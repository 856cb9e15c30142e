//! Reservation-based token bucket
//!
//! This module provides the pure half of the pacing protocol. [`TokenBucket::reserve`]
//! looks at the persisted [`BucketState`] and the current time and decides how
//! long the caller has to wait, returning a fresh state for the caller to
//! persist under the shared-state lock. Nothing here sleeps, locks or mutates
//! its input.
//!
//! A reservation always moves `last_refill_time` to its own target time. A
//! second caller that arrives before that time sees no tokens at all and is
//! queued behind the first slot, so two reservations can never be handed the
//! same slot even though the sleeping happens after the lock is released.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

use super::{PacerError, Rate, seconds_to_duration, unix_seconds};


/// Persisted bucket fields (the `token_bucket` object of the shared document)
///
/// `tokens` is the token count as of `last_refill_time`. That instant may lie
/// in the future when slots have been reserved ahead of the clock.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    /// Unix timestamp the token count refers to
    pub last_refill_time: f64,
    /// Tokens left at `last_refill_time`
    pub tokens: f64,
}

/// Outcome of a granted reservation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reservation {
    /// Seconds the caller has to wait before proceeding (0 if none)
    pub wait_time: f64,
    /// Unix timestamp of the slot assigned to this reservation
    pub target_time: f64,
    /// Bucket state to persist
    pub state: BucketState,
}

impl Reservation {
    /// The computed wait as a `Duration`
    pub fn wait(&self) -> Duration {
        seconds_to_duration(self.wait_time)
    }

    /// Time still to sleep at `now` to reach the assigned slot
    ///
    /// Recomputed against the clock so that time spent between the decision
    /// and the sleep is not waited twice.
    pub fn remaining_wait(&self, now: SystemTime) -> Duration {
        seconds_to_duration(self.target_time - unix_seconds(now))
    }
}

/// Token bucket parameters for one reservation
///
/// Cheap to build, so a pacer with a dynamic rate creates one per call with
/// the rate resolved at that moment.
///
/// # Example
///
/// ```
/// use pacecrab::{Rate, TokenBucket};
/// use std::time::{Duration, SystemTime};
///
/// // One call per second, no burst
/// let bucket = TokenBucket::new(Rate::per_second(1), 1);
/// let now = SystemTime::now();
///
/// let first = bucket.reserve(None, now, "api", None).unwrap();
/// assert_eq!(first.wait_time, 0.0);
///
/// // Same instant: the second caller is queued one second behind
/// let second = bucket.reserve(Some(&first.state), now, "api", None).unwrap();
/// assert!((second.wait_time - 1.0).abs() < 1e-9);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TokenBucket {
    rate: Rate,
    burst_capacity: u64,
}

impl TokenBucket {
    /// Create a bucket refilling at `rate` and holding at most `burst_capacity` tokens
    pub fn new(rate: Rate, burst_capacity: u64) -> Self {
        TokenBucket {
            rate,
            burst_capacity,
        }
    }

    /// Default ceiling for a rate: 10% of the hourly rate, at least one token
    pub fn default_burst_capacity(rate: Rate) -> u64 {
        (rate.calls_per_hour() / 10).max(1)
    }

    pub fn rate(&self) -> Rate {
        self.rate
    }

    pub fn burst_capacity(&self) -> u64 {
        self.burst_capacity
    }

    /// State of a bucket that has never been used: full, refilled at `now`
    pub fn initial_state(&self, now: f64) -> BucketState {
        BucketState {
            last_refill_time: now,
            tokens: self.burst_capacity as f64,
        }
    }

    /// Tokens available at `now`, capped at the burst capacity
    fn refill(&self, state: &BucketState, now: f64) -> f64 {
        let elapsed = now - state.last_refill_time;
        if elapsed < 0.0 {
            return 0.0;
        }
        let refilled = state.tokens + elapsed * self.rate.tokens_per_second();
        refilled.min(self.burst_capacity as f64)
    }

    /// Seconds needed to repay the debt that taking one token would create
    fn debt_wait(&self, available: f64) -> f64 {
        if available >= 1.0 {
            return 0.0;
        }
        (available - 1.0).abs() / self.rate.tokens_per_second()
    }

    /// Reserve one token slot
    ///
    /// # Parameters
    ///
    /// - `state`: Persisted bucket state, `None` if the bucket was never used
    /// - `now`: Current wall-clock time
    /// - `limiter_id`: Pacer name, reported in timeout errors
    /// - `timeout`: Longest acceptable wait, `None` to accept any wait
    ///
    /// # Errors
    ///
    /// - [`PacerError::Timeout`]: The required wait exceeds `timeout`. No
    ///   reservation is made and the caller must not persist anything.
    /// - [`PacerError::InvalidConfig`]: The rate is zero
    pub fn reserve(
        &self,
        state: Option<&BucketState>,
        now: SystemTime,
        limiter_id: &str,
        timeout: Option<Duration>,
    ) -> Result<Reservation, PacerError> {
        if self.rate.is_zero() {
            return Err(PacerError::InvalidConfig(format!(
                "pacer '{limiter_id}' resolved a zero rate"
            )));
        }

        let now = unix_seconds(now);
        let current = match state {
            Some(state) => *state,
            None => self.initial_state(now),
        };

        let reserved_ahead = current.last_refill_time - now;
        let (available, wait_time) = if reserved_ahead > 0.0 {
            // Slots are already handed out beyond now: queue behind the last one
            (0.0, reserved_ahead + self.debt_wait(0.0))
        } else {
            let available = self.refill(&current, now);
            (available, self.debt_wait(available))
        };

        if let Some(timeout) = timeout {
            if wait_time > timeout.as_secs_f64() {
                return Err(PacerError::Timeout {
                    id: limiter_id.to_string(),
                    timeout,
                    required_wait: seconds_to_duration(wait_time),
                });
            }
        }

        let (target_time, tokens) = if wait_time > 0.0 {
            // The wait refills exactly the missing token, which is then spent
            (now + wait_time, 0.0)
        } else {
            (now, available - 1.0)
        };

        Ok(Reservation {
            wait_time,
            target_time,
            state: BucketState {
                last_refill_time: target_time,
                tokens,
            },
        })
    }
}
