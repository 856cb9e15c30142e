//! Layout of the document a pacer keeps in its shared JSON file

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::SystemTime;

use super::bucket::BucketState;
use super::metrics::Statistics;
use super::unix_seconds;

/// The pacer's view of its shared document
///
/// Every field is optional on disk so an empty document (`{}`) is a valid,
/// never-used pacer. Keys the pacer does not know about are kept in `extra`
/// and written back untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PacerState {
    /// Unix timestamp of the first reservation ever granted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<f64>,
    /// Reservations granted so far, across all processes
    #[serde(default)]
    pub call_count: u64,
    /// Reservations whose protected section failed
    #[serde(default)]
    pub exceptions: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_bucket: Option<BucketState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<Statistics>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PacerState {
    /// Seconds since the first reservation, zero if there was none
    pub fn elapsed_time(&self, now: SystemTime) -> f64 {
        match self.start_time {
            Some(start) => unix_seconds(now) - start,
            None => 0.0,
        }
    }

    /// Whether a reservation has ever been granted against this document
    pub fn is_started(&self) -> bool {
        self.start_time.is_some()
    }
}
