//! JSON reports exchanged between the workers and the `run` command

use pacecrab::PacerState;
use serde::{Deserialize, Serialize};

/// What one worker printed when it was done
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerReport {
    pub worker_id: String,
    pub calls: u64,
    pub timeouts: u64,
    pub total_wait_secs: f64,
    pub max_wait_secs: f64,
    pub elapsed_secs: f64,
    pub is_last: bool,
    /// Shared state as seen by the last worker before cleanup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_state: Option<PacerState>,
}

/// Combined result of a `run`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub name: String,
    pub workers: usize,
    pub calls: u64,
    pub timeouts: u64,
    pub elapsed_secs: f64,
    pub target_per_second: f64,
    pub observed_per_second: f64,
    pub total_wait_secs: f64,
    pub max_wait_secs: f64,
    pub last_workers: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_call_count: Option<u64>,
}

impl RunSummary {
    pub fn from_reports(
        name: &str,
        target_per_second: f64,
        elapsed_secs: f64,
        reports: &[WorkerReport],
    ) -> Self {
        let calls: u64 = reports.iter().map(|r| r.calls).sum();
        let observed_per_second = if elapsed_secs > 0.0 {
            calls as f64 / elapsed_secs
        } else {
            0.0
        };
        RunSummary {
            name: name.to_string(),
            workers: reports.len(),
            calls,
            timeouts: reports.iter().map(|r| r.timeouts).sum(),
            elapsed_secs,
            target_per_second,
            observed_per_second,
            total_wait_secs: reports.iter().map(|r| r.total_wait_secs).sum(),
            max_wait_secs: reports.iter().map(|r| r.max_wait_secs).fold(0.0, f64::max),
            last_workers: reports.iter().filter(|r| r.is_last).count(),
            final_call_count: reports
                .iter()
                .find_map(|r| r.final_state.as_ref().map(|s| s.call_count)),
        }
    }
}
