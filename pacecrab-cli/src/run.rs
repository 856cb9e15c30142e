//! The `run` command: spawn workers and aggregate their reports

use anyhow::{Context, Result, anyhow};
use std::fs;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Instant;

use crate::config::PacerArgs;
use crate::report::{RunSummary, WorkerReport};

pub fn run(args: &PacerArgs, workers: usize, log_level: &str) -> Result<RunSummary> {
    if workers == 0 {
        return Err(anyhow!("--workers must be at least 1"));
    }

    let dir = match &args.dir {
        Some(dir) => dir.clone(),
        None => default_dir(),
    };
    fs::create_dir_all(&dir)
        .with_context(|| format!("cannot create shared directory {}", dir.display()))?;

    let exe = std::env::current_exe().context("cannot locate the pacecrab executable")?;
    tracing::info!(
        "Starting {} workers for pacer {} at {}/s in {}",
        workers,
        args.name,
        args.per_second,
        dir.display()
    );

    let started = Instant::now();
    let mut children: Vec<(String, Child)> = Vec::with_capacity(workers);
    for i in 0..workers {
        let worker_id = format!("worker-{i}");
        let child = Command::new(&exe)
            .arg("--log-level")
            .arg(log_level)
            .arg("worker")
            .args(args.to_args(&dir))
            .arg("--worker-id")
            .arg(&worker_id)
            .arg("--workers")
            .arg(workers.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("cannot spawn {worker_id}"))?;
        children.push((worker_id, child));
    }

    let mut reports = Vec::with_capacity(workers);
    let mut failures = Vec::new();
    for (worker_id, child) in children {
        let output = child
            .wait_with_output()
            .with_context(|| format!("cannot wait for {worker_id}"))?;
        if !output.status.success() {
            tracing::error!("{} exited with {}", worker_id, output.status);
            failures.push(worker_id);
            continue;
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| anyhow!("{worker_id} printed no report"))?;
        let report: WorkerReport = serde_json::from_str(line)
            .with_context(|| format!("invalid report from {worker_id}"))?;
        reports.push(report);
    }
    let elapsed = started.elapsed().as_secs_f64();

    if args.dir.is_none() {
        // The last worker already removed the shared files
        if let Err(e) = fs::remove_dir(&dir) {
            tracing::warn!("Failed to remove {}: {}", dir.display(), e);
        }
    }

    if !failures.is_empty() {
        return Err(anyhow!("workers failed: {}", failures.join(", ")));
    }

    let summary = RunSummary::from_reports(&args.name, args.per_second, elapsed, &reports);
    tracing::info!(
        "Pacer {}: {} calls in {:.2}s ({:.2}/s, target {:.2}/s), max wait {:.2}s",
        summary.name,
        summary.calls,
        summary.elapsed_secs,
        summary.observed_per_second,
        summary.target_per_second,
        summary.max_wait_secs
    );
    Ok(summary)
}

fn default_dir() -> PathBuf {
    std::env::temp_dir().join(format!("pacecrab-{}", std::process::id()))
}
