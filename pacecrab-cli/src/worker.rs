//! One worker process: paced calls against the shared document

use anyhow::Result;
use pacecrab::{
    PacerError, PacerState, Rate, SharedJson, SharedJsonFactory, SharedJsonOptions,
    TokenBucketPacer,
};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::PacerArgs;
use crate::report::WorkerReport;

pub fn run_worker(
    args: &PacerArgs,
    dir: &Path,
    worker_id: &str,
    workers: usize,
) -> Result<WorkerReport> {
    let factory = SharedJsonFactory::new(dir);

    // Filled by the last worker just before the shared files are removed
    let final_state = Arc::new(Mutex::new(None));
    let slot = final_state.clone();
    let shared = factory.create_with(
        &args.name,
        SharedJsonOptions {
            on_last_worker: Some(Arc::new(move |shared: &SharedJson| {
                match shared.read::<PacerState>() {
                    Ok(state) => {
                        tracing::info!(
                            "Final state for {}: calls={} exceptions={} samples={}",
                            shared.name(),
                            state.call_count,
                            state.exceptions,
                            state.statistics.as_ref().map_or(0, |s| s.sample_count)
                        );
                        if let Ok(mut slot) = slot.lock() {
                            *slot = Some(state);
                        }
                    }
                    Err(e) => tracing::warn!("Failed to read final state: {}", e),
                }
            })),
            ..Default::default()
        },
    )?;

    let mut builder = TokenBucketPacer::builder(shared, Rate::per_second(args.per_second))
        .max_drift(args.max_drift)
        .num_calls_between_checks(args.check_every)
        .worker_count(workers)
        .on_drift(|event| {
            tracing::warn!(
                "Pacer {} drifting: current={:.0}/hr target={:.0}/hr drift={:.1}%",
                event.limiter_id,
                event.current_rate,
                event.target_rate,
                event.drift * 100.0
            )
        })
        .on_periodic_check(|event| tracing::info!("{}", event));
    if let Some(burst) = args.burst {
        builder = builder.burst_capacity(burst);
    }
    let pacer = builder.build()?;

    let work = Duration::from_millis(args.work_ms);
    let started = Instant::now();
    let mut report = WorkerReport {
        worker_id: worker_id.to_string(),
        calls: 0,
        timeouts: 0,
        total_wait_secs: 0.0,
        max_wait_secs: 0.0,
        elapsed_secs: 0.0,
        is_last: false,
        final_state: None,
    };

    for _ in 0..args.calls {
        let outcome = pacer.pace(args.timeout(), |ctx| {
            tracing::debug!(
                "{} call {} after waiting {:.3}s",
                worker_id,
                ctx.call_count,
                ctx.seconds_waited
            );
            if !work.is_zero() {
                thread::sleep(work);
            }
            Ok::<_, PacerError>(ctx.seconds_waited)
        });
        match outcome {
            Ok(waited) => {
                report.calls += 1;
                report.total_wait_secs += waited;
                report.max_wait_secs = report.max_wait_secs.max(waited);
            }
            Err(PacerError::Timeout { required_wait, .. }) => {
                tracing::debug!(
                    "{} skipped a call that needed {:.2}s",
                    worker_id,
                    required_wait.as_secs_f64()
                );
                report.timeouts += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
    report.elapsed_secs = started.elapsed().as_secs_f64();

    report.is_last = factory.finish(worker_id, workers)?;
    report.final_state = final_state.lock().ok().and_then(|mut slot| slot.take());
    Ok(report)
}
