use super::RateMonitor;
use crate::core::events::PacerEvent;
use crate::core::{
    DriftEvent, MaxCallsEvent, PacerMetrics, PacerState, PeriodicCheckEvent, unix_seconds,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

fn snapshot(started_ago: f64, call_count: u64, now: SystemTime) -> PacerState {
    PacerState {
        start_time: Some(unix_seconds(now) - started_ago),
        call_count,
        ..PacerState::default()
    }
}

#[test]
fn test_drift_formula() {
    assert_eq!(RateMonitor::drift(150.0, 100.0), 0.5);
    assert_eq!(RateMonitor::drift(50.0, 100.0), 0.5);
    assert_eq!(RateMonitor::drift(0.0, 0.0), 0.0);
    assert_eq!(RateMonitor::drift(1.0, 0.0), f64::INFINITY);
    assert_eq!(RateMonitor::current_rate(10, 3600.0), 10.0);
    assert_eq!(RateMonitor::current_rate(10, 0.0), 0.0);
}

#[test]
fn test_drift_handler_fires_on_fast_calls() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let monitor = RateMonitor::new(0.5, 60.0).with_drift_handler(Some(Arc::new(move |event: &DriftEvent| {
        sink.lock().unwrap().push(event.clone());
    })));

    // Ten calls in 61 seconds against a 100/hr target
    let now = SystemTime::now();
    let state = snapshot(61.0, 10, now);
    let drift = monitor.check_rate(&state, "fast", 100.0, now).unwrap();
    assert!(drift > 0.5);

    let events = seen.lock().unwrap();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.limiter_id(), "fast");
    assert_eq!(event.call_count(), 10);
    assert_eq!(event.target_rate, 100.0);
    assert_eq!(event.max_drift, 0.5);
    assert!((event.current_rate - 10.0 / 61.0 * 3600.0).abs() < 1e-6);
    assert!(event.drift > 0.5);
}

#[test]
fn test_no_check_before_first_check_delay() {
    let fired = Arc::new(Mutex::new(0));
    let counter = fired.clone();
    let monitor = RateMonitor::new(0.1, 60.0).with_drift_handler(Some(Arc::new(move |_: &DriftEvent| {
        *counter.lock().unwrap() += 1;
    })));

    let now = SystemTime::now();
    assert_eq!(monitor.check_rate(&snapshot(30.0, 1000, now), "early", 1.0, now), None);
    assert_eq!(monitor.check_rate(&PacerState::default(), "unused", 1.0, now), None);
    assert_eq!(*fired.lock().unwrap(), 0);
}

#[test]
fn test_drift_within_tolerance_is_silent() {
    let fired = Arc::new(Mutex::new(0));
    let counter = fired.clone();
    let monitor = RateMonitor::new(0.1, 0.0).with_drift_handler(Some(Arc::new(move |_: &DriftEvent| {
        *counter.lock().unwrap() += 1;
    })));

    // 100 calls in an hour against 100/hr
    let now = SystemTime::now();
    let drift = monitor
        .check_rate(&snapshot(3600.0, 100, now), "steady", 100.0, now)
        .unwrap();
    assert!(drift < 1e-6);
    assert_eq!(*fired.lock().unwrap(), 0);
}

#[test]
fn test_max_calls_fires_only_at_threshold() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let monitor = RateMonitor::new(0.1, 60.0).with_max_calls_handler(Some(Arc::new(
        move |event: &MaxCallsEvent| {
            sink.lock()
                .unwrap()
                .push((event.limiter_id.clone(), event.call_count(), event.max_calls));
        },
    )));

    let now = SystemTime::now();
    for count in 1..=5 {
        monitor.check_max_calls(&snapshot(1.0, count, now), "limited", Some(3));
    }
    // Disabled limits never fire
    monitor.check_max_calls(&snapshot(1.0, 3, now), "limited", None);
    monitor.check_max_calls(&snapshot(1.0, 0, now), "limited", Some(0));

    assert_eq!(*seen.lock().unwrap(), vec![("limited".to_string(), 3, 3)]);
}

#[test]
fn test_panicking_handler_is_contained() {
    let monitor = RateMonitor::new(0.0, 0.0)
        .with_drift_handler(Some(Arc::new(|event: &DriftEvent| {
            if event.drift > 0.0 {
                panic!("drift handler exploded");
            }
        })));

    let now = SystemTime::now();
    let drift = monitor.check_rate(&snapshot(10.0, 100, now), "boom", 1.0, now);
    assert!(drift.is_some());
}

#[test]
fn test_periodic_check_without_enough_samples() {
    let seen: Arc<Mutex<Vec<PeriodicCheckEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let monitor = RateMonitor::new(0.1, 60.0)
        .with_worker_count(4)
        .with_periodic_check_handler(Some(Arc::new(move |event: &PeriodicCheckEvent| {
            sink.lock().unwrap().push(event.clone());
        })));

    let now = SystemTime::now();
    let metrics = PacerMetrics::default();
    monitor.periodic_check(&snapshot(5.0, 10, now), "periodic", 3600.0, &metrics, now);

    let events = seen.lock().unwrap();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.worker_count, 4);
    assert_eq!(event.sample_count, 0);
    assert!(event.duration_digest.is_none());
    assert_eq!(event.duration_p50(), None);
    assert_eq!(event.wait_ratio(), None);
    assert_eq!(event.drift, None);
    assert!((event.current_rate - 10.0 / 5.0 * 3600.0).abs() < 1.0);
    assert!(event.to_string().ends_with("drift=N/A"));
}

#[test]
fn test_periodic_check_with_statistics() {
    let seen: Arc<Mutex<Vec<PeriodicCheckEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let monitor = RateMonitor::new(0.1, 60.0).with_periodic_check_handler(Some(Arc::new(
        move |event: &PeriodicCheckEvent| {
            sink.lock().unwrap().push(event.clone());
        },
    )));

    let now = SystemTime::now();
    let metrics = PacerMetrics::new(vec![60, 300], 10);
    let mut state = snapshot(120.0, 20, now);
    let mut stats = None;
    for i in 0..20 {
        let ts = unix_seconds(now - Duration::from_secs(i * 5 + 1));
        stats = Some(metrics.record_call(stats.as_ref(), 0.2, 0.4, ts));
    }
    state.statistics = stats;

    monitor.periodic_check(&state, "stats", 600.0, &metrics, now);

    let events = seen.lock().unwrap();
    let event = &events[0];
    assert_eq!(event.sample_count, 20);
    assert!((event.duration_p50().unwrap() - 0.2).abs() < 1e-9);
    assert!((event.wait_p99().unwrap() - 0.4).abs() < 1e-9);
    assert!((event.wait_ratio().unwrap() - 2.0).abs() < 1e-9);
    // Calls at 1, 6, .., 56 seconds ago fall in the last minute
    assert_eq!(event.windowed_rates[&60], 12.0 / 60.0 * 3600.0);
    assert_eq!(event.windowed_rates[&300], 20.0 / 300.0 * 3600.0);
    // 20 calls in 120s is 600/hr: no drift
    assert!(event.drift.unwrap() < 1e-6);
    assert!(event.to_string().contains("wait_ratio=2.00"));
}
