use super::{PacerMetrics, Statistics};

#[test]
fn test_updates_do_not_mutate_input() {
    let metrics = PacerMetrics::default();
    let first = metrics.update_duration_stats(None, 0.1);
    let second = metrics.update_duration_stats(Some(&first), 0.2);

    assert_eq!(first.sample_count, 1);
    assert_eq!(second.sample_count, 2);
    assert_eq!(first.duration_digest.as_ref().unwrap().count(), 1);
    assert_eq!(second.duration_digest.as_ref().unwrap().count(), 2);
}

#[test]
fn test_wait_stats_do_not_count_samples() {
    let metrics = PacerMetrics::default();
    let stats = metrics.update_wait_stats(None, 1.5);
    assert_eq!(stats.sample_count, 0);
    assert_eq!(stats.wait_digest.unwrap().max(), Some(1.5));
}

#[test]
fn test_digests_hidden_below_min_samples() {
    let metrics = PacerMetrics::new(vec![60], 10);
    let mut stats: Option<Statistics> = None;
    for i in 0..9 {
        stats = Some(metrics.record_call(stats.as_ref(), 0.01 * i as f64, 0.0, 1000.0 + i as f64));
    }
    assert_eq!(metrics.sample_count(stats.as_ref()), 9);
    assert!(metrics.duration_digest(stats.as_ref()).is_none());
    assert!(metrics.wait_digest(stats.as_ref()).is_none());

    let stats = metrics.record_call(stats.as_ref(), 0.09, 0.5, 1009.0);
    assert_eq!(metrics.sample_count(Some(&stats)), 10);
    let durations = metrics.duration_digest(Some(&stats)).unwrap();
    assert_eq!(durations.count(), 10);
    assert_eq!(metrics.wait_digest(Some(&stats)).unwrap().max(), Some(0.5));
}

#[test]
fn test_timestamps_pruned_to_largest_window() {
    let metrics = PacerMetrics::new(vec![10, 30], 10);
    let mut stats = None;
    for ts in [100.0, 110.0, 125.0, 131.0, 140.0] {
        stats = Some(metrics.track_call_timestamp(stats.as_ref(), ts));
    }
    // 140 - 30 = 110 is the oldest allowed entry
    assert_eq!(stats.unwrap().call_timestamps, vec![110.0, 125.0, 131.0, 140.0]);
}

#[test]
fn test_out_of_order_timestamps_stay_sorted() {
    let metrics = PacerMetrics::new(vec![60], 10);
    let stats = metrics.track_call_timestamp(None, 50.0);
    let stats = metrics.track_call_timestamp(Some(&stats), 70.0);
    let stats = metrics.track_call_timestamp(Some(&stats), 60.0);
    assert_eq!(stats.call_timestamps, vec![50.0, 60.0, 70.0]);

    // A late entry older than the window is dropped right away
    let stats = metrics.track_call_timestamp(Some(&stats), 5.0);
    assert_eq!(stats.call_timestamps, vec![50.0, 60.0, 70.0]);
}

#[test]
fn test_no_windows_keeps_no_timestamps() {
    let metrics = PacerMetrics::new(Vec::new(), 10);
    let stats = metrics.track_call_timestamp(None, 1.0);
    assert!(stats.call_timestamps.is_empty());
    assert!(metrics.windowed_rates(Some(&stats), 2.0).is_empty());
}

#[test]
fn test_windowed_rates() {
    let metrics = PacerMetrics::new(vec![60, 300, 900], 10);
    let now = 10_000.0;
    let mut stats = None;
    // 6 calls in the last minute, 10 in the last five minutes
    for offset in [250.0, 200.0, 150.0, 100.0, 50.0, 40.0, 30.0, 20.0, 10.0, 1.0] {
        stats = Some(metrics.track_call_timestamp(stats.as_ref(), now - offset));
    }

    let rates = metrics.windowed_rates(stats.as_ref(), now);
    assert_eq!(rates[&60], 6.0 / 60.0 * 3600.0);
    assert_eq!(rates[&300], 10.0 / 300.0 * 3600.0);
    assert_eq!(rates[&900], 10.0 / 900.0 * 3600.0);
}

#[test]
fn test_windowed_rates_without_statistics() {
    let metrics = PacerMetrics::default();
    let rates = metrics.windowed_rates(None, 0.0);
    assert_eq!(rates.len(), 3);
    assert!(rates.values().all(|rate| *rate == 0.0));
}
