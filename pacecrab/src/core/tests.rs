use super::*;
use serde_json::json;
use std::time::{Duration, UNIX_EPOCH};

#[test]
fn test_timeout_error_message() {
    let err = PacerError::Timeout {
        id: "api".to_string(),
        timeout: Duration::from_millis(1500),
        required_wait: Duration::from_secs(3),
    };
    assert_eq!(
        err.to_string(),
        "pacer 'api' timeout of 1.50s exceeded, would need to wait 3.00s to acquire a token"
    );
}

#[test]
fn test_empty_document_is_a_fresh_state() {
    let state: PacerState = serde_json::from_str("{}").unwrap();
    assert_eq!(state, PacerState::default());
    assert!(!state.is_started());
    assert_eq!(state.elapsed_time(SystemTime::now()), 0.0);
}

#[test]
fn test_unknown_keys_survive_a_round_trip() {
    let doc = json!({
        "start_time": 100.0,
        "call_count": 3,
        "exceptions": 1,
        "token_bucket": {"last_refill_time": 101.5, "tokens": 0.25},
        "owner": "batch-7",
        "last_worker": 2
    });
    let state: PacerState = serde_json::from_value(doc.clone()).unwrap();
    assert_eq!(state.call_count, 3);
    assert_eq!(state.exceptions, 1);
    assert_eq!(state.token_bucket.unwrap().tokens, 0.25);
    assert_eq!(state.extra["owner"], "batch-7");

    assert_eq!(serde_json::to_value(&state).unwrap(), doc);
}

#[test]
fn test_elapsed_time_since_first_call() {
    let state = PacerState {
        start_time: Some(1_000.0),
        ..PacerState::default()
    };
    let now = UNIX_EPOCH + Duration::from_secs(1_060);
    assert_eq!(state.elapsed_time(now), 60.0);
}

#[test]
fn test_unix_seconds() {
    assert_eq!(unix_seconds(UNIX_EPOCH), 0.0);
    assert_eq!(unix_seconds(UNIX_EPOCH + Duration::from_millis(2500)), 2.5);
    assert_eq!(unix_seconds(UNIX_EPOCH - Duration::from_secs(4)), -4.0);
}

#[test]
fn test_seconds_to_duration_clamps() {
    assert_eq!(seconds_to_duration(1.25), Duration::from_millis(1250));
    assert_eq!(seconds_to_duration(0.0), Duration::ZERO);
    assert_eq!(seconds_to_duration(-3.0), Duration::ZERO);
    assert_eq!(seconds_to_duration(f64::NAN), Duration::ZERO);
    assert_eq!(seconds_to_duration(f64::INFINITY), Duration::MAX);
}
