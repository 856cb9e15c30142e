use super::lock::FileLock;
use super::*;
use serde_json::json;
use std::panic;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Instant;

const TEARDOWN_TRACKER: &str = "pacecrab_factory_teardown.json";

fn shared_in(dir: &Path, name: &str) -> SharedJson {
    SharedJson::new(
        dir.join(format!("{SHARED_FILE_PREFIX}{name}.json")),
        dir.join(format!("{name}_data.lock")),
    )
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

#[test]
fn test_missing_and_empty_files_read_as_empty() {
    let dir = tempfile::tempdir().unwrap();
    let shared = shared_in(dir.path(), "fresh");
    assert!(shared.read_dict().unwrap().is_empty());

    fs::write(shared.data_file(), "  \n").unwrap();
    assert!(shared.read_dict().unwrap().is_empty());
}

#[test]
fn test_name_strips_factory_prefix() {
    let dir = tempfile::tempdir().unwrap();
    assert_eq!(shared_in(dir.path(), "api").name(), "api");
    let plain = SharedJson::new(dir.path().join("plain.json"), dir.path().join("plain.lock"));
    assert_eq!(plain.name(), "plain");
}

#[test]
fn test_locked_persists_on_success() {
    let dir = tempfile::tempdir().unwrap();
    let shared = shared_in(dir.path(), "counter");

    let returned = shared
        .locked_dict(|doc| {
            doc.insert("count".into(), json!(1));
            Ok::<_, SharedStateError>("done")
        })
        .unwrap();
    assert_eq!(returned, "done");
    assert_eq!(shared.read_dict().unwrap()["count"], 1);
}

#[test]
fn test_locked_discards_changes_on_error() {
    let dir = tempfile::tempdir().unwrap();
    let shared = shared_in(dir.path(), "rollback");
    shared.update(object(json!({"count": 1}))).unwrap();

    #[derive(Debug)]
    enum AppError {
        Rejected,
        Shared(SharedStateError),
    }
    impl From<SharedStateError> for AppError {
        fn from(e: SharedStateError) -> Self {
            AppError::Shared(e)
        }
    }

    let result: Result<(), AppError> = shared.locked_dict(|doc| {
        doc.insert("count".into(), json!(99));
        Err(AppError::Rejected)
    });
    assert!(matches!(result, Err(AppError::Rejected)));
    assert_eq!(shared.read_dict().unwrap()["count"], 1);
}

#[test]
fn test_panic_inside_locked_releases_lock_without_writing() {
    let dir = tempfile::tempdir().unwrap();
    let shared = shared_in(dir.path(), "panicky").with_timeout(Some(Duration::from_secs(2)));
    shared.update(object(json!({"count": 1}))).unwrap();

    let outcome = panic::catch_unwind(|| {
        let _ = shared.locked_dict(|doc| -> Result<(), SharedStateError> {
            doc.insert("count".into(), json!(2));
            panic!("boom");
        });
    });
    assert!(outcome.is_err());

    // The lock is free again and nothing was written
    assert_eq!(shared.read_dict().unwrap()["count"], 1);
}

#[test]
fn test_read_leaves_file_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let shared = shared_in(dir.path(), "snapshot");
    shared
        .update(object(json!({"call_count": 4, "nested": {"a": [1, 2]}})))
        .unwrap();

    let before = fs::read(shared.data_file()).unwrap();
    let _: Map<String, Value> = shared.read().unwrap();
    let _ = shared.read_dict().unwrap();
    assert_eq!(fs::read(shared.data_file()).unwrap(), before);
}

#[test]
fn test_update_merges_keys() {
    let dir = tempfile::tempdir().unwrap();
    let shared = shared_in(dir.path(), "merge");
    shared.update(object(json!({"a": 1, "b": 2}))).unwrap();
    shared.update(object(json!({"b": 3, "c": 4}))).unwrap();

    assert_eq!(Value::Object(shared.read_dict().unwrap()), json!({"a": 1, "b": 3, "c": 4}));
}

#[test]
fn test_invalid_json_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let shared = shared_in(dir.path(), "corrupt");
    fs::write(shared.data_file(), "{not json").unwrap();
    assert!(matches!(shared.read_dict(), Err(SharedStateError::Json(_))));
}

#[test]
fn test_lock_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let shared = shared_in(dir.path(), "busy").with_timeout(Some(Duration::from_millis(100)));

    let _held = FileLock::acquire(shared.lock_file(), None).unwrap();
    let started = Instant::now();
    match shared.read_dict() {
        Err(SharedStateError::LockTimeout { path, timeout }) => {
            assert_eq!(path, shared.lock_file());
            assert_eq!(timeout, Duration::from_millis(100));
        }
        other => panic!("expected a lock timeout, got {other:?}"),
    }
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[test]
fn test_names_do_not_share_locks() {
    let dir = tempfile::tempdir().unwrap();
    let first = shared_in(dir.path(), "first");
    let second = shared_in(dir.path(), "second").with_timeout(Some(Duration::from_millis(100)));

    let _held = FileLock::acquire(first.lock_file(), None).unwrap();
    second.update(object(json!({"ok": true}))).unwrap();
    assert_eq!(second.read_dict().unwrap()["ok"], true);
}

#[test]
fn test_concurrent_increments_are_not_lost() {
    let dir = tempfile::tempdir().unwrap();
    let shared = shared_in(dir.path(), "race");

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let shared = shared.clone();
            thread::spawn(move || {
                for _ in 0..25 {
                    shared
                        .locked_dict(|doc| {
                            let count = doc.get("count").and_then(Value::as_u64).unwrap_or(0);
                            doc.insert("count".into(), json!(count + 1));
                            Ok::<_, SharedStateError>(())
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(shared.read_dict().unwrap()["count"], 200);
}

#[test]
fn test_factory_seeds_once() {
    let dir = tempfile::tempdir().unwrap();
    let seeded = Arc::new(AtomicUsize::new(0));

    let options = {
        let seeded = seeded.clone();
        SharedJsonOptions {
            initial: Some(InitialData::lazy(move || {
                seeded.fetch_add(1, Ordering::SeqCst);
                object(json!({"count": 0}))
            })),
            ..Default::default()
        }
    };

    // Two workers, each with its own factory over the same directory
    let first = SharedJsonFactory::new(dir.path());
    let second = SharedJsonFactory::new(dir.path());
    let a = first.create_with("seeded", options.clone()).unwrap();
    a.update(object(json!({"count": 5}))).unwrap();
    let b = second.create_with("seeded", options).unwrap();

    assert_eq!(seeded.load(Ordering::SeqCst), 1);
    assert_eq!(b.read_dict().unwrap()["count"], 5);
    assert!(dir.path().join("pacecrab_seeded.json").exists());
    assert!(dir.path().join("seeded_init.marker").exists());
}

#[test]
fn test_factory_without_seed_leaves_document_absent() {
    let dir = tempfile::tempdir().unwrap();
    let factory = SharedJsonFactory::new(dir.path());
    let shared = factory.create("lazy").unwrap();
    assert!(!shared.data_file().exists());
    assert_eq!(shared.data_file(), dir.path().join("pacecrab_lazy.json"));
    assert_eq!(shared.lock_file(), dir.path().join("lazy_data.lock"));
}

#[test]
fn test_exactly_one_last_worker() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let workers = 6;

    let handles: Vec<_> = (0..workers)
        .map(|i| {
            let dir = dir.path().to_path_buf();
            let calls = calls.clone();
            thread::spawn(move || {
                let factory = SharedJsonFactory::new(&dir);
                let callback: LastWorkerCallback = Arc::new(move |shared: &SharedJson| {
                    assert_eq!(shared.name(), "teardown");
                    calls.fetch_add(1, Ordering::SeqCst);
                });
                let shared = factory
                    .create_with(
                        "teardown",
                        SharedJsonOptions {
                            initial: Some(InitialData::Value(Map::new())),
                            on_last_worker: Some(callback),
                            timeout: None,
                        },
                    )
                    .unwrap();
                shared.update(object(json!({ format!("worker-{i}"): true }))).unwrap();
                factory.finish(&format!("worker-{i}"), workers).unwrap()
            })
        })
        .collect();

    let last: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(last.iter().filter(|is_last| **is_last).count(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!dir.path().join("pacecrab_teardown.json").exists());
    assert!(!dir.path().join("teardown_init.marker").exists());
    assert!(!dir.path().join(TEARDOWN_TRACKER).exists());
}

#[test]
fn test_repeated_finish_is_not_last() {
    let dir = tempfile::tempdir().unwrap();
    let first = SharedJsonFactory::new(dir.path());
    let second = SharedJsonFactory::new(dir.path());

    assert!(!first.finish("gw0", 2).unwrap());
    // The same worker twice does not complete the set
    assert!(!first.finish("gw0", 2).unwrap());
    assert!(second.finish("gw1", 2).unwrap());
}

#[test]
fn test_panicking_last_worker_callback_does_not_stop_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let factory = SharedJsonFactory::new(dir.path());
    let ran = Arc::new(AtomicUsize::new(0));

    factory
        .create_with(
            "exploding",
            SharedJsonOptions {
                on_last_worker: Some(Arc::new(|shared: &SharedJson| {
                    if shared.name() == "exploding" {
                        panic!("teardown failed");
                    }
                })),
                ..Default::default()
            },
        )
        .unwrap();
    let counter = ran.clone();
    let shared = factory
        .create_with(
            "survivor",
            SharedJsonOptions {
                initial: Some(object(json!({"x": 1})).into()),
                on_last_worker: Some(Arc::new(move |_: &SharedJson| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
                timeout: None,
            },
        )
        .unwrap();

    assert!(factory.finish("only", 1).unwrap());
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert!(!shared.data_file().exists());
}

#[test]
fn test_seeding_waits_for_data_lock() {
    use std::sync::atomic::AtomicBool;

    let dir = tempfile::tempdir().unwrap();
    let holder = SharedJsonFactory::new(dir.path()).create("race").unwrap();
    let seeded = Arc::new(AtomicBool::new(false));

    let seeder = holder
        .locked_dict(|doc| {
            let path = dir.path().to_path_buf();
            let done = seeded.clone();
            let seeder = thread::spawn(move || {
                let mut seed = Map::new();
                seed.insert("seed".to_string(), json!(true));
                SharedJsonFactory::new(path)
                    .create_with(
                        "race",
                        SharedJsonOptions {
                            initial: Some(seed.into()),
                            ..Default::default()
                        },
                    )
                    .unwrap();
                done.store(true, Ordering::SeqCst);
            });

            thread::sleep(Duration::from_millis(200));
            assert!(!seeded.load(Ordering::SeqCst), "seed written under a held lock");
            doc.insert("pacer".to_string(), json!(1));
            Ok::<_, SharedStateError>(seeder)
        })
        .unwrap();
    seeder.join().unwrap();

    assert!(seeded.load(Ordering::SeqCst));
    assert_eq!(holder.read_dict().unwrap().get("seed"), Some(&json!(true)));
}

#[test]
fn test_writes_leave_no_temporary_files() {
    let dir = tempfile::tempdir().unwrap();
    let shared = shared_in(dir.path(), "tidy");
    for i in 0..3 {
        shared.update(object(json!({ "step": i }))).unwrap();
    }

    let leftovers: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains(".tmp-"))
        .collect();
    assert!(leftovers.is_empty(), "leftover files: {leftovers:?}");
    assert_eq!(shared.read_dict().unwrap()["step"], 2);
}
