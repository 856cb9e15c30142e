//! Named shared documents with first-worker setup and last-worker teardown
//!
//! Every worker process builds its own [`SharedJsonFactory`] over the same
//! directory. Documents are addressed by name, so workers that ask for the
//! same name end up on the same files:
//!
//! | file                   | purpose                                |
//! |------------------------|----------------------------------------|
//! | `pacecrab_<name>.json` | the document                           |
//! | `<name>_data.lock`     | lock for every access to the document  |
//! | `<name>_init.lock`     | serializes first-worker initialization |
//! | `<name>_init.marker`   | present once the document was seeded   |
//!
//! When a worker is done it calls [`SharedJsonFactory::finish`]. The worker
//! that completes the set runs the registered teardown callbacks and removes
//! the files.

use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::lock::FileLock;
use super::{SHARED_FILE_PREFIX, SharedJson, SharedStateError, write_atomic};
use crate::core::RateSpec;
use crate::core::monitor::panic_message;
use crate::pacer::{PacerBuilder, TokenBucketPacer};

/// Longest wait for the initialization lock
const INIT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest wait for the teardown tracker lock
const TEARDOWN_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

const TEARDOWN_DATA_FILE: &str = "pacecrab_factory_teardown.json";
const TEARDOWN_LOCK_FILE: &str = "teardown.lock";

/// Called by the last worker with the document, before the files are removed
pub type LastWorkerCallback = Arc<dyn Fn(&SharedJson) + Send + Sync>;

/// Document written by the first worker to open a name
#[derive(Clone)]
pub enum InitialData {
    /// Written as is
    Value(Map<String, Value>),
    /// Called once, by the first worker only
    Lazy(Arc<dyn Fn() -> Map<String, Value> + Send + Sync>),
}

impl InitialData {
    pub fn lazy(f: impl Fn() -> Map<String, Value> + Send + Sync + 'static) -> Self {
        InitialData::Lazy(Arc::new(f))
    }

    fn resolve(&self) -> Map<String, Value> {
        match self {
            InitialData::Value(doc) => doc.clone(),
            InitialData::Lazy(f) => f(),
        }
    }
}

impl From<Map<String, Value>> for InitialData {
    fn from(doc: Map<String, Value>) -> Self {
        InitialData::Value(doc)
    }
}

impl fmt::Debug for InitialData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitialData::Value(doc) => f.debug_tuple("Value").field(doc).finish(),
            InitialData::Lazy(_) => f.write_str("Lazy(..)"),
        }
    }
}

/// Options for [`SharedJsonFactory::create_with`]
#[derive(Clone, Default)]
pub struct SharedJsonOptions {
    /// Seed written by the first worker; `None` leaves the document absent
    pub initial: Option<InitialData>,
    /// Run by the last worker in [`SharedJsonFactory::finish`]
    pub on_last_worker: Option<LastWorkerCallback>,
    /// Lock timeout for the returned handle (`None` waits forever)
    pub timeout: Option<Duration>,
}

impl fmt::Debug for SharedJsonOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedJsonOptions")
            .field("initial", &self.initial)
            .field("on_last_worker", &self.on_last_worker.as_ref().map(|_| ".."))
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Default)]
struct Registry {
    created_files: BTreeSet<PathBuf>,
    callbacks: Vec<(SharedJson, LastWorkerCallback)>,
}

/// Creates named [`SharedJson`] documents in one directory
///
/// # Example
///
/// ```
/// use pacecrab::{SharedJsonFactory, SharedJsonOptions, InitialData};
/// use serde_json::{json, Map};
///
/// let dir = tempfile::tempdir().unwrap();
/// let factory = SharedJsonFactory::new(dir.path());
///
/// let mut seed = Map::new();
/// seed.insert("limit".into(), json!(100));
/// let shared = factory
///     .create_with(
///         "quota",
///         SharedJsonOptions {
///             initial: Some(InitialData::Value(seed)),
///             ..Default::default()
///         },
///     )
///     .unwrap();
///
/// assert_eq!(shared.name(), "quota");
/// assert_eq!(shared.read_dict().unwrap()["limit"], 100);
///
/// // Single worker: it is the last one and cleans up
/// assert!(factory.finish("worker-0", 1).unwrap());
/// assert!(!shared.data_file().exists());
/// ```
pub struct SharedJsonFactory {
    dir: PathBuf,
    registry: Mutex<Registry>,
}

impl SharedJsonFactory {
    /// Factory placing its files in `dir`, created on demand
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        SharedJsonFactory {
            dir: dir.into(),
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Handle on the document `name`, without seeding or teardown callback
    pub fn create(&self, name: &str) -> Result<SharedJson, SharedStateError> {
        self.create_with(name, SharedJsonOptions::default())
    }

    /// Handle on the document `name`
    ///
    /// If `options.initial` is set and no worker seeded the document yet,
    /// this worker writes it. The check and the write happen under the
    /// initialization lock, so exactly one worker seeds a given name.
    ///
    /// # Errors
    ///
    /// [`SharedStateError::LockTimeout`] if the initialization lock is held
    /// for more than 30 seconds, or an I/O or JSON error while seeding.
    pub fn create_with(
        &self,
        name: &str,
        options: SharedJsonOptions,
    ) -> Result<SharedJson, SharedStateError> {
        let data_file = self.dir.join(format!("{SHARED_FILE_PREFIX}{name}.json"));
        let data_lock = self.dir.join(format!("{name}_data.lock"));
        let init_lock = self.dir.join(format!("{name}_init.lock"));
        let init_marker = self.dir.join(format!("{name}_init.marker"));

        let shared = SharedJson::new(&data_file, &data_lock).with_timeout(options.timeout);

        if let Some(initial) = &options.initial {
            let _guard = FileLock::acquire(&init_lock, Some(INIT_LOCK_TIMEOUT))?;
            // Seeding is a write like any other: exclude readers and writers of the document
            let _data_guard = FileLock::acquire(&data_lock, options.timeout)?;
            if !init_marker.exists() {
                File::create(&init_marker)?;
                let doc = initial.resolve();
                write_atomic(&data_file, &serde_json::to_vec_pretty(&doc)?)?;
                tracing::debug!("Initialized shared document {}", name);
            }
        }

        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry.created_files.insert(data_file);
        registry.created_files.insert(data_lock);
        registry.created_files.insert(init_lock);
        if init_marker.exists() {
            registry.created_files.insert(init_marker);
        }
        if let Some(callback) = options.on_last_worker {
            registry.callbacks.push((shared.clone(), callback));
        }

        Ok(shared)
    }

    /// Start building a pacer over the document `name`
    pub fn pacer(
        &self,
        name: &str,
        rate: impl Into<RateSpec>,
    ) -> Result<PacerBuilder, SharedStateError> {
        Ok(TokenBucketPacer::builder(self.create(name)?, rate))
    }

    /// Record that `worker_id` is done; returns whether it was the last worker
    ///
    /// Workers are tracked by id in a shared teardown document. The first
    /// call that brings the number of distinct finished workers to
    /// `total_workers` claims the `last_worker` slot; every other call,
    /// including a repeated call from the claiming worker, returns `false`.
    ///
    /// The last worker runs the `on_last_worker` callbacks registered on this
    /// factory, then removes the files it created and the teardown document.
    /// A panicking callback is logged and does not stop the others.
    pub fn finish(&self, worker_id: &str, total_workers: usize) -> Result<bool, SharedStateError> {
        let tracker = SharedJson::new(
            self.dir.join(TEARDOWN_DATA_FILE),
            self.dir.join(TEARDOWN_LOCK_FILE),
        )
        .with_timeout(Some(TEARDOWN_LOCK_TIMEOUT));

        let is_last = tracker.locked_dict(|doc| {
            let total = match doc.get("total_workers").and_then(Value::as_u64) {
                Some(total) => total,
                None => {
                    doc.insert("total_workers".into(), Value::from(total_workers));
                    total_workers as u64
                }
            };

            let mut workers = match doc.remove("finished_workers") {
                Some(Value::Array(workers)) => workers,
                _ => Vec::new(),
            };
            if !workers.iter().any(|w| w.as_str() == Some(worker_id)) {
                workers.push(Value::from(worker_id));
            }
            let finished_count = workers.len() as u64;
            doc.insert("finished_workers".into(), Value::Array(workers));

            let unclaimed = doc.get("last_worker").is_none_or(Value::is_null);
            if unclaimed && finished_count >= total {
                doc.insert("last_worker".into(), Value::from(worker_id));
                return Ok::<_, SharedStateError>(true);
            }
            Ok(false)
        })?;

        if !is_last {
            tracing::debug!("Worker {} finished, not the last one", worker_id);
            return Ok(false);
        }

        tracing::debug!("Worker {} is the last worker, cleaning up", worker_id);
        let registry = {
            let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *registry)
        };

        for (shared, callback) in &registry.callbacks {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(shared))) {
                tracing::error!(
                    "Last-worker callback for {} panicked: {}",
                    shared.name(),
                    panic_message(payload.as_ref())
                );
            }
        }

        for path in &registry.created_files {
            remove_if_exists(path);
        }
        remove_if_exists(tracker.data_file());
        remove_if_exists(tracker.lock_file());

        Ok(true)
    }
}

fn remove_if_exists(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => tracing::debug!("Cleaned up file: {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to clean up file {}: {}", path.display(), e),
    }
}
