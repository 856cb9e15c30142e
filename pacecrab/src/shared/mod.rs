//! File-backed JSON documents shared between processes
//!
//! A [`SharedJson`] pairs a data file with a lock file. Every access takes an
//! exclusive lock on the lock file for its whole duration, so a
//! read-modify-write through [`SharedJson::locked`] is atomic with respect to
//! every other process and thread using the same pair of paths.
//!
//! Writes go to a temporary file that is then renamed over the data file, so
//! a reader never observes a partially written document.

mod factory;
mod lock;
#[cfg(test)]
mod tests;

pub use factory::{InitialData, LastWorkerCallback, SharedJsonFactory, SharedJsonOptions};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use lock::FileLock;

/// Prefix of the data files created by [`SharedJsonFactory`]
pub const SHARED_FILE_PREFIX: &str = "pacecrab_";

/// Errors raised while accessing a shared document
#[derive(Debug, thiserror::Error)]
pub enum SharedStateError {
    /// The lock could not be acquired in time
    #[error("timed out after {:.2}s waiting for lock {}", .timeout.as_secs_f64(), .path.display())]
    LockTimeout { path: PathBuf, timeout: Duration },

    /// Reading, writing or locking a file failed
    #[error("shared state I/O error: {0}")]
    Io(#[from] io::Error),

    /// The document is not valid JSON or does not have the expected shape
    #[error("shared state is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Handle on a JSON document shared between processes
///
/// The handle is only a pair of paths and a timeout: cloning it is cheap and
/// clones in other threads or processes coordinate through the lock file.
///
/// # Example
///
/// ```
/// use pacecrab::SharedJson;
/// use serde_json::json;
///
/// let dir = tempfile::tempdir().unwrap();
/// let shared = SharedJson::new(dir.path().join("counter.json"), dir.path().join("counter.lock"));
///
/// shared
///     .locked_dict(|doc| {
///         let count = doc.get("count").and_then(|v| v.as_u64()).unwrap_or(0);
///         doc.insert("count".into(), json!(count + 1));
///         Ok::<_, pacecrab::SharedStateError>(())
///     })
///     .unwrap();
///
/// assert_eq!(shared.read_dict().unwrap()["count"], 1);
/// ```
#[derive(Debug, Clone)]
pub struct SharedJson {
    data_file: PathBuf,
    lock_file: PathBuf,
    timeout: Option<Duration>,
}

impl SharedJson {
    /// Create a handle; nothing is touched on disk until the first access
    pub fn new(data_file: impl Into<PathBuf>, lock_file: impl Into<PathBuf>) -> Self {
        SharedJson {
            data_file: data_file.into(),
            lock_file: lock_file.into(),
            timeout: None,
        }
    }

    /// Limit how long each access waits for the lock (`None` waits forever)
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn data_file(&self) -> &Path {
        &self.data_file
    }

    pub fn lock_file(&self) -> &Path {
        &self.lock_file
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Name of the document: the data file stem without the factory prefix
    pub fn name(&self) -> String {
        let stem = self
            .data_file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        match stem.strip_prefix(SHARED_FILE_PREFIX) {
            Some(name) => name.to_string(),
            None => stem,
        }
    }

    /// Atomic read-modify-write of the document
    ///
    /// Loads the document (the default value if the file is missing or
    /// empty), hands a mutable copy to `f`, and writes it back only if `f`
    /// returns `Ok`. On `Err` or panic the file is left untouched. The lock is
    /// held for the whole call and released on every exit path.
    ///
    /// # Errors
    ///
    /// Lock, I/O and JSON failures are converted into `E`; the closure's own
    /// errors are returned unchanged.
    pub fn locked<T, R, E, F>(&self, f: F) -> Result<R, E>
    where
        T: Serialize + DeserializeOwned + Default,
        E: From<SharedStateError>,
        F: FnOnce(&mut T) -> Result<R, E>,
    {
        let _guard = FileLock::acquire(&self.lock_file, self.timeout)?;
        let mut doc: T = self.load()?;
        let result = f(&mut doc)?;
        self.store(&doc)?;
        Ok(result)
    }

    /// [`locked`](Self::locked) over an untyped JSON object
    pub fn locked_dict<R, E, F>(&self, f: F) -> Result<R, E>
    where
        E: From<SharedStateError>,
        F: FnOnce(&mut Map<String, Value>) -> Result<R, E>,
    {
        self.locked(f)
    }

    /// Snapshot of the document taken under the lock; never writes
    pub fn read<T>(&self) -> Result<T, SharedStateError>
    where
        T: DeserializeOwned + Default,
    {
        let _guard = FileLock::acquire(&self.lock_file, self.timeout)?;
        self.load()
    }

    /// [`read`](Self::read) as an untyped JSON object
    pub fn read_dict(&self) -> Result<Map<String, Value>, SharedStateError> {
        self.read()
    }

    /// Set the given top-level keys, keeping all others
    pub fn update(&self, updates: Map<String, Value>) -> Result<(), SharedStateError> {
        self.locked_dict(|doc| {
            doc.extend(updates);
            Ok(())
        })
    }

    fn load<T>(&self) -> Result<T, SharedStateError>
    where
        T: DeserializeOwned + Default,
    {
        let content = match fs::read(&self.data_file) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(T::default()),
            Err(e) => return Err(e.into()),
        };
        if content.iter().all(u8::is_ascii_whitespace) {
            return Ok(T::default());
        }
        Ok(serde_json::from_slice(&content)?)
    }

    fn store<T: Serialize>(&self, doc: &T) -> Result<(), SharedStateError> {
        let content = serde_json::to_vec_pretty(doc)?;
        write_atomic(&self.data_file, &content)
    }
}

/// Write and fsync a sibling temporary file, then rename it over `path`
pub(crate) fn write_atomic(path: &Path, content: &[u8]) -> Result<(), SharedStateError> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        fs::create_dir_all(parent)?;
    }

    let tmp_name = format!(
        ".{}.tmp-{}",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("shared"),
        std::process::id()
    );
    let tmp_path = match parent {
        Some(parent) => parent.join(&tmp_name),
        None => PathBuf::from(&tmp_name),
    };

    let written = fs::File::create(&tmp_path).and_then(|mut file| {
        file.write_all(content)?;
        file.sync_all()
    });
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    Ok(())
}
