//! Exclusive advisory lock on a lock file
//!
//! Every acquisition opens its own handle. Advisory locks belong to the open
//! file, so two handles conflict whether they live in different processes or
//! in different threads of the same one.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use super::SharedStateError;

/// Delay between two attempts on a contended lock
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Guard holding the lock; dropping it releases the lock
#[derive(Debug)]
pub(crate) struct FileLock {
    file: File,
}

impl FileLock {
    /// Lock `path`, creating it if needed
    ///
    /// With a timeout the lock is polled until the deadline, then
    /// [`SharedStateError::LockTimeout`] is returned. Without one this
    /// blocks until the lock is free.
    pub(crate) fn acquire(path: &Path, timeout: Option<Duration>) -> Result<Self, SharedStateError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let Some(timeout) = timeout else {
            file.lock_exclusive()?;
            return Ok(FileLock { file });
        };

        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(FileLock { file }),
                Err(e) if is_contended(&e) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(SharedStateError::LockTimeout {
                            path: path.to_path_buf(),
                            timeout,
                        });
                    }
                    thread::sleep(POLL_INTERVAL.min(deadline - now));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Closing the handle releases the lock as well
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!("Failed to release file lock: {}", e);
        }
    }
}

fn is_contended(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::WouldBlock
        || error.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
