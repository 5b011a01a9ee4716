//! Advisory file locks.
//!
//! Every node has a sidecar `<id>.lock` file; holding an exclusive `flock`
//! on it serializes all access to the node, across threads and processes.
//! Folder-wide operations go through the ticket queue in [`queue`].

pub mod queue;

use crate::error::{Result, StoreError};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub use queue::{Clock, ManualClock, SystemClock, Ticket, TicketQueue, TicketState, QUEUE_FOLDER};

/// An exclusive lock on a lock file, released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until the lock on `path` is held, creating the file if needed.
    ///
    /// Polls every `poll` until `timeout` elapses, then fails with
    /// [`StoreError::LockTimeout`].
    pub fn acquire(path: &Path, timeout: Duration, poll: Duration) -> Result<Self> {
        let started = Instant::now();

        loop {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?;

            loop {
                match file.try_lock_exclusive() {
                    Ok(()) => break,
                    Err(e) if is_contended(&e) => {
                        if started.elapsed() >= timeout {
                            log::warn!("Lock timeout on {}", path.display());
                            return Err(StoreError::LockTimeout {
                                path: path.to_path_buf(),
                                waited: started.elapsed(),
                            });
                        }
                        std::thread::sleep(poll);
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            // The file may have been cleaned up and recreated while we waited;
            // a lock on an unlinked inode excludes nobody.
            if still_linked(&file, path) {
                return Ok(FileLock {
                    file,
                    path: path.to_path_buf(),
                });
            }
            let _ = FileExt::unlock(&file);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            log::warn!("Failed to release lock {}: {e}", self.path.display());
        }
    }
}

/// Run `action` while holding the lock on `path`. The lock is released
/// whether the action succeeds or fails.
pub fn with_lock<T>(
    path: &Path,
    timeout: Duration,
    poll: Duration,
    action: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let _lock = FileLock::acquire(path, timeout, poll)?;
    action()
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == fs2::lock_contended_error().kind()
        || e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (file.metadata(), std::fs::metadata(path)) {
        (Ok(held), Ok(current)) => held.ino() == current.ino() && held.dev() == current.dev(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn still_linked(_file: &File, path: &Path) -> bool {
    path.exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const POLL: Duration = Duration::from_millis(1);

    #[test]
    fn test_acquire_creates_lock_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("a.lock");
        let lock = FileLock::acquire(&path, Duration::from_secs(1), POLL).unwrap();
        assert!(path.exists());
        assert_eq!(lock.path(), path);
    }

    #[test]
    fn test_second_acquire_times_out() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("a.lock");
        let _held = FileLock::acquire(&path, Duration::from_secs(1), POLL).unwrap();

        let err = FileLock::acquire(&path, Duration::from_millis(30), POLL).unwrap_err();
        assert!(err.is_lock_timeout());
    }

    #[test]
    fn test_release_on_drop() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("a.lock");
        drop(FileLock::acquire(&path, Duration::from_secs(1), POLL).unwrap());
        FileLock::acquire(&path, Duration::from_millis(30), POLL).unwrap();
    }

    #[test]
    fn test_with_lock_releases_after_failure() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("a.lock");

        let result: Result<()> = with_lock(&path, Duration::from_secs(1), POLL, || {
            Err(StoreError::Query("boom".into()))
        });
        assert!(result.is_err());

        let value = with_lock(&path, Duration::from_millis(30), POLL, || Ok(7)).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_threads_are_serialized() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("a.lock");
        let inside = AtomicUsize::new(0);
        let max_inside = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..10 {
                        with_lock(&path, Duration::from_secs(10), POLL, || {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            max_inside.fetch_max(now, Ordering::SeqCst);
                            std::thread::sleep(Duration::from_micros(200));
                            inside.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .unwrap();
                    }
                });
            }
        });

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }
}
