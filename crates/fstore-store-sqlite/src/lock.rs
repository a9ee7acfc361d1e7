//! The write coordinator: an in-process mutex layered over a cross-process
//! advisory file lock.
//!
//! Every database mutation runs while a [`WriteGuard`] is alive. The mutex
//! keeps tasks in this process from racing each other for the file lock; the
//! file lock keeps other processes out. Both are released when the guard is
//! dropped, whichever way the holder exits.

use std::{
  fs::{self, File, OpenOptions},
  future::Future,
  io::{self, ErrorKind},
  path::{Path, PathBuf},
  sync::Arc,
  time::Duration,
};

use fs4::FileExt;
use tokio::{
  sync::{Mutex, OwnedMutexGuard},
  time::Instant,
};
use tracing::{debug, warn};

use crate::{Error, Result};

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(500);

// ─── File lock ───────────────────────────────────────────────────────────────

/// An exclusive lock shared with other OS processes.
pub trait AdvisoryFileLock: Send + Sync {
  /// `Ok(false)` when another holder has the lock.
  fn try_acquire(&self) -> io::Result<bool>;

  fn release(&self) -> io::Result<()>;
}

/// [`AdvisoryFileLock`] on a file: `flock` on unix, `LockFileEx` on Windows.
#[derive(Debug)]
pub struct LockFile {
  path: PathBuf,
  file: File,
}

impl LockFile {
  /// Open (creating if needed) the lock file at `path`. Does not lock it.
  pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
    let path = path.as_ref().to_path_buf();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
      .create(true)
      .read(true)
      .write(true)
      .truncate(false)
      .open(&path)?;
    Ok(Self { path, file })
  }

  pub fn path(&self) -> &Path { &self.path }
}

impl AdvisoryFileLock for LockFile {
  fn try_acquire(&self) -> io::Result<bool> {
    match self.file.try_lock_exclusive() {
      Ok(()) => Ok(true),
      Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(false),
      #[cfg(windows)]
      Err(err) if matches!(err.raw_os_error(), Some(32 | 33)) => Ok(false),
      Err(err) => Err(err),
    }
  }

  fn release(&self) -> io::Result<()> { FileExt::unlock(&self.file) }
}

// ─── Coordinator ─────────────────────────────────────────────────────────────

/// Hands out [`WriteGuard`]s. Cloning shares the same locks.
#[derive(Clone)]
pub struct WriteCoordinator {
  local: Arc<Mutex<()>>,
  file:  Arc<dyn AdvisoryFileLock>,
}

impl WriteCoordinator {
  pub fn new(file: Arc<dyn AdvisoryFileLock>) -> Self {
    Self { local: Arc::new(Mutex::new(())), file }
  }

  /// A coordinator over a [`LockFile`] at `path`.
  pub fn open(path: impl AsRef<Path>) -> Result<Self> {
    Ok(Self::new(Arc::new(LockFile::open(path)?)))
  }

  /// Take both locks, waiting at most `timeout` in total.
  ///
  /// The file lock is polled with exponential backoff. If it cannot be had
  /// before the deadline the in-process mutex is released again and
  /// [`Error::LockTimeout`] is returned.
  pub async fn acquire(&self, timeout: Duration) -> Result<WriteGuard> {
    let deadline = Instant::now() + timeout;

    let local = tokio::time::timeout(timeout, self.local.clone().lock_owned())
      .await
      .map_err(|_| Error::LockTimeout(timeout))?;

    let mut delay = INITIAL_BACKOFF;
    loop {
      match self.file.try_acquire() {
        Ok(true) => {
          debug!("write lock acquired");
          return Ok(WriteGuard { file: self.file.clone(), _local: local });
        }
        Ok(false) => {}
        Err(err) => {
          drop(local);
          return Err(err.into());
        }
      }

      let now = Instant::now();
      if now >= deadline {
        drop(local);
        warn!(?timeout, "timed out waiting for the cross-process write lock");
        return Err(Error::LockTimeout(timeout));
      }
      tokio::time::sleep(delay.min(deadline - now)).await;
      delay = (delay * 2).min(MAX_BACKOFF);
    }
  }

  /// Run `f` while holding the write lock. The guard is handed to `f` and
  /// released when the future it returns completes or is dropped.
  pub async fn with_write_lock<T, E, F, Fut>(&self, timeout: Duration, f: F) -> Result<T, E>
  where
    E: From<Error>,
    F: FnOnce(WriteGuard) -> Fut,
    Fut: Future<Output = Result<T, E>>,
  {
    let guard = self.acquire(timeout).await?;
    f(guard).await
  }
}

/// Proof that the caller holds the write lock. Write methods on
/// [`crate::SqliteStore`] take a reference to one.
pub struct WriteGuard {
  file:   Arc<dyn AdvisoryFileLock>,
  _local: OwnedMutexGuard<()>,
}

impl Drop for WriteGuard {
  fn drop(&mut self) {
    // The file lock goes first so the next local waiter can take it at once.
    if let Err(err) = self.file.release() {
      warn!(error = %err, "failed to release the cross-process write lock");
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

  use super::*;

  #[tokio::test]
  async fn second_process_times_out_then_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fstore.lock");
    // Two coordinators over separate file handles behave like two processes.
    let a = WriteCoordinator::open(&path).unwrap();
    let b = WriteCoordinator::open(&path).unwrap();

    let held = a.acquire(Duration::from_secs(1)).await.unwrap();
    let err = b.acquire(Duration::from_millis(150)).await.err().unwrap();
    assert!(matches!(err, Error::LockTimeout(_)));

    // The failed attempt must not leave b's mutex held.
    assert!(b.local.try_lock().is_ok());

    drop(held);
    b.acquire(Duration::from_secs(1)).await.unwrap();
  }

  #[tokio::test]
  async fn writers_in_one_process_are_serialised() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = WriteCoordinator::open(dir.path().join("fstore.lock")).unwrap();
    let inside = Arc::new(AtomicBool::new(false));
    let done = Arc::new(AtomicU32::new(0));

    let mut tasks = Vec::new();
    for _ in 0..8 {
      let coordinator = coordinator.clone();
      let inside = inside.clone();
      let done = done.clone();
      tasks.push(tokio::spawn(async move {
        let _guard = coordinator.acquire(Duration::from_secs(10)).await.unwrap();
        assert!(!inside.swap(true, Ordering::SeqCst), "two writers overlapped");
        tokio::time::sleep(Duration::from_millis(5)).await;
        inside.store(false, Ordering::SeqCst);
        done.fetch_add(1, Ordering::SeqCst);
      }));
    }
    for task in tasks {
      task.await.unwrap();
    }
    assert_eq!(done.load(Ordering::SeqCst), 8);
  }

  #[tokio::test]
  async fn scoped_lock_is_released_on_error() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = WriteCoordinator::open(dir.path().join("fstore.lock")).unwrap();

    let result: Result<()> = coordinator
      .with_write_lock(Duration::from_secs(1), |_guard| async {
        Err(Error::Decode("boom".into()))
      })
      .await;
    assert!(result.is_err());

    coordinator.acquire(Duration::from_millis(100)).await.unwrap();
  }
}
