//! Deciding whether this process is the Master or a Proxy.

use std::{
  fs::{File, OpenOptions},
  io::{self, ErrorKind},
  path::Path,
  time::Duration,
};

use fs4::FileExt;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{Endpoint, Error, MasterSeat, RemoteStore, Result};

const ELECTION_TIMEOUT: Duration = Duration::from_secs(10);
const INITIAL_BACKOFF: Duration = Duration::from_millis(20);
const MAX_BACKOFF: Duration = Duration::from_millis(500);

/// The outcome of an election.
pub enum Role {
  /// This process owns the endpoint and must serve the store on it.
  Master(MasterSeat),
  /// Another process is Master; every call goes through this client.
  Proxy(RemoteStore),
}

impl Role {
  pub fn is_master(&self) -> bool { matches!(self, Self::Master(_)) }
}

/// Runs the Master/Proxy election on one endpoint.
#[derive(Debug, Clone)]
pub struct ProcessCoordinator {
  endpoint:    Endpoint,
  rpc_timeout: Duration,
}

impl ProcessCoordinator {
  pub fn new(endpoint: Endpoint, rpc_timeout: Duration) -> Self { Self { endpoint, rpc_timeout } }

  pub fn endpoint(&self) -> &Endpoint { &self.endpoint }

  /// Connect to an existing Master, or become the Master.
  ///
  /// A successful connection means a Master is already listening. Otherwise
  /// the process races for the exclusive lock on the master lock file; the
  /// winner binds the endpoint, and a loser keeps probing until the winner is
  /// listening.
  pub async fn elect(&self) -> Result<Role> {
    let deadline = Instant::now() + ELECTION_TIMEOUT;
    let mut backoff = INITIAL_BACKOFF;

    loop {
      if self.endpoint.connect().await.is_ok() {
        info!(endpoint = %self.endpoint, "master already running, acting as proxy");
        return Ok(Role::Proxy(RemoteStore::new(self.endpoint.clone(), self.rpc_timeout)));
      }

      if let Some(lock) = MasterLock::try_acquire(&self.endpoint.master_lock_path())? {
        let listener = self.endpoint.bind().await?;
        info!(endpoint = %self.endpoint, "elected master");
        return Ok(Role::Master(MasterSeat::new(self.endpoint.clone(), listener, lock)));
      }

      if Instant::now() >= deadline {
        return Err(Error::Timeout(ELECTION_TIMEOUT));
      }
      debug!(?backoff, "another process holds the master lock, retrying");
      tokio::time::sleep(backoff).await;
      backoff = (backoff * 2).min(MAX_BACKOFF);
    }
  }
}

/// Exclusive advisory lock held for as long as this process is Master.
#[derive(Debug)]
pub(crate) struct MasterLock {
  file: File,
}

impl MasterLock {
  fn try_acquire(path: &Path) -> io::Result<Option<Self>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
      .create(true)
      .read(true)
      .write(true)
      .truncate(false)
      .open(path)?;
    match file.try_lock_exclusive() {
      Ok(()) => Ok(Some(Self { file })),
      Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
      #[cfg(windows)]
      Err(err) if matches!(err.raw_os_error(), Some(32 | 33)) => Ok(None),
      Err(err) => Err(err),
    }
  }
}

impl Drop for MasterLock {
  fn drop(&mut self) { let _ = FileExt::unlock(&self.file); }
}
