//! Retrying database calls that fail because another connection holds the
//! file.

use std::time::Duration;

use rusqlite::ErrorCode;
use tracing::warn;

use crate::{Error, Result};

/// Attempts and backoff for busy/locked database errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
  pub max_attempts:  u32,
  pub initial_delay: Duration,
  pub factor:        f64,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self { max_attempts: 10, initial_delay: Duration::from_millis(200), factor: 1.5 }
  }
}

/// Whether `err` is SQLite reporting the database file as busy or locked.
pub(crate) fn is_transient(err: &tokio_rusqlite::Error) -> bool {
  match err {
    tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(e, _)) => {
      matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    }
    _ => false,
  }
}

/// Run `op` on `conn`, retrying transient failures per `policy`.
///
/// `op` is cloned for every attempt, so it should own its inputs.
pub(crate) async fn call_retrying<T, F>(
  conn: &tokio_rusqlite::Connection,
  policy: RetryPolicy,
  what: &'static str,
  op: F,
) -> Result<T>
where
  T: Send + 'static,
  F: FnOnce(&mut rusqlite::Connection) -> Result<T, tokio_rusqlite::Error>
    + Clone
    + Send
    + 'static,
{
  let mut delay = policy.initial_delay;
  let mut attempt = 0;
  loop {
    attempt += 1;
    let op = op.clone();
    match conn.call(op).await {
      Ok(value) => return Ok(value),
      Err(err) if is_transient(&err) && attempt < policy.max_attempts => {
        warn!(what, attempt, error = %err, "database busy, retrying");
        tokio::time::sleep(delay).await;
        delay = delay.mul_f64(policy.factor);
      }
      Err(err) if is_transient(&err) => {
        return Err(Error::Busy { attempts: attempt, message: err.to_string() });
      }
      Err(err) => return Err(err.into()),
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
  };

  use rusqlite::ffi;

  use super::*;

  fn busy() -> tokio_rusqlite::Error {
    tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(
      ffi::Error::new(ffi::SQLITE_BUSY),
      Some("database is locked".into()),
    ))
  }

  fn fast(max_attempts: u32) -> RetryPolicy {
    RetryPolicy { max_attempts, initial_delay: Duration::from_millis(1), factor: 1.5 }
  }

  #[tokio::test]
  async fn transient_errors_are_retried() {
    let conn = tokio_rusqlite::Connection::open_in_memory().await.unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let value = call_retrying(&conn, fast(10), "test", move |_conn| {
      if counter.fetch_add(1, Ordering::SeqCst) < 2 { Err(busy()) } else { Ok(42) }
    })
    .await
    .unwrap();

    assert_eq!(value, 42);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn persistent_busy_becomes_busy_error() {
    let conn = tokio_rusqlite::Connection::open_in_memory().await.unwrap();
    let err = call_retrying(&conn, fast(4), "test", |_conn| -> Result<(), _> { Err(busy()) })
      .await
      .unwrap_err();
    assert!(matches!(err, Error::Busy { attempts: 4, .. }));
  }

  #[tokio::test]
  async fn other_errors_are_not_retried() {
    let conn = tokio_rusqlite::Connection::open_in_memory().await.unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let err = call_retrying(&conn, fast(10), "test", move |conn| {
      counter.fetch_add(1, Ordering::SeqCst);
      conn.execute("SELECT * FROM missing_table", [])?;
      Ok(())
    })
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Database(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }
}
