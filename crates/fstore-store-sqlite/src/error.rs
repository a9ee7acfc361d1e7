//! Error type for `fstore-store-sqlite`.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  #[error("undecodable column value: {0}")]
  Decode(String),

  #[error("timed out after {0:?} waiting for the write lock")]
  LockTimeout(Duration),

  /// The database stayed busy or locked through every retry.
  #[error("database busy after {attempts} attempts: {message}")]
  Busy { attempts: u32, message: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<Error> for fstore_core::Error {
  fn from(err: Error) -> Self {
    match err {
      Error::LockTimeout(timeout) => Self::LockTimeout(timeout),
      Error::Busy { attempts, message } => Self::TransientStorage { attempts, message },
      Error::Json(e) => Self::Serialization(e),
      other => Self::Storage(other.to_string()),
    }
  }
}
