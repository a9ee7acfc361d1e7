//! Errors raised by the RPC layer itself.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("malformed message: {0}")]
  Json(#[from] serde_json::Error),

  #[error("no response within {0:?}")]
  Timeout(Duration),

  #[error("connection closed by peer")]
  Closed,

  #[error("response id {got} does not match request id {expected}")]
  IdMismatch { expected: uuid::Uuid, got: uuid::Uuid },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<Error> for fstore_core::Error {
  fn from(err: Error) -> Self { Self::Communication(err.to_string()) }
}
