//! Error taxonomy shared by every layer of the function store.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a submission was refused by the synchronous gates.
///
/// Rejections happen before anything is persisted and are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "rejection", rename_all = "snake_case")]
pub enum Rejection {
  #[error("Syntax Error at line {line}: {message}")]
  Syntax { line: usize, message: String },

  #[error("Security Block - '{call}' is forbidden.")]
  Security { call: String },

  #[error("Secret detected in code ({kind}). Please remove API keys or passwords.")]
  Secret { kind: String },
}

#[derive(Debug, Error)]
pub enum Error {
  #[error("REJECTED: {0}")]
  Rejected(Rejection),

  #[error("function not found: {0}")]
  NotFound(String),

  #[error("invalid input: {0}")]
  InvalidInput(String),

  #[error("timed out after {0:?} waiting for the write lock")]
  LockTimeout(Duration),

  /// The database stayed busy/locked for every retry attempt.
  #[error("storage still busy after {attempts} attempts: {message}")]
  TransientStorage { attempts: u32, message: String },

  #[error("storage error: {0}")]
  Storage(String),

  /// Proxy-to-Master RPC failure.
  #[error("communication error with master: {0}")]
  Communication(String),

  /// An external capability (embedder, reviewer) failed.
  #[error("capability error: {0}")]
  Capability(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("internal error: {0}")]
  Internal(String),
}

impl From<Rejection> for Error {
  fn from(r: Rejection) -> Self { Self::Rejected(r) }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
