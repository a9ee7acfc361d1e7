//! Error type for `fstore-sandbox`.
//!
//! None of these cross the background boundary: maintenance records them as
//! the function's status and verification error.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("environment build failed for {key}: {detail}")]
  EnvironmentBuild { key: String, detail: String },

  #[error("dependency installation for {key} exceeded {timeout:?}")]
  InstallTimeout { key: String, timeout: Duration },

  #[error("sandbox run exceeded {0:?}")]
  SandboxTimeout(Duration),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
