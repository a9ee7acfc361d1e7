//! Error type for `fstore-analysis`.
//!
//! Only the tool-backed quality stages fail; the pure analyses report through
//! [`fstore_core::Rejection`] or return empty results.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("tool `{tool}` could not be launched: {source}")]
  ToolUnavailable {
    tool:   String,
    #[source]
    source: std::io::Error,
  },

  #[error("tool `{tool}` produced unusable output: {detail}")]
  ToolOutput { tool: String, detail: String },

  #[error("tool `{0}` timed out")]
  ToolTimeout(String),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
