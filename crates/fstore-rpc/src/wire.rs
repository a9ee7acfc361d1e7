//! The newline-delimited JSON protocol spoken between Proxy and Master.
//!
//! Every request is one line `{"id": <uuid>, "op": "<operation>", ...args}`
//! and is answered by exactly one line carrying the same id and either an
//! `ok` value or an `err` object. Errors keep their kind so a Proxy caller
//! sees the same [`fstore_core::Error`] variant a Master caller would.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use fstore_core::{Error, Rejection, function::NewFunction, store::ListQuery};

use crate::endpoint::Writer;

// ─── Requests ────────────────────────────────────────────────────────────────

/// One store operation and its arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Call {
  Save { input: NewFunction },
  Delete { name: String },
  Search { query: String, limit: usize },
  Get { name: String, resolve_internal_deps: bool },
  History { name: String },
  Details { name: String },
  Version { name: String, version: u32 },
  List { query: ListQuery },
  Stats,
  Triage { limit: usize },
  Diagnose { name: String },
}

impl Call {
  /// Operation name as it appears on the wire.
  pub fn op(&self) -> &'static str {
    match self {
      Self::Save { .. } => "save",
      Self::Delete { .. } => "delete",
      Self::Search { .. } => "search",
      Self::Get { .. } => "get",
      Self::History { .. } => "history",
      Self::Details { .. } => "details",
      Self::Version { .. } => "version",
      Self::List { .. } => "list",
      Self::Stats => "stats",
      Self::Triage { .. } => "triage",
      Self::Diagnose { .. } => "diagnose",
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
  pub id:   Uuid,
  #[serde(flatten)]
  pub call: Call,
}

impl Request {
  pub fn new(call: Call) -> Self { Self { id: Uuid::new_v4(), call } }
}

// ─── Responses ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
  pub id:  Uuid,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub ok:  Option<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub err: Option<WireError>,
}

impl Response {
  pub fn ok(id: Uuid, value: Value) -> Self { Self { id, ok: Some(value), err: None } }

  pub fn err(id: Uuid, error: &Error) -> Self {
    Self { id, ok: None, err: Some(WireError::from(error)) }
  }

  /// Turn the response back into the result the Master produced.
  pub fn into_result(self) -> fstore_core::Result<Value> {
    match (self.ok, self.err) {
      (_, Some(err)) => Err(err.into_error()),
      (Some(value), None) => Ok(value),
      (None, None) => Ok(Value::Null),
    }
  }
}

/// Write `message` as one line and flush it.
pub(crate) async fn write_message<T: Serialize>(
  writer: &mut Writer,
  message: &T,
) -> crate::Result<()> {
  let mut line = serde_json::to_vec(message)?;
  line.push(b'\n');
  writer.write_all(&line).await?;
  writer.flush().await?;
  Ok(())
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  Rejected,
  NotFound,
  InvalidInput,
  LockTimeout,
  TransientStorage,
  Storage,
  Communication,
  Capability,
  Serialization,
  Internal,
}

/// The `err` object of a response.
///
/// `message` is the human-readable error text. The optional fields carry
/// whatever a variant needs to be rebuilt on the other side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
  pub kind:       ErrorKind,
  pub message:    String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub detail:     Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub rejection:  Option<Rejection>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub attempts:   Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub timeout_ms: Option<u64>,
}

impl WireError {
  fn new(kind: ErrorKind, error: &Error) -> Self {
    Self {
      kind,
      message: error.to_string(),
      detail: None,
      rejection: None,
      attempts: None,
      timeout_ms: None,
    }
  }

  fn with_detail(mut self, detail: &str) -> Self {
    self.detail = Some(detail.to_owned());
    self
  }

  fn detail_or_message(self) -> String { self.detail.unwrap_or(self.message) }

  pub fn into_error(self) -> Error {
    match self.kind {
      ErrorKind::Rejected => match self.rejection {
        Some(rejection) => Error::Rejected(rejection),
        None => Error::Internal(self.message),
      },
      ErrorKind::NotFound => Error::NotFound(self.detail_or_message()),
      ErrorKind::InvalidInput => Error::InvalidInput(self.detail_or_message()),
      ErrorKind::LockTimeout => {
        Error::LockTimeout(Duration::from_millis(self.timeout_ms.unwrap_or_default()))
      }
      ErrorKind::TransientStorage => Error::TransientStorage {
        attempts: self.attempts.unwrap_or_default(),
        message:  self.detail_or_message(),
      },
      ErrorKind::Storage => Error::Storage(self.detail_or_message()),
      ErrorKind::Communication => Error::Communication(self.detail_or_message()),
      ErrorKind::Capability => Error::Capability(self.detail_or_message()),
      ErrorKind::Serialization => {
        Error::Serialization(<serde_json::Error as serde::de::Error>::custom(
          self.detail_or_message(),
        ))
      }
      ErrorKind::Internal => Error::Internal(self.detail_or_message()),
    }
  }
}

impl From<&Error> for WireError {
  fn from(error: &Error) -> Self {
    match error {
      Error::Rejected(rejection) => Self {
        rejection: Some(rejection.clone()),
        ..Self::new(ErrorKind::Rejected, error)
      },
      Error::NotFound(name) => Self::new(ErrorKind::NotFound, error).with_detail(name),
      Error::InvalidInput(m) => Self::new(ErrorKind::InvalidInput, error).with_detail(m),
      Error::LockTimeout(timeout) => Self {
        timeout_ms: Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)),
        ..Self::new(ErrorKind::LockTimeout, error)
      },
      Error::TransientStorage { attempts, message } => Self {
        attempts: Some(*attempts),
        ..Self::new(ErrorKind::TransientStorage, error).with_detail(message)
      },
      Error::Storage(m) => Self::new(ErrorKind::Storage, error).with_detail(m),
      Error::Communication(m) => Self::new(ErrorKind::Communication, error).with_detail(m),
      Error::Capability(m) => Self::new(ErrorKind::Capability, error).with_detail(m),
      Error::Serialization(e) => {
        Self::new(ErrorKind::Serialization, error).with_detail(&e.to_string())
      }
      Error::Internal(m) => Self::new(ErrorKind::Internal, error).with_detail(m),
    }
  }
}
