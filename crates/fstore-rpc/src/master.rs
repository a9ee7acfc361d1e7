//! The Master side: accept Proxy connections and answer their calls from the
//! local store.

use std::sync::Arc;

use serde_json::Value;
use tokio::{io::AsyncBufReadExt, sync::Notify, task::JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use fstore_core::store::FunctionStore;

use crate::{
  Endpoint, Result,
  election::MasterLock,
  endpoint::{Listener, Reader, Writer},
  wire::{Call, Request, Response, write_message},
};

/// The endpoint and master lock won in an election, not yet serving.
///
/// Dropping it without serving releases both.
pub struct MasterSeat {
  endpoint: Endpoint,
  // Declared before `lock` so the socket goes away while the lock is held.
  listener: Listener,
  _lock:    MasterLock,
}

impl MasterSeat {
  pub(crate) fn new(endpoint: Endpoint, listener: Listener, lock: MasterLock) -> Self {
    Self { endpoint, listener, _lock: lock }
  }

  pub fn endpoint(&self) -> &Endpoint { &self.endpoint }

  /// Start the accept loop on a background task.
  pub fn serve<S>(self, store: Arc<S>) -> MasterHandle
  where
    S: FunctionStore + 'static,
  {
    let shutdown = Arc::new(Notify::new());
    let task = tokio::spawn(accept_loop(self, store, shutdown.clone()));
    MasterHandle { shutdown, task }
  }
}

/// Controls a running accept loop.
pub struct MasterHandle {
  shutdown: Arc<Notify>,
  task:     tokio::task::JoinHandle<()>,
}

impl MasterHandle {
  /// Stop accepting, drop open connections and release the endpoint.
  pub async fn shutdown(self) {
    self.shutdown.notify_one();
    if let Err(err) = self.task.await {
      warn!(error = %err, "accept loop ended abnormally");
    }
  }
}

async fn accept_loop<S>(seat: MasterSeat, store: Arc<S>, shutdown: Arc<Notify>)
where
  S: FunctionStore + 'static,
{
  let mut connections = JoinSet::new();
  info!(endpoint = %seat.endpoint, "accepting proxy connections");

  loop {
    tokio::select! {
      () = shutdown.notified() => break,
      accepted = seat.listener.accept() => match accepted {
        Ok((reader, writer)) => {
          let store = store.clone();
          connections.spawn(async move {
            if let Err(err) = handle_connection(&*store, reader, writer).await {
              debug!(error = %err, "proxy connection ended");
            }
          });
        }
        Err(err) => warn!(error = %err, "accept failed"),
      },
      Some(_) = connections.join_next(), if !connections.is_empty() => {}
    }
  }

  connections.abort_all();
  info!(endpoint = %seat.endpoint, "master stopped");
}

/// Answer requests on one connection, in order, until the peer hangs up.
async fn handle_connection<S: FunctionStore>(
  store: &S,
  mut reader: Reader,
  mut writer: Writer,
) -> Result<()> {
  let mut line = String::new();
  loop {
    line.clear();
    if reader.read_line(&mut line).await? == 0 {
      return Ok(());
    }
    if line.trim().is_empty() {
      continue;
    }

    let response = match serde_json::from_str::<Request>(&line) {
      Ok(Request { id, call }) => {
        let op = call.op();
        debug!(%id, op, "proxied call");
        match dispatch(store, call).await {
          Ok(value) => Response::ok(id, value),
          Err(err) => {
            debug!(%id, op, error = %err, "proxied call failed");
            Response::err(id, &err)
          }
        }
      }
      Err(err) => {
        let id = request_id(&line).unwrap_or(Uuid::nil());
        let err = fstore_core::Error::InvalidInput(format!("malformed request: {err}"));
        Response::err(id, &err)
      }
    };
    write_message(&mut writer, &response).await?;
  }
}

/// Best-effort id recovery from a request that failed to parse.
fn request_id(line: &str) -> Option<Uuid> {
  let value: Value = serde_json::from_str(line).ok()?;
  serde_json::from_value(value.get("id")?.clone()).ok()
}

async fn dispatch<S: FunctionStore>(store: &S, call: Call) -> fstore_core::Result<Value> {
  let value = match call {
    Call::Save { input } => serde_json::to_value(store.save(input).await?)?,
    Call::Delete { name } => serde_json::to_value(store.delete(&name).await?)?,
    Call::Search { query, limit } => serde_json::to_value(store.search(&query, limit).await?)?,
    Call::Get { name, resolve_internal_deps } => {
      serde_json::to_value(store.get(&name, resolve_internal_deps).await?)?
    }
    Call::History { name } => serde_json::to_value(store.history(&name).await?)?,
    Call::Details { name } => serde_json::to_value(store.details(&name).await?)?,
    Call::Version { name, version } => serde_json::to_value(store.version(&name, version).await?)?,
    Call::List { query } => serde_json::to_value(store.list(&query).await?)?,
    Call::Stats => serde_json::to_value(store.stats().await?)?,
    Call::Triage { limit } => serde_json::to_value(store.triage(limit).await?)?,
    Call::Diagnose { name } => serde_json::to_value(store.diagnose(&name).await?)?,
  };
  Ok(value)
}
