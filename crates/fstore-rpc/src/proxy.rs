//! The Proxy side: a [`FunctionStore`] that forwards every call to the
//! Master.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::{io::AsyncBufReadExt, sync::Mutex};
use tracing::{debug, warn};

use fstore_core::{
  function::{
    DeleteReceipt, DiagnosticReport, FunctionAsset, FunctionSummary, HistoryEntry, NewFunction,
    SaveReceipt, SearchHit, StoreStats, TriageEntry, VersionView,
  },
  store::{FunctionStore, ListQuery},
};

use crate::{
  Endpoint, Error, Result,
  endpoint::{Reader, Writer},
  wire::{Call, Request, Response, write_message},
};

struct Connection {
  reader: Reader,
  writer: Writer,
}

/// Client for a Master on `endpoint`.
///
/// Calls on one `RemoteStore` are sent one at a time over a single
/// connection. The connection is opened on first use and reopened on the call
/// after any failure. A call that gets no answer within the timeout fails
/// with [`fstore_core::Error::Communication`].
pub struct RemoteStore {
  endpoint: Endpoint,
  timeout:  Duration,
  conn:     Mutex<Option<Connection>>,
}

impl RemoteStore {
  pub fn new(endpoint: Endpoint, timeout: Duration) -> Self {
    Self { endpoint, timeout, conn: Mutex::new(None) }
  }

  pub fn endpoint(&self) -> &Endpoint { &self.endpoint }

  async fn call(&self, call: Call) -> fstore_core::Result<Value> {
    let op = call.op();
    let request = Request::new(call);
    let mut conn = self.conn.lock().await;

    let exchanged = tokio::time::timeout(self.timeout, self.exchange(&mut conn, &request))
      .await
      .unwrap_or(Err(Error::Timeout(self.timeout)));

    match exchanged {
      Ok(response) => response.into_result(),
      Err(err) => {
        *conn = None;
        warn!(op, endpoint = %self.endpoint, error = %err, "call to master failed");
        Err(err.into())
      }
    }
  }

  async fn exchange(&self, conn: &mut Option<Connection>, request: &Request) -> Result<Response> {
    if conn.is_none() {
      let (reader, writer) = self.endpoint.connect().await?;
      debug!(endpoint = %self.endpoint, "connected to master");
      *conn = Some(Connection { reader, writer });
    }
    let Some(conn) = conn.as_mut() else {
      return Err(Error::Closed);
    };

    write_message(&mut conn.writer, request).await?;
    let mut line = String::new();
    if conn.reader.read_line(&mut line).await? == 0 {
      return Err(Error::Closed);
    }
    let response: Response = serde_json::from_str(&line)?;
    if response.id != request.id {
      return Err(Error::IdMismatch { expected: request.id, got: response.id });
    }
    Ok(response)
  }

  async fn call_as<T: DeserializeOwned>(&self, call: Call) -> fstore_core::Result<T> {
    Ok(serde_json::from_value(self.call(call).await?)?)
  }
}

impl FunctionStore for RemoteStore {
  async fn save(&self, input: NewFunction) -> fstore_core::Result<SaveReceipt> {
    self.call_as(Call::Save { input }).await
  }

  async fn delete(&self, name: &str) -> fstore_core::Result<DeleteReceipt> {
    self.call_as(Call::Delete { name: name.to_owned() }).await
  }

  async fn search(&self, query: &str, limit: usize) -> fstore_core::Result<Vec<SearchHit>> {
    self.call_as(Call::Search { query: query.to_owned(), limit }).await
  }

  async fn get(&self, name: &str, resolve_internal_deps: bool) -> fstore_core::Result<String> {
    self.call_as(Call::Get { name: name.to_owned(), resolve_internal_deps }).await
  }

  async fn history(&self, name: &str) -> fstore_core::Result<Vec<HistoryEntry>> {
    self.call_as(Call::History { name: name.to_owned() }).await
  }

  async fn details(&self, name: &str) -> fstore_core::Result<FunctionAsset> {
    self.call_as(Call::Details { name: name.to_owned() }).await
  }

  async fn version(&self, name: &str, version: u32) -> fstore_core::Result<VersionView> {
    self.call_as(Call::Version { name: name.to_owned(), version }).await
  }

  async fn list(&self, query: &ListQuery) -> fstore_core::Result<Vec<FunctionSummary>> {
    self.call_as(Call::List { query: query.clone() }).await
  }

  async fn stats(&self) -> fstore_core::Result<StoreStats> { self.call_as(Call::Stats).await }

  async fn triage(&self, limit: usize) -> fstore_core::Result<Vec<TriageEntry>> {
    self.call_as(Call::Triage { limit }).await
  }

  async fn diagnose(&self, name: &str) -> fstore_core::Result<DiagnosticReport> {
    self.call_as(Call::Diagnose { name: name.to_owned() }).await
  }
}
