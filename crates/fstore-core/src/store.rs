//! The `FunctionStore` trait and supporting query types.
//!
//! Implemented by the orchestrating service in the Master process and by the
//! RPC proxy in every other process. Callers depend on this abstraction, not
//! on where the work actually happens.

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::{
  Result,
  function::{
    DeleteReceipt, DiagnosticReport, FunctionAsset, FunctionSummary, HistoryEntry, NewFunction,
    SaveReceipt, SearchHit, StoreStats, TriageEntry, VersionView,
  },
};

// ─── Query type ──────────────────────────────────────────────────────────────

/// Parameters for [`FunctionStore::list`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListQuery {
  /// Substring match over name and description.
  pub text:  Option<String>,
  /// Exact tag match. Takes precedence over `text`.
  pub tag:   Option<String>,
  pub limit: Option<usize>,
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over the function store.
///
/// `save` returns as soon as the synchronous gates pass and the record is
/// persisted; verification, embedding and scoring complete later and show up
/// as a status transition. Readers must treat a non-terminal status as "not
/// yet fully available", not as an error.
pub trait FunctionStore: Send + Sync {
  // ── Writes ────────────────────────────────────────────────────────────

  /// Gate, persist and queue maintenance for a submission.
  ///
  /// Returns [`crate::Error::Rejected`] without writing anything when the code
  /// fails the syntax, security or secret checks.
  fn save(
    &self,
    input: NewFunction,
  ) -> impl Future<Output = Result<SaveReceipt>> + Send + '_;

  /// Remove a function together with its history and embeddings.
  fn delete<'a>(
    &'a self,
    name: &'a str,
  ) -> impl Future<Output = Result<DeleteReceipt>> + Send + 'a;

  // ── Reads ─────────────────────────────────────────────────────────────

  /// Semantic search, best match first.
  fn search<'a>(
    &'a self,
    query: &'a str,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<SearchHit>>> + Send + 'a;

  /// Return the code of `name`. With `resolve_internal_deps`, the code of every
  /// stored function it calls (transitively) is prepended in dependency order.
  fn get<'a>(
    &'a self,
    name: &'a str,
    resolve_internal_deps: bool,
  ) -> impl Future<Output = Result<String>> + Send + 'a;

  /// Current version first, then archived versions newest first.
  fn history<'a>(
    &'a self,
    name: &'a str,
  ) -> impl Future<Output = Result<Vec<HistoryEntry>>> + Send + 'a;

  /// The full current record.
  fn details<'a>(
    &'a self,
    name: &'a str,
  ) -> impl Future<Output = Result<FunctionAsset>> + Send + 'a;

  /// One version, archived or current.
  fn version<'a>(
    &'a self,
    name: &'a str,
    version: u32,
  ) -> impl Future<Output = Result<VersionView>> + Send + 'a;

  fn list<'a>(
    &'a self,
    query: &'a ListQuery,
  ) -> impl Future<Output = Result<Vec<FunctionSummary>>> + Send + 'a;

  fn stats(&self) -> impl Future<Output = Result<StoreStats>> + Send + '_;

  /// Functions that failed, are broken, or scored below 70, worst first.
  fn triage(
    &self,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<TriageEntry>>> + Send + '_;

  fn diagnose<'a>(
    &'a self,
    name: &'a str,
  ) -> impl Future<Output = Result<DiagnosticReport>> + Send + 'a;
}
