//! [`FunctionService`]: the Master-side implementation of [`FunctionStore`].

use std::{
  collections::HashMap,
  future::Future,
  sync::{Arc, Mutex, PoisonError},
  time::Duration,
};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use fstore_analysis::{QualityGate, StaticAnalyzer, deps, sanitize::sanitize};
use fstore_core::{
  Error, Result,
  capability::Embedder,
  embedding::cosine_similarity,
  function::{
    DeleteReceipt, DiagnosticReport, FunctionAsset, FunctionStatus, FunctionSummary,
    HistoryEntry, NewFunction, SaveReceipt, SearchHit, StoreStats, TriageEntry, VersionView,
  },
  store::{FunctionStore, ListQuery},
};
use fstore_sandbox::{EnvironmentPool, SandboxRunner};
use fstore_store_sqlite::{SqliteStore, WriteCoordinator, WriteGuard};

use crate::{
  cache::{CacheStats, PopularQueryCache},
  queue::TaskQueue,
};

/// Config key holding `<model>:<dimension>` of the embedder that produced the
/// stored vectors.
pub const EMBEDDING_MODEL_KEY: &str = "embedding_model";

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ServiceConfig {
  pub lock_timeout:     Duration,
  pub cache_threshold:  u32,
  pub cache_capacity:   usize,
  pub heal_max_retries: u32,
}

impl Default for ServiceConfig {
  fn default() -> Self {
    Self {
      lock_timeout:     Duration::from_secs(30),
      cache_threshold:  crate::cache::DEFAULT_THRESHOLD,
      cache_capacity:   crate::cache::DEFAULT_CAPACITY,
      heal_max_retries: 2,
    }
  }
}

/// The collaborators a service is assembled from.
pub struct Components {
  pub analyzer: Arc<dyn StaticAnalyzer>,
  pub quality:  QualityGate,
  pub pool:     EnvironmentPool,
  pub runner:   SandboxRunner,
  pub embedder: Arc<dyn Embedder>,
}

// ─── Service ─────────────────────────────────────────────────────────────────

pub(crate) struct Inner {
  pub(crate) db:       SqliteStore,
  pub(crate) writes:   WriteCoordinator,
  pub(crate) config:   ServiceConfig,
  pub(crate) analyzer: Arc<dyn StaticAnalyzer>,
  pub(crate) quality:  QualityGate,
  pub(crate) pool:     EnvironmentPool,
  pub(crate) runner:   SandboxRunner,
  pub(crate) embedder: Arc<dyn Embedder>,
  pub(crate) cache:    Mutex<PopularQueryCache>,
  pub(crate) queue:    TaskQueue,
}

impl Inner {
  /// Run `f` under the write lock.
  pub(crate) async fn write<T, F, Fut>(&self, f: F) -> Result<T>
  where
    F: FnOnce(WriteGuard) -> Fut,
    Fut: Future<Output = fstore_store_sqlite::Result<T>>,
  {
    Ok(self.writes.with_write_lock(self.config.lock_timeout, f).await?)
  }

  fn cache(&self) -> std::sync::MutexGuard<'_, PopularQueryCache> {
    self.cache.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// The function store as run by the Master process.
///
/// Cloning is cheap and every clone shares one task queue and one cache.
#[derive(Clone)]
pub struct FunctionService {
  inner: Arc<Inner>,
}

impl FunctionService {
  /// Assemble a service and start its background worker. Must be called from
  /// within a tokio runtime.
  pub fn new(
    db: SqliteStore,
    writes: WriteCoordinator,
    components: Components,
    config: ServiceConfig,
  ) -> Self {
    let cache = PopularQueryCache::new(config.cache_threshold, config.cache_capacity);
    Self {
      inner: Arc::new(Inner {
        db,
        writes,
        config,
        analyzer: components.analyzer,
        quality: components.quality,
        pool: components.pool,
        runner: components.runner,
        embedder: components.embedder,
        cache: Mutex::new(cache),
        queue: TaskQueue::new(),
      }),
    }
  }

  /// Bring stored state in line with this process's embedder and queue the
  /// work a previous Master left unfinished.
  ///
  /// When the embedder identity differs from the one recorded in the config
  /// table, vectors from other models are deleted. Every settled function
  /// without a vector is queued for re-embedding and every `pending` function
  /// for maintenance.
  pub async fn reconcile(&self) -> Result<()> {
    let db = &self.inner.db;
    let identity = self.inner.embedder.identity();
    let wanted = format!("{}:{}", identity.name, identity.dimension);

    let stored = db.config(EMBEDDING_MODEL_KEY).await?;
    if stored.as_deref() != Some(wanted.as_str()) {
      let model = &identity;
      let wanted = &wanted;
      let removed = self
        .inner
        .write(|g| async move {
          let removed = db.delete_stale_embeddings(&g, model).await?;
          db.set_config(&g, EMBEDDING_MODEL_KEY, wanted).await?;
          Ok(removed)
        })
        .await?;
      if removed > 0 {
        warn!(
          previous = ?stored,
          current = %wanted,
          removed,
          "embedding model changed, dropped stale vectors"
        );
      } else {
        info!(current = %wanted, "recorded embedding model");
      }
    }

    let missing = db.unembedded(&identity).await?;
    for name in &missing {
      let inner = self.inner.clone();
      let name = name.clone();
      self
        .inner
        .queue
        .enqueue(format!("re-embed {name}"), async move { inner.reembed(&name).await })?;
    }

    let pending = db.names_with_status(FunctionStatus::Pending).await?;
    for name in &pending {
      if let Some(asset) = db.get(name).await? {
        self.enqueue_maintenance(&asset.name, asset.version)?;
      }
    }

    info!(reembed = missing.len(), resumed = pending.len(), "reconciliation queued");
    Ok(())
  }

  /// Wait for every queued background job to finish.
  pub async fn flush(&self) { self.inner.queue.flush().await }

  /// Drain the task queue and stop its worker.
  pub async fn shutdown(&self) {
    info!(pending = self.inner.queue.pending(), "draining task queue");
    self.inner.queue.shutdown().await;
  }

  pub fn pending_tasks(&self) -> usize { self.inner.queue.pending() }

  pub fn cache_stats(&self) -> CacheStats { self.inner.cache().stats() }

  fn enqueue_maintenance(&self, name: &str, version: u32) -> Result<()> {
    let inner = self.inner.clone();
    let owned = name.to_owned();
    self.inner.queue.enqueue(format!("maintain {name} v{version}"), async move {
      inner.maintain(&owned, version).await
    })
  }

  async fn require(&self, name: &str) -> Result<FunctionAsset> {
    self
      .inner
      .db
      .get(name)
      .await?
      .ok_or_else(|| Error::NotFound(name.to_owned()))
  }

  /// `root` preceded by every stored function it calls, callees first.
  async fn bundle(&self, root: FunctionAsset) -> Result<String> {
    let db = &self.inner.db;
    let names = db.names().await?;
    let root_name = root.name.clone();

    let mut loaded: HashMap<String, (FunctionAsset, Vec<String>)> = HashMap::new();
    let mut frontier = vec![root];
    while let Some(asset) = frontier.pop() {
      let calls: Vec<String> = deps::find_internal_references(&asset.code, &names)
        .into_iter()
        .filter(|n| *n != asset.name)
        .collect();
      for callee in &calls {
        if loaded.contains_key(callee) || frontier.iter().any(|a| &a.name == callee) {
          continue;
        }
        match db.get(callee).await? {
          Some(dep) => frontier.push(dep),
          None => warn!(function = %asset.name, callee = %callee, "referenced function vanished"),
        }
      }
      loaded.insert(asset.name.clone(), (asset, calls));
    }

    let order = deps::bundle_order(&root_name, |name| {
      loaded.get(name).map(|(_, calls)| calls.clone()).unwrap_or_default()
    });
    if order.len() <= 1 {
      return Ok(loaded.remove(&root_name).map(|(a, _)| a.code).unwrap_or_default());
    }

    let parts: Vec<String> = order
      .iter()
      .filter_map(|name| loaded.get(name))
      .map(|(asset, _)| {
        format!("# --- {} (v{}) ---\n{}", asset.name, asset.version, asset.code.trim_end())
      })
      .collect();
    debug!(function = %root_name, parts = parts.len(), "bundled internal dependencies");
    Ok(parts.join("\n\n") + "\n")
  }
}

// ─── FunctionStore ───────────────────────────────────────────────────────────

impl FunctionStore for FunctionService {
  async fn save(&self, mut input: NewFunction) -> Result<SaveReceipt> {
    sanitize(&mut input);
    if input.name.is_empty() {
      return Err(Error::InvalidInput("function name is empty".into()));
    }
    if input.code.trim().is_empty() {
      return Err(Error::InvalidInput("code is empty".into()));
    }
    if let Err(rejection) = self.inner.analyzer.scan(&input.code) {
      warn!(function = %input.name, reason = %rejection, "submission rejected");
      return Err(rejection.into());
    }

    let status = if input.skip_verification {
      FunctionStatus::Unverified
    } else {
      FunctionStatus::Pending
    };
    let db = &self.inner.db;
    let record = &input;
    let (_, version) = self
      .inner
      .write(|g| async move { db.save_version(&g, record, status, Utc::now()).await })
      .await?;
    info!(function = %input.name, version, %status, "function saved");

    // The row is already committed as pending, so the next start picks it up
    // again if it cannot be queued now.
    if let Err(err) = self.enqueue_maintenance(&input.name, version) {
      error!(function = %input.name, error = %err, "could not queue maintenance");
    }

    Ok(SaveReceipt { name: input.name, version, status })
  }

  async fn delete(&self, name: &str) -> Result<DeleteReceipt> {
    let db = &self.inner.db;
    let archived = self.inner.write(|g| async move { db.delete(&g, name).await }).await?;
    match archived {
      Some(versions_archived) => {
        info!(function = name, versions_archived, "function deleted");
        Ok(DeleteReceipt { name: name.to_owned(), versions_archived })
      }
      None => Err(Error::NotFound(name.to_owned())),
    }
  }

  async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
    if query.trim().is_empty() {
      return Err(Error::InvalidInput("search query is empty".into()));
    }

    let cached = self.inner.cache().get(query);
    let vector = match cached {
      Some(vector) => vector,
      None => {
        let vector = self.inner.embedder.embed(query, true).await?;
        self.inner.cache().maybe_cache(query, vector.clone());
        vector
      }
    };

    let identity = self.inner.embedder.identity();
    let mut hits: Vec<SearchHit> = self
      .inner
      .db
      .embedded(&identity)
      .await?
      .into_iter()
      .filter(|row| row.asset.status != FunctionStatus::Deleted)
      .map(|row| {
        let description = row.asset.primary_description().to_owned();
        SearchHit {
          score: cosine_similarity(&vector, &row.vector),
          name: row.asset.name,
          description,
          tags: row.asset.tags,
          status: row.asset.status,
          version: row.asset.version,
        }
      })
      .collect();
    hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.name.cmp(&b.name)));
    hits.truncate(limit.max(1));
    Ok(hits)
  }

  async fn get(&self, name: &str, resolve_internal_deps: bool) -> Result<String> {
    let asset = self.require(name).await?;

    let inner = self.inner.clone();
    let owned = name.to_owned();
    let counted = self.inner.queue.enqueue(format!("usage {name}"), async move {
      let db = &inner.db;
      let name = owned.as_str();
      inner.write(|g| async move { db.record_call(&g, name, Utc::now()).await }).await?;
      Ok(())
    });
    if let Err(err) = counted {
      warn!(function = name, error = %err, "usage not recorded");
    }

    if resolve_internal_deps {
      self.bundle(asset).await
    } else {
      Ok(asset.code)
    }
  }

  async fn history(&self, name: &str) -> Result<Vec<HistoryEntry>> {
    let asset = self.require(name).await?;
    let snapshots = self.inner.db.snapshots(name).await?;

    let mut history = Vec::with_capacity(snapshots.len() + 1);
    history.push(HistoryEntry {
      version:     asset.version,
      description: asset.primary_description().to_owned(),
      saved_at:    asset.metadata.saved_at,
      is_current:  true,
    });
    history.extend(snapshots.into_iter().map(|s| HistoryEntry {
      version:     s.version,
      description: s.description,
      saved_at:    s.saved_at,
      is_current:  false,
    }));
    Ok(history)
  }

  async fn details(&self, name: &str) -> Result<FunctionAsset> { self.require(name).await }

  async fn version(&self, name: &str, version: u32) -> Result<VersionView> {
    let asset = self.require(name).await?;
    if asset.version == version {
      return Ok(VersionView {
        version,
        description: asset.primary_description().to_owned(),
        code: asset.code,
        saved_at: asset.metadata.saved_at,
        is_current: true,
      });
    }
    let snapshot = self
      .inner
      .db
      .snapshot(name, version)
      .await?
      .ok_or_else(|| Error::NotFound(format!("{name} v{version}")))?;
    Ok(VersionView {
      version,
      code: snapshot.code,
      description: snapshot.description,
      saved_at: snapshot.saved_at,
      is_current: false,
    })
  }

  async fn list(&self, query: &ListQuery) -> Result<Vec<FunctionSummary>> {
    Ok(self.inner.db.list(query).await?)
  }

  async fn stats(&self) -> Result<StoreStats> { Ok(self.inner.db.stats().await?) }

  async fn triage(&self, limit: usize) -> Result<Vec<TriageEntry>> {
    Ok(self.inner.db.triage(limit).await?)
  }

  async fn diagnose(&self, name: &str) -> Result<DiagnosticReport> {
    let asset = self.require(name).await?;
    Ok(DiagnosticReport::from_asset(&asset))
  }
}
