//! Integration tests for `SqliteStore`.

use std::{io, sync::Arc, time::Duration};

use chrono::{TimeDelta, Utc};
use fstore_core::{
  embedding::{EmbeddingVector, ModelIdentity},
  function::{FunctionMetadata, FunctionStatus, NewFunction, ReliabilityTier},
  store::ListQuery,
};

use crate::{AdvisoryFileLock, Finalization, SqliteStore, WriteCoordinator, WriteGuard};

/// File lock stand-in for single-process tests.
struct NoFileLock;

impl AdvisoryFileLock for NoFileLock {
  fn try_acquire(&self) -> io::Result<bool> { Ok(true) }

  fn release(&self) -> io::Result<()> { Ok(()) }
}

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory()
    .await
    .expect("in-memory store")
}

async fn guard() -> WriteGuard {
  WriteCoordinator::new(Arc::new(NoFileLock))
    .acquire(Duration::from_secs(1))
    .await
    .unwrap()
}

fn submission(name: &str, code: &str, description: &str) -> NewFunction {
  NewFunction {
    description: description.into(),
    ..NewFunction::new(name, code)
  }
}

fn model() -> ModelIdentity { ModelIdentity { name: "hashing-v1".into(), dimension: 3 } }

fn vector(function_id: i64, model: &ModelIdentity) -> EmbeddingVector {
  EmbeddingVector {
    function_id,
    model_name: model.name.clone(),
    dimension: model.dimension,
    vector: vec![0.1, 0.2, 0.3],
    encoded_at: Utc::now(),
  }
}

// ─── Versioning ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn first_save_is_version_one() {
  let s = store().await;
  let g = guard().await;
  let mut input = submission("add", "def add(a, b):\n    return a + b\n", "Adds two numbers");
  input.tags = vec!["math".into()];
  input.entry_point = Some("add".into());

  let (_, version) = s
    .save_version(&g, &input, FunctionStatus::Pending, Utc::now())
    .await
    .unwrap();
  assert_eq!(version, 1);

  let asset = s.get("add").await.unwrap().unwrap();
  assert_eq!(asset.version, 1);
  assert_eq!(asset.status, FunctionStatus::Pending);
  assert_eq!(asset.tags, vec!["math".to_owned()]);
  assert_eq!(asset.entry_point.as_deref(), Some("add"));
  assert_eq!(asset.metadata.reliability, ReliabilityTier::Pending);
  assert!(s.snapshots("add").await.unwrap().is_empty());
}

#[tokio::test]
async fn overwrite_archives_the_previous_version() {
  let s = store().await;
  let g = guard().await;
  let first = Utc::now() - TimeDelta::hours(1);

  s.save_version(&g, &submission("f", "def f():\n    return 1\n", "one"), FunctionStatus::Pending, first)
    .await
    .unwrap();
  let (_, v2) = s
    .save_version(&g, &submission("f", "def f():\n    return 2\n", "two"), FunctionStatus::Pending, Utc::now())
    .await
    .unwrap();
  assert_eq!(v2, 2);

  let current = s.get("f").await.unwrap().unwrap();
  assert_eq!(current.version, 2);
  assert!(current.code.contains("return 2"));

  let snapshots = s.snapshots("f").await.unwrap();
  assert_eq!(snapshots.len(), 1);
  assert_eq!(snapshots[0].version, 1);
  assert_eq!(snapshots[0].description, "one");
  assert_eq!(snapshots[0].saved_at, first);

  let v1 = s.snapshot("f", 1).await.unwrap().unwrap();
  assert!(v1.code.contains("return 1"));
  assert!(s.snapshot("f", 2).await.unwrap().is_none());
}

#[tokio::test]
async fn overwrite_drops_embeddings() {
  let s = store().await;
  let g = guard().await;
  let (id, v1) = s
    .save_version(&g, &submission("f", "def f():\n    return 1\n", "one"), FunctionStatus::Pending, Utc::now())
    .await
    .unwrap();
  assert!(s.upsert_embedding(&g, v1, &vector(id, &model())).await.unwrap());
  assert_eq!(s.embedded(&model()).await.unwrap().len(), 1);

  s.save_version(&g, &submission("f", "def f():\n    return 2\n", "two"), FunctionStatus::Pending, Utc::now())
    .await
    .unwrap();
  assert!(s.embedded(&model()).await.unwrap().is_empty());

  // The stale version number no longer matches.
  assert!(!s.upsert_embedding(&g, v1, &vector(id, &model())).await.unwrap());
}

// ─── Delete ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn delete_cascades_to_history_and_embeddings() {
  let s = store().await;
  let g = guard().await;
  for body in ["return 1", "return 2", "return 3"] {
    s.save_version(
      &g,
      &submission("f", &format!("def f():\n    {body}\n"), "f"),
      FunctionStatus::Pending,
      Utc::now(),
    )
    .await
    .unwrap();
  }
  let asset = s.get("f").await.unwrap().unwrap();
  s.upsert_embedding(&g, asset.version, &vector(asset.id, &model())).await.unwrap();

  assert_eq!(s.delete(&g, "f").await.unwrap(), Some(2));
  assert!(s.get("f").await.unwrap().is_none());
  assert!(s.snapshots("f").await.unwrap().is_empty());
  assert!(s.embedded(&model()).await.unwrap().is_empty());

  assert_eq!(s.delete(&g, "f").await.unwrap(), None);
}

#[tokio::test]
async fn resaving_after_delete_starts_over() {
  let s = store().await;
  let g = guard().await;
  let input = submission("f", "def f():\n    return 1\n", "f");
  s.save_version(&g, &input, FunctionStatus::Pending, Utc::now()).await.unwrap();
  s.save_version(&g, &input, FunctionStatus::Pending, Utc::now()).await.unwrap();
  s.delete(&g, "f").await.unwrap();

  let (_, version) = s.save_version(&g, &input, FunctionStatus::Pending, Utc::now()).await.unwrap();
  assert_eq!(version, 1);
}

// ─── Finalize ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn finalize_writes_status_metadata_and_embedding() {
  let s = store().await;
  let g = guard().await;
  let (id, version) = s
    .save_version(&g, &submission("f", "def f():\n    return 1\n", "f"), FunctionStatus::Pending, Utc::now())
    .await
    .unwrap();

  let mut metadata = FunctionMetadata::new(Vec::new(), Utc::now());
  metadata.quality_score = 92;
  metadata.reliability = ReliabilityTier::High;
  let done = Finalization {
    name: "f".into(),
    version,
    status: FunctionStatus::Verified,
    metadata,
    embedding: Some(vector(id, &model())),
  };
  assert!(s.finalize(&g, &done).await.unwrap());

  let asset = s.get("f").await.unwrap().unwrap();
  assert_eq!(asset.status, FunctionStatus::Verified);
  assert_eq!(asset.metadata.quality_score, 92);

  let embedded = s.embedded(&model()).await.unwrap();
  assert_eq!(embedded.len(), 1);
  assert_eq!(embedded[0].asset.name, "f");
  assert_eq!(embedded[0].vector, vec![0.1, 0.2, 0.3]);
}

#[tokio::test]
async fn finalize_for_superseded_version_is_discarded() {
  let s = store().await;
  let g = guard().await;
  let input = submission("f", "def f():\n    return 1\n", "f");
  let (_, v1) = s.save_version(&g, &input, FunctionStatus::Pending, Utc::now()).await.unwrap();
  s.save_version(&g, &input, FunctionStatus::Pending, Utc::now()).await.unwrap();

  let done = Finalization {
    name: "f".into(),
    version: v1,
    status: FunctionStatus::Failed,
    metadata: FunctionMetadata::new(Vec::new(), Utc::now()),
    embedding: None,
  };
  assert!(!s.finalize(&g, &done).await.unwrap());
  assert_eq!(s.get("f").await.unwrap().unwrap().status, FunctionStatus::Pending);
}

#[tokio::test]
async fn descriptions_update_only_the_current_version() {
  let s = store().await;
  let g = guard().await;
  let (_, version) = s
    .save_version(&g, &submission("f", "def f():\n    return 1\n", ""), FunctionStatus::Pending, Utc::now())
    .await
    .unwrap();

  assert!(!s.update_descriptions(&g, "f", version + 1, "x", None, None).await.unwrap());
  assert!(
    s.update_descriptions(&g, "f", version, "Returns one", Some("Returns one"), Some("1を返す"))
      .await
      .unwrap()
  );
  let asset = s.get("f").await.unwrap().unwrap();
  assert_eq!(asset.description, "Returns one");
  assert_eq!(asset.description_jp.as_deref(), Some("1を返す"));
}

// ─── Reads ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn list_filters_by_tag_or_text() {
  let s = store().await;
  let g = guard().await;
  let mut csv = submission("parse_csv", "def parse_csv(s):\n    return s\n", "Parse CSV text");
  csv.tags = vec!["io".into(), "text".into()];
  let mut add = submission("add", "def add(a, b):\n    return a + b\n", "Adds numbers");
  add.tags = vec!["math".into()];
  s.save_version(&g, &csv, FunctionStatus::Pending, Utc::now()).await.unwrap();
  s.save_version(&g, &add, FunctionStatus::Pending, Utc::now() + TimeDelta::seconds(1))
    .await
    .unwrap();

  let all = s.list(&ListQuery::default()).await.unwrap();
  assert_eq!(all.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(), ["add", "parse_csv"]);

  let tagged = s
    .list(&ListQuery { tag: Some("text".into()), ..ListQuery::default() })
    .await
    .unwrap();
  assert_eq!(tagged.len(), 1);
  assert_eq!(tagged[0].name, "parse_csv");

  let by_text = s
    .list(&ListQuery { text: Some("NUMBERS".into()), ..ListQuery::default() })
    .await
    .unwrap();
  assert_eq!(by_text.len(), 1);
  assert_eq!(by_text[0].name, "add");

  let limited = s
    .list(&ListQuery { limit: Some(1), ..ListQuery::default() })
    .await
    .unwrap();
  assert_eq!(limited.len(), 1);
}

#[tokio::test]
async fn usage_and_stats() {
  let s = store().await;
  let g = guard().await;
  s.save_version(&g, &submission("a", "def a():\n    return 1\n", "a"), FunctionStatus::Pending, Utc::now())
    .await
    .unwrap();
  let (_, version) = s
    .save_version(&g, &submission("b", "def b():\n    return 2\n", "b"), FunctionStatus::Pending, Utc::now())
    .await
    .unwrap();
  s.finalize(&g, &Finalization {
    name: "b".into(),
    version,
    status: FunctionStatus::Verified,
    metadata: FunctionMetadata::new(Vec::new(), Utc::now()),
    embedding: None,
  })
  .await
  .unwrap();

  assert!(s.record_call(&g, "a", Utc::now()).await.unwrap());
  assert!(s.record_call(&g, "a", Utc::now()).await.unwrap());
  assert!(!s.record_call(&g, "missing", Utc::now()).await.unwrap());

  let a = s.get("a").await.unwrap().unwrap();
  assert_eq!(a.call_count, 2);
  assert!(a.last_called_at.is_some());

  let stats = s.stats().await.unwrap();
  assert_eq!(stats.total_functions, 2);
  assert_eq!(stats.verified_functions, 1);
  assert_eq!(stats.total_calls, 2);
  assert_eq!(stats.recent_activity.len(), 2);
}

#[tokio::test]
async fn triage_lists_failures_and_low_scores_worst_first() {
  let s = store().await;
  let g = guard().await;
  let cases = [
    ("fine", FunctionStatus::Verified, 95, ReliabilityTier::High),
    ("sloppy", FunctionStatus::Verified, 55, ReliabilityTier::Medium),
    ("failing", FunctionStatus::Failed, 80, ReliabilityTier::High),
    ("awful", FunctionStatus::Broken, 10, ReliabilityTier::Low),
  ];
  for (name, status, score, reliability) in cases {
    let (_, version) = s
      .save_version(
        &g,
        &submission(name, &format!("def {name}():\n    return 1\n"), name),
        FunctionStatus::Pending,
        Utc::now(),
      )
      .await
      .unwrap();
    let mut metadata = FunctionMetadata::new(Vec::new(), Utc::now());
    metadata.quality_score = score;
    metadata.reliability = reliability;
    s.finalize(&g, &Finalization { name: name.into(), version, status, metadata, embedding: None })
      .await
      .unwrap();
  }
  // Still pending: score 0 but not yet scored.
  s.save_version(&g, &submission("waiting", "def waiting():\n    return 1\n", "w"), FunctionStatus::Pending, Utc::now())
    .await
    .unwrap();

  let triage = s.triage(10).await.unwrap();
  let names = triage.iter().map(|t| t.name.as_str()).collect::<Vec<_>>();
  assert_eq!(names, ["awful", "sloppy", "failing"]);
  assert_eq!(s.triage(1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn stale_embeddings_and_reconciliation_queries() {
  let s = store().await;
  let g = guard().await;
  let (id, version) = s
    .save_version(&g, &submission("f", "def f():\n    return 1\n", "f"), FunctionStatus::Unverified, Utc::now())
    .await
    .unwrap();
  let old = ModelIdentity { name: "old-model".into(), dimension: 3 };
  s.upsert_embedding(&g, version, &vector(id, &old)).await.unwrap();

  assert_eq!(s.unembedded(&model()).await.unwrap(), vec!["f".to_owned()]);
  assert!(s.unembedded(&old).await.unwrap().is_empty());

  assert_eq!(s.delete_stale_embeddings(&g, &model()).await.unwrap(), 1);
  assert!(s.embedded(&old).await.unwrap().is_empty());

  assert_eq!(s.config("embedding_model").await.unwrap(), None);
  s.set_config(&g, "embedding_model", "hashing-v1:3").await.unwrap();
  s.set_config(&g, "embedding_model", "hashing-v1:256").await.unwrap();
  assert_eq!(s.config("embedding_model").await.unwrap().as_deref(), Some("hashing-v1:256"));

  assert_eq!(s.names_with_status(FunctionStatus::Unverified).await.unwrap(), vec!["f".to_owned()]);
  assert_eq!(s.names().await.unwrap(), vec!["f".to_owned()]);
}

#[tokio::test]
async fn file_backed_store_reads_through_the_read_only_connection() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("nested").join("functions.sqlite3");
  let s = SqliteStore::open(&path).await.unwrap();
  let coordinator = WriteCoordinator::open(dir.path().join("fstore.lock")).unwrap();
  let g = coordinator.acquire(Duration::from_secs(1)).await.unwrap();

  s.save_version(&g, &submission("f", "def f():\n    return 1\n", "f"), FunctionStatus::Pending, Utc::now())
    .await
    .unwrap();
  drop(g);

  assert_eq!(s.get("f").await.unwrap().unwrap().version, 1);

  // A second handle on the same file sees the committed row.
  let other = SqliteStore::open(&path).await.unwrap();
  assert!(other.get("f").await.unwrap().is_some());
}
