//! [`SqliteStore`]: persisted state for the function store.
//!
//! Writes take a [`WriteGuard`] and go through the writer connection with
//! busy/locked retries. Reads use their own read-only connection.

use std::{fs, path::Path, time::Duration};

use chrono::{DateTime, Utc};
use rusqlite::{OpenFlags, OptionalExtension as _};

use fstore_core::{
  embedding::{EmbeddingVector, ModelIdentity},
  function::{
    FunctionAsset, FunctionMetadata, FunctionStatus, FunctionSummary, NewFunction,
    RecentActivity, StoreStats, TriageEntry, VersionSnapshot,
  },
  store::ListQuery,
};

use crate::{
  Result,
  encode::{
    FUNCTION_COLUMNS, RawFunction, RawSnapshot, decode_dt, decode_json, encode_dt, encode_json,
  },
  lock::WriteGuard,
  retry::{RetryPolicy, call_retrying},
  schema::SCHEMA,
};

/// How long SQLite itself waits on a locked file before reporting busy.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A function with the vector stored for one embedding model.
#[derive(Debug, Clone)]
pub struct EmbeddedFunction {
  pub asset:  FunctionAsset,
  pub vector: Vec<f32>,
}

/// The outcome of a maintenance pass, written in one transaction.
#[derive(Debug, Clone)]
pub struct Finalization {
  pub name:      String,
  /// The version the pass worked on. Nothing is written if the record has
  /// moved on since.
  pub version:   u32,
  pub status:    FunctionStatus,
  pub metadata:  FunctionMetadata,
  pub embedding: Option<EmbeddingVector>,
}

// ─── Store ───────────────────────────────────────────────────────────────────

/// The function store's SQLite database.
///
/// Cloning is cheap; both connections are reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  writer: tokio_rusqlite::Connection,
  reader: tokio_rusqlite::Connection,
  retry:  RetryPolicy,
}

impl SqliteStore {
  /// Open (or create) the database at `path`, run schema initialisation on
  /// the writer and open a read-only connection next to it.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref().to_path_buf();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      fs::create_dir_all(parent)?;
    }

    let writer = tokio_rusqlite::Connection::open(&path).await?;
    init_writer(&writer).await?;

    let reader = tokio_rusqlite::Connection::open_with_flags(
      &path,
      OpenFlags::SQLITE_OPEN_READ_ONLY
        | OpenFlags::SQLITE_OPEN_NO_MUTEX
        | OpenFlags::SQLITE_OPEN_URI,
    )
    .await?;
    reader
      .call(|conn| {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(())
      })
      .await?;

    Ok(Self { writer, reader, retry: RetryPolicy::default() })
  }

  /// Open an in-memory store. Reads share the writer connection.
  pub async fn open_in_memory() -> Result<Self> {
    let writer = tokio_rusqlite::Connection::open_in_memory().await?;
    init_writer(&writer).await?;
    Ok(Self { reader: writer.clone(), writer, retry: RetryPolicy::default() })
  }

  pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  // ── Writes ──────────────────────────────────────────────────────────────

  /// Persist `input` as the next version of its name with `status` and fresh
  /// metadata. The previous record, if any, is archived first and its
  /// embeddings dropped.
  ///
  /// Returns the function id and the new version number.
  pub async fn save_version(
    &self,
    _guard: &WriteGuard,
    input: &NewFunction,
    status: FunctionStatus,
    now: DateTime<Utc>,
  ) -> Result<(i64, u32)> {
    let name = input.name.clone();
    let code = input.code.clone();
    let description = input.description.clone();
    let description_en = input.description_en.clone();
    let description_jp = input.description_jp.clone();
    let entry_point = input.entry_point.clone();
    let tags = encode_json(&input.tags)?;
    let dependencies = encode_json(&input.dependencies)?;
    let test_cases = encode_json(&input.test_cases)?;
    let metadata = encode_json(&FunctionMetadata::new(input.dependencies.clone(), now))?;
    let now = encode_dt(now);

    let (id, version) = call_retrying(&self.writer, self.retry, "save_version", move |conn| {
      let tx = conn.transaction()?;

      let existing: Option<(i64, i64)> = tx
        .query_row(
          "SELECT id, version FROM functions WHERE name = ?1",
          rusqlite::params![name],
          |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;

      let saved = match existing {
        Some((id, version)) => {
          tx.execute(
            "INSERT INTO function_versions (
               function_id, version, code, description, dependencies, test_cases,
               saved_at, archived_at
             )
             SELECT id, version, code, description, dependencies, test_cases,
                    COALESCE(json_extract(metadata, '$.saved_at'), updated_at), ?2
             FROM functions WHERE id = ?1",
            rusqlite::params![id, now],
          )?;
          tx.execute(
            "UPDATE functions SET
               code = ?2, description = ?3, description_en = ?4, description_jp = ?5,
               tags = ?6, dependencies = ?7, test_cases = ?8, entry_point = ?9,
               status = ?10, version = ?11, metadata = ?12, updated_at = ?13
             WHERE id = ?1",
            rusqlite::params![
              id,
              code,
              description,
              description_en,
              description_jp,
              tags,
              dependencies,
              test_cases,
              entry_point,
              status.as_ref(),
              version + 1,
              metadata,
              now,
            ],
          )?;
          tx.execute("DELETE FROM embeddings WHERE function_id = ?1", rusqlite::params![id])?;
          (id, version + 1)
        }
        None => {
          tx.execute(
            "INSERT INTO functions (
               name, code, description, description_en, description_jp, tags,
               dependencies, test_cases, entry_point, status, version, metadata,
               created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1, ?11, ?12, ?12)",
            rusqlite::params![
              name,
              code,
              description,
              description_en,
              description_jp,
              tags,
              dependencies,
              test_cases,
              entry_point,
              status.as_ref(),
              metadata,
              now,
            ],
          )?;
          (tx.last_insert_rowid(), 1)
        }
      };

      tx.commit()?;
      Ok(saved)
    })
    .await?;

    Ok((id, u32::try_from(version).unwrap_or(u32::MAX)))
  }

  /// Remove `name`, its archived versions and its embeddings.
  ///
  /// Returns the number of archived versions removed, or `None` if there was
  /// no such function.
  pub async fn delete(&self, _guard: &WriteGuard, name: &str) -> Result<Option<usize>> {
    let name = name.to_owned();
    call_retrying(&self.writer, self.retry, "delete", move |conn| {
      let tx = conn.transaction()?;
      let Some(id) = tx
        .query_row("SELECT id FROM functions WHERE name = ?1", rusqlite::params![name], |r| {
          r.get::<_, i64>(0)
        })
        .optional()?
      else {
        return Ok(None);
      };

      let archived: i64 = tx.query_row(
        "SELECT COUNT(*) FROM function_versions WHERE function_id = ?1",
        rusqlite::params![id],
        |r| r.get(0),
      )?;
      // Versions and embeddings follow through ON DELETE CASCADE.
      tx.execute("DELETE FROM functions WHERE id = ?1", rusqlite::params![id])?;
      tx.commit()?;
      Ok(Some(usize::try_from(archived).unwrap_or_default()))
    })
    .await
  }

  /// Write the result of a maintenance pass if the record is still at
  /// `done.version`. Returns whether anything was written.
  pub async fn finalize(&self, _guard: &WriteGuard, done: &Finalization) -> Result<bool> {
    let name = done.name.clone();
    let version = i64::from(done.version);
    let status = done.status;
    let metadata = encode_json(&done.metadata)?;
    let embedding = match &done.embedding {
      Some(e) => Some((
        e.model_name.clone(),
        e.dimension as i64,
        encode_json(&e.vector)?,
        encode_dt(e.encoded_at),
      )),
      None => None,
    };

    call_retrying(&self.writer, self.retry, "finalize", move |conn| {
      let tx = conn.transaction()?;
      let Some(id) = tx
        .query_row(
          "SELECT id FROM functions WHERE name = ?1 AND version = ?2",
          rusqlite::params![name, version],
          |r| r.get::<_, i64>(0),
        )
        .optional()?
      else {
        return Ok(false);
      };

      tx.execute(
        "UPDATE functions SET status = ?2, metadata = ?3 WHERE id = ?1",
        rusqlite::params![id, status.as_ref(), metadata],
      )?;
      if let Some((model_name, dimension, vector, encoded_at)) = embedding {
        upsert_embedding_row(&tx, id, &model_name, dimension, &vector, &encoded_at)?;
      }
      tx.commit()?;
      Ok(true)
    })
    .await
  }

  /// Replace the descriptions of `name` if it is still at `version`.
  pub async fn update_descriptions(
    &self,
    _guard: &WriteGuard,
    name: &str,
    version: u32,
    description: &str,
    description_en: Option<&str>,
    description_jp: Option<&str>,
  ) -> Result<bool> {
    let name = name.to_owned();
    let description = description.to_owned();
    let description_en = description_en.map(str::to_owned);
    let description_jp = description_jp.map(str::to_owned);
    let version = i64::from(version);

    call_retrying(&self.writer, self.retry, "update_descriptions", move |conn| {
      let changed = conn.execute(
        "UPDATE functions SET description = ?3, description_en = ?4, description_jp = ?5
         WHERE name = ?1 AND version = ?2",
        rusqlite::params![name, version, description, description_en, description_jp],
      )?;
      Ok(changed > 0)
    })
    .await
  }

  /// Bump the usage counter of `name`.
  pub async fn record_call(
    &self,
    _guard: &WriteGuard,
    name: &str,
    at: DateTime<Utc>,
  ) -> Result<bool> {
    let name = name.to_owned();
    let at = encode_dt(at);
    call_retrying(&self.writer, self.retry, "record_call", move |conn| {
      let changed = conn.execute(
        "UPDATE functions SET call_count = call_count + 1, last_called_at = ?2 WHERE name = ?1",
        rusqlite::params![name, at],
      )?;
      Ok(changed > 0)
    })
    .await
  }

  /// Store `embedding` if its function is still at `version`.
  pub async fn upsert_embedding(
    &self,
    _guard: &WriteGuard,
    version: u32,
    embedding: &EmbeddingVector,
  ) -> Result<bool> {
    let id = embedding.function_id;
    let version = i64::from(version);
    let model_name = embedding.model_name.clone();
    let dimension = embedding.dimension as i64;
    let vector = encode_json(&embedding.vector)?;
    let encoded_at = encode_dt(embedding.encoded_at);

    call_retrying(&self.writer, self.retry, "upsert_embedding", move |conn| {
      let tx = conn.transaction()?;
      let current = tx
        .query_row(
          "SELECT 1 FROM functions WHERE id = ?1 AND version = ?2",
          rusqlite::params![id, version],
          |_| Ok(()),
        )
        .optional()?;
      if current.is_none() {
        return Ok(false);
      }
      upsert_embedding_row(&tx, id, &model_name, dimension, &vector, &encoded_at)?;
      tx.commit()?;
      Ok(true)
    })
    .await
  }

  /// Delete every embedding not produced by `model`. Returns the row count.
  pub async fn delete_stale_embeddings(
    &self,
    _guard: &WriteGuard,
    model: &ModelIdentity,
  ) -> Result<usize> {
    let model_name = model.name.clone();
    let dimension = model.dimension as i64;
    call_retrying(&self.writer, self.retry, "delete_stale_embeddings", move |conn| {
      Ok(conn.execute(
        "DELETE FROM embeddings WHERE model_name != ?1 OR dimension != ?2",
        rusqlite::params![model_name, dimension],
      )?)
    })
    .await
  }

  pub async fn set_config(&self, _guard: &WriteGuard, key: &str, value: &str) -> Result<()> {
    let key = key.to_owned();
    let value = value.to_owned();
    call_retrying(&self.writer, self.retry, "set_config", move |conn| {
      conn.execute(
        "INSERT INTO config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        rusqlite::params![key, value],
      )?;
      Ok(())
    })
    .await
  }

  // ── Reads ───────────────────────────────────────────────────────────────

  pub async fn get(&self, name: &str) -> Result<Option<FunctionAsset>> {
    let name = name.to_owned();
    let raw = call_retrying(&self.reader, self.retry, "get", move |conn| {
      Ok(
        conn
          .query_row(
            &format!("SELECT {FUNCTION_COLUMNS} FROM functions WHERE name = ?1"),
            rusqlite::params![name],
            RawFunction::from_row,
          )
          .optional()?,
      )
    })
    .await?;
    raw.map(RawFunction::into_asset).transpose()
  }

  /// Archived versions of `name`, newest first.
  pub async fn snapshots(&self, name: &str) -> Result<Vec<VersionSnapshot>> {
    let name = name.to_owned();
    let raws = call_retrying(&self.reader, self.retry, "snapshots", move |conn| {
      let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM function_versions
         WHERE function_id = (SELECT id FROM functions WHERE name = ?1)
         ORDER BY version DESC",
        RawSnapshot::COLUMNS
      ))?;
      let rows = stmt
        .query_map(rusqlite::params![name], RawSnapshot::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
      Ok(rows)
    })
    .await?;
    raws.into_iter().map(RawSnapshot::into_snapshot).collect()
  }

  pub async fn snapshot(&self, name: &str, version: u32) -> Result<Option<VersionSnapshot>> {
    let name = name.to_owned();
    let version = i64::from(version);
    let raw = call_retrying(&self.reader, self.retry, "snapshot", move |conn| {
      Ok(
        conn
          .query_row(
            &format!(
              "SELECT {} FROM function_versions
               WHERE function_id = (SELECT id FROM functions WHERE name = ?1) AND version = ?2",
              RawSnapshot::COLUMNS
            ),
            rusqlite::params![name, version],
            RawSnapshot::from_row,
          )
          .optional()?,
      )
    })
    .await?;
    raw.map(RawSnapshot::into_snapshot).transpose()
  }

  /// Every stored name, alphabetically.
  pub async fn names(&self) -> Result<Vec<String>> {
    call_retrying(&self.reader, self.retry, "names", |conn| {
      let mut stmt = conn.prepare("SELECT name FROM functions ORDER BY name")?;
      let names = stmt.query_map([], |r| r.get(0))?.collect::<rusqlite::Result<Vec<_>>>()?;
      Ok(names)
    })
    .await
  }

  /// Names of functions currently in `status`.
  pub async fn names_with_status(&self, status: FunctionStatus) -> Result<Vec<String>> {
    call_retrying(&self.reader, self.retry, "names_with_status", move |conn| {
      let mut stmt = conn.prepare("SELECT name FROM functions WHERE status = ?1 ORDER BY id")?;
      let names = stmt
        .query_map(rusqlite::params![status.as_ref()], |r| r.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
      Ok(names)
    })
    .await
  }

  /// Summaries filtered by tag or by a case-insensitive substring of name or
  /// description, most recently updated first.
  pub async fn list(&self, query: &ListQuery) -> Result<Vec<FunctionSummary>> {
    let tag = query.tag.clone();
    let text = if tag.is_some() { None } else { query.text.clone() };
    let limit = query.limit.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX));

    let raws = call_retrying(&self.reader, self.retry, "list", move |conn| {
      let mut stmt = conn.prepare(&format!(
        "SELECT {FUNCTION_COLUMNS} FROM functions
         WHERE status != 'deleted'
           AND (?1 IS NULL OR EXISTS (
                 SELECT 1 FROM json_each(functions.tags) WHERE json_each.value = ?1))
           AND (?2 IS NULL
                OR instr(lower(name), lower(?2)) > 0
                OR instr(lower(description), lower(?2)) > 0)
         ORDER BY updated_at DESC, id DESC
         LIMIT ?3"
      ))?;
      let rows = stmt
        .query_map(rusqlite::params![tag, text, limit], RawFunction::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
      Ok(rows)
    })
    .await?;

    raws
      .into_iter()
      .map(|raw| raw.into_asset().map(|asset| FunctionSummary::from(&asset)))
      .collect()
  }

  /// Every non-deleted function with a vector from `model`.
  pub async fn embedded(&self, model: &ModelIdentity) -> Result<Vec<EmbeddedFunction>> {
    let model_name = model.name.clone();
    let dimension = model.dimension as i64;

    let rows = call_retrying(&self.reader, self.retry, "embedded", move |conn| {
      let mut stmt = conn.prepare(&format!(
        "SELECT {FUNCTION_COLUMNS}, vector FROM functions
         JOIN embeddings ON embeddings.function_id = functions.id
         WHERE model_name = ?1 AND dimension = ?2 AND status != 'deleted'"
      ))?;
      let rows = stmt
        .query_map(rusqlite::params![model_name, dimension], |r| {
          Ok((RawFunction::from_row(r)?, r.get::<_, String>(17)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
      Ok(rows)
    })
    .await?;

    rows
      .into_iter()
      .map(|(raw, vector)| {
        Ok(EmbeddedFunction { asset: raw.into_asset()?, vector: decode_json(&vector)? })
      })
      .collect()
  }

  /// Names of settled functions with no vector from `model`.
  pub async fn unembedded(&self, model: &ModelIdentity) -> Result<Vec<String>> {
    let model_name = model.name.clone();
    call_retrying(&self.reader, self.retry, "unembedded", move |conn| {
      let mut stmt = conn.prepare(
        "SELECT name FROM functions
         WHERE status IN ('verified', 'failed', 'broken', 'unverified')
           AND NOT EXISTS (
             SELECT 1 FROM embeddings
             WHERE embeddings.function_id = functions.id AND embeddings.model_name = ?1)
         ORDER BY id",
      )?;
      let names = stmt
        .query_map(rusqlite::params![model_name], |r| r.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
      Ok(names)
    })
    .await
  }

  pub async fn stats(&self) -> Result<StoreStats> {
    let (total, verified, calls, recent) = call_retrying(&self.reader, self.retry, "stats", |conn| {
      let (total, verified, calls): (i64, i64, i64) = conn.query_row(
        "SELECT COUNT(*),
                COALESCE(SUM(status = 'verified'), 0),
                COALESCE(SUM(call_count), 0)
         FROM functions WHERE status != 'deleted'",
        [],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
      )?;
      let mut stmt = conn.prepare(
        "SELECT name, updated_at FROM functions WHERE status != 'deleted'
         ORDER BY updated_at DESC, id DESC LIMIT 5",
      )?;
      let recent = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
      Ok((total, verified, calls, recent))
    })
    .await?;

    let recent_activity = recent
      .into_iter()
      .map(|(name, updated_at)| Ok(RecentActivity { name, updated_at: decode_dt(&updated_at)? }))
      .collect::<Result<Vec<_>>>()?;

    Ok(StoreStats {
      total_functions: u64::try_from(total).unwrap_or_default(),
      verified_functions: u64::try_from(verified).unwrap_or_default(),
      total_calls: u64::try_from(calls).unwrap_or_default(),
      recent_activity,
    })
  }

  /// Functions needing attention: failed, broken, or scored below 70 once
  /// scoring has happened. Lowest score first.
  pub async fn triage(&self, limit: usize) -> Result<Vec<TriageEntry>> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let raws = call_retrying(&self.reader, self.retry, "triage", move |conn| {
      let mut stmt = conn.prepare(&format!(
        "SELECT {FUNCTION_COLUMNS} FROM functions
         WHERE status IN ('failed', 'broken')
            OR (json_extract(metadata, '$.quality_score') < 70
                AND json_extract(metadata, '$.reliability') != 'pending')
         ORDER BY json_extract(metadata, '$.quality_score') ASC, name ASC
         LIMIT ?1"
      ))?;
      let rows = stmt
        .query_map(rusqlite::params![limit], RawFunction::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
      Ok(rows)
    })
    .await?;

    raws
      .into_iter()
      .map(|raw| raw.into_asset().map(|asset| TriageEntry::from(&asset)))
      .collect()
  }

  pub async fn config(&self, key: &str) -> Result<Option<String>> {
    let key = key.to_owned();
    call_retrying(&self.reader, self.retry, "config", move |conn| {
      Ok(
        conn
          .query_row("SELECT value FROM config WHERE key = ?1", rusqlite::params![key], |r| {
            r.get(0)
          })
          .optional()?,
      )
    })
    .await
  }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

async fn init_writer(conn: &tokio_rusqlite::Connection) -> Result<()> {
  conn
    .call(|conn| {
      conn.busy_timeout(BUSY_TIMEOUT)?;
      conn.execute_batch(SCHEMA)?;
      Ok(())
    })
    .await?;
  Ok(())
}

fn upsert_embedding_row(
  conn: &rusqlite::Connection,
  function_id: i64,
  model_name: &str,
  dimension: i64,
  vector: &str,
  encoded_at: &str,
) -> rusqlite::Result<()> {
  conn.execute(
    "INSERT INTO embeddings (function_id, model_name, dimension, vector, encoded_at)
     VALUES (?1, ?2, ?3, ?4, ?5)
     ON CONFLICT(function_id, model_name) DO UPDATE SET
       dimension = excluded.dimension,
       vector = excluded.vector,
       encoded_at = excluded.encoded_at",
    rusqlite::params![function_id, model_name, dimension, vector, encoded_at],
  )?;
  Ok(())
}
