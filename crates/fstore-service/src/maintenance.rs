//! The background maintenance pass run for every saved version.
//!
//! Descriptions, dependency analysis, embedding, sandbox verification and
//! quality scoring all happen here, off the request path, and are written
//! back in one transaction. A pass whose version has been superseded by the
//! time it finishes writes nothing.

use std::collections::BTreeSet;

use chrono::Utc;
use tracing::{debug, info, warn};

use fstore_analysis::{deps, quality::HealStatus};
use fstore_core::{
  Result,
  capability::Descriptions,
  embedding::EmbeddingVector,
  function::{FunctionAsset, FunctionMetadata, FunctionStatus},
};
use fstore_sandbox::Outcome;
use fstore_store_sqlite::Finalization;

use crate::service::Inner;

/// Descriptions shorter than this are regenerated when a reviewer is set.
const MIN_DESCRIPTION_CHARS: usize = 10;

/// The text a function is embedded from.
fn embedding_text(asset: &FunctionAsset) -> String {
  let name = asset.name.replace('_', " ");
  format!("{name}\n{}\n{}", asset.primary_description(), asset.tags.join(" "))
}

impl Inner {
  pub(crate) async fn maintain(&self, name: &str, version: u32) -> Result<()> {
    let Some(mut asset) = self.db.get(name).await? else {
      debug!(function = name, "function deleted before maintenance");
      return Ok(());
    };
    if asset.version != version {
      debug!(function = name, version, current = asset.version, "version superseded, skipping");
      return Ok(());
    }
    info!(function = name, version, "maintenance started");
    let mut metadata = asset.metadata.clone();

    if !self.refine_descriptions(&mut asset, &mut metadata).await? {
      debug!(function = name, version, "superseded while describing");
      return Ok(());
    }

    let detected = deps::extract_imports(&asset.code);
    let mut dependencies: BTreeSet<String> = asset.dependencies.iter().cloned().collect();
    dependencies.extend(detected.iter().cloned());
    let dependencies: Vec<String> = dependencies.into_iter().collect();
    metadata.declared_dependencies = asset.dependencies.clone();
    metadata.detected_dependencies = detected.into_iter().collect();

    let names = self.db.names().await?;
    metadata.internal_dependencies = deps::find_internal_references(&asset.code, &names)
      .into_iter()
      .filter(|n| *n != asset.name)
      .collect();

    let embedding = self.embed(&asset).await;

    let status = if asset.status == FunctionStatus::Unverified {
      metadata.verification_error = None;
      FunctionStatus::Unverified
    } else {
      self.verify(&asset, &dependencies, &mut metadata).await
    };

    let report = self
      .quality
      .score(&asset.name, &asset.code, asset.primary_description(), &dependencies)
      .await;
    metadata.quality_score = report.final_score;
    metadata.reliability = report.reliability;
    metadata.quality_feedback = Some(report.feedback());

    let done = Finalization {
      name: asset.name.clone(),
      version,
      status,
      metadata,
      embedding,
    };
    let db = &self.db;
    let done = &done;
    let written = self.write(|g| async move { db.finalize(&g, done).await }).await?;
    if written {
      info!(function = name, version, %status, score = report.final_score, "maintenance finished");
    } else {
      info!(function = name, version, "superseded during maintenance, result discarded");
    }
    Ok(())
  }

  /// Generate a missing description or heal a weak one. Returns `false` if
  /// the record moved on to a newer version meanwhile.
  async fn refine_descriptions(
    &self,
    asset: &mut FunctionAsset,
    metadata: &mut FunctionMetadata,
  ) -> Result<bool> {
    let Some(reviewer) = self.quality.reviewer() else {
      return Ok(true);
    };
    let primary = asset.primary_description().to_owned();

    let replacement = if primary.chars().count() < MIN_DESCRIPTION_CHARS {
      match reviewer.generate_description(&asset.name, &asset.code, "").await {
        Ok(generated) => Some(generated),
        Err(err) => {
          warn!(function = %asset.name, error = %err, "description generation failed");
          None
        }
      }
    } else {
      let current = Descriptions {
        en: asset.description_en.clone().unwrap_or(primary.clone()),
        jp: asset.description_jp.clone().unwrap_or_default(),
      };
      match self
        .quality
        .check_with_heal(&asset.name, &asset.code, current, self.config.heal_max_retries)
        .await
      {
        Ok(report) => {
          metadata.heal_attempts = report.attempts;
          match report.status {
            HealStatus::Passed if report.healed() => Some(report.descriptions),
            HealStatus::FailedDescription => {
              warn!(
                function = %asset.name,
                attempts = report.attempts,
                feedback = %report.feedback,
                "description still weak after healing"
              );
              report.improved().then_some(report.descriptions)
            }
            _ => None,
          }
        }
        Err(err) => {
          warn!(function = %asset.name, error = %err, "description review failed");
          None
        }
      }
    };

    let Some(descriptions) = replacement else {
      return Ok(true);
    };
    let en = Some(descriptions.en).filter(|s| !s.trim().is_empty());
    let jp = Some(descriptions.jp).filter(|s| !s.trim().is_empty());
    let Some(plain) = en.clone().or(jp.clone()) else {
      return Ok(true);
    };
    let plain = if asset.description.chars().count() < MIN_DESCRIPTION_CHARS {
      plain
    } else {
      asset.description.clone()
    };

    let db = &self.db;
    let (name, version) = (asset.name.as_str(), asset.version);
    let (plain_ref, en_ref, jp_ref) = (plain.as_str(), en.as_deref(), jp.as_deref());
    let updated = self
      .write(|g| async move {
        db.update_descriptions(&g, name, version, plain_ref, en_ref, jp_ref).await
      })
      .await?;
    if updated {
      info!(function = %asset.name, "descriptions updated");
      asset.description = plain;
      asset.description_en = en;
      asset.description_jp = jp;
    }
    Ok(updated)
  }

  async fn embed(&self, asset: &FunctionAsset) -> Option<EmbeddingVector> {
    let identity = self.embedder.identity();
    match self.embedder.embed(&embedding_text(asset), false).await {
      Ok(vector) if vector.len() == identity.dimension => Some(EmbeddingVector {
        function_id: asset.id,
        model_name: identity.name,
        dimension: identity.dimension,
        vector,
        encoded_at: Utc::now(),
      }),
      Ok(vector) => {
        warn!(
          function = %asset.name,
          expected = identity.dimension,
          got = vector.len(),
          "embedder returned the wrong dimension"
        );
        None
      }
      Err(err) => {
        warn!(function = %asset.name, error = %err, "embedding failed");
        None
      }
    }
  }

  /// Resolve an environment and run the declared tests in the sandbox.
  async fn verify(
    &self,
    asset: &FunctionAsset,
    dependencies: &[String],
    metadata: &mut FunctionMetadata,
  ) -> FunctionStatus {
    let runtime = match self.pool.resolve(dependencies).await {
      Ok(runtime) => runtime,
      Err(err) => {
        warn!(function = %asset.name, error = %err, "environment unavailable");
        metadata.verification_error = Some(format!("Environment build failed: {err}"));
        return FunctionStatus::Failed;
      }
    };

    let verdict = self
      .runner
      .run(&asset.code, &asset.test_cases, asset.entry_point.as_deref(), &runtime)
      .await;
    debug!(function = %asset.name, outcome = ?verdict.outcome, "sandbox finished");

    match verdict.outcome {
      Outcome::Passed => {
        metadata.verification_error = None;
        metadata.last_verified_at = Some(Utc::now());
        if !runtime.is_host() {
          match self.pool.capture_lockfile(&runtime).await {
            Ok(pins) => metadata.locked_dependencies = pins,
            Err(err) => warn!(function = %asset.name, error = %err, "could not freeze environment"),
          }
        }
        FunctionStatus::Verified
      }
      Outcome::Setup => {
        metadata.verification_error = Some(verdict.diagnostic);
        FunctionStatus::Broken
      }
      Outcome::Failed | Outcome::Timeout | Outcome::Crashed => {
        metadata.verification_error = Some(verdict.diagnostic);
        FunctionStatus::Failed
      }
    }
  }

  /// Recompute the vector of `name` with the current embedder.
  pub(crate) async fn reembed(&self, name: &str) -> Result<()> {
    let Some(asset) = self.db.get(name).await? else {
      return Ok(());
    };
    let Some(embedding) = self.embed(&asset).await else {
      return Ok(());
    };
    let db = &self.db;
    let version = asset.version;
    let embedding = &embedding;
    let written = self
      .write(|g| async move { db.upsert_embedding(&g, version, embedding).await })
      .await?;
    debug!(function = name, written, "re-embedded");
    Ok(())
  }
}
