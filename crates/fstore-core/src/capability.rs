//! External collaborators the store consumes but does not implement.
//!
//! Both traits are object-safe so a local model can be swapped for a cloud API
//! at startup without touching the store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Result, embedding::ModelIdentity};

/// Turns text into a fixed-width vector.
#[async_trait]
pub trait Embedder: Send + Sync {
  /// The model name and dimension every vector from [`Embedder::embed`] has.
  fn identity(&self) -> ModelIdentity;

  /// `is_query` distinguishes search queries from stored documents for
  /// models that embed them asymmetrically.
  async fn embed(&self, text: &str, is_query: bool) -> Result<Vec<f32>>;
}

/// A pair of localised descriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptions {
  pub en: String,
  pub jp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeReview {
  pub passed:   bool,
  pub feedback: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptionReview {
  /// Semantic quality, 0-100.
  pub score:    u8,
  pub feedback: String,
}

/// Reviews code and descriptions and regenerates descriptions. Typically
/// backed by an LLM; when none is configured review stages are skipped.
#[async_trait]
pub trait Reviewer: Send + Sync {
  async fn review_code(&self, code: &str) -> Result<CodeReview>;

  async fn review_description(
    &self,
    name: &str,
    code: &str,
    descriptions: &Descriptions,
  ) -> Result<DescriptionReview>;

  async fn generate_description(
    &self,
    name: &str,
    code: &str,
    prior_feedback: &str,
  ) -> Result<Descriptions>;
}
