//! Runtime settings: an optional TOML file layered under `FSTORE_*`
//! environment variables.

use std::{
  path::{Path, PathBuf},
  time::Duration,
};

use anyhow::Context as _;
use serde::Deserialize;

use fstore_analysis::{QualityWeights, quality::ToolPaths};
use fstore_rpc::Endpoint;
use fstore_service::ServiceConfig;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
  /// Root for the database, lock file, environments and socket.
  pub data_dir:             PathBuf,
  pub db_file:              String,
  pub lock_file:            String,
  pub envs_dir:             String,
  /// Socket path, relative to `data_dir` unless absolute.
  pub endpoint:             String,
  /// Loopback port used instead of `endpoint` where unix sockets are missing.
  pub port:                 u16,
  pub python:               PathBuf,
  pub uv:                   PathBuf,
  pub ruff:                 PathBuf,
  pub bandit:               PathBuf,
  pub safety:               PathBuf,
  pub install_timeout_secs: u64,
  pub sandbox_timeout_secs: u64,
  pub lock_timeout_secs:    u64,
  pub rpc_timeout_secs:     u64,
  pub cache_capacity:       usize,
  pub cache_threshold:      u32,
  pub embedding_dimension:  usize,
  pub heal_max_retries:     u32,
  pub quality:              QualityWeights,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      data_dir:             PathBuf::from("~/.fstore"),
      db_file:              "functions.sqlite3".into(),
      lock_file:            "fstore.lock".into(),
      envs_dir:             "envs".into(),
      endpoint:             "fstore.sock".into(),
      port:                 47_653,
      python:               PathBuf::from("python3"),
      uv:                   PathBuf::from("uv"),
      ruff:                 PathBuf::from("ruff"),
      bandit:               PathBuf::from("bandit"),
      safety:               PathBuf::from("safety"),
      install_timeout_secs: 600,
      sandbox_timeout_secs: 30,
      lock_timeout_secs:    30,
      rpc_timeout_secs:     60,
      cache_capacity:       500,
      cache_threshold:      3,
      embedding_dimension:  256,
      heal_max_retries:     2,
      quality:              QualityWeights::default(),
    }
  }
}

impl Settings {
  /// Read `path` if it exists, then apply `FSTORE_*` overrides. Nested keys
  /// use a double underscore, e.g. `FSTORE_QUALITY__LINT_CAP`.
  pub fn load(path: &Path) -> anyhow::Result<Self> {
    let mut settings: Self = config::Config::builder()
      .add_source(config::File::from(path).required(false))
      .add_source(
        config::Environment::with_prefix("FSTORE")
          .prefix_separator("_")
          .separator("__")
          .try_parsing(true),
      )
      .build()
      .context("failed to read configuration")?
      .try_deserialize()
      .context("failed to deserialise settings")?;
    settings.data_dir = expand_tilde(&settings.data_dir);
    Ok(settings)
  }

  fn in_data_dir(&self, name: &str) -> PathBuf { self.data_dir.join(name) }

  pub fn db_path(&self) -> PathBuf { self.in_data_dir(&self.db_file) }

  pub fn lock_path(&self) -> PathBuf { self.in_data_dir(&self.lock_file) }

  pub fn envs_path(&self) -> PathBuf { self.in_data_dir(&self.envs_dir) }

  #[cfg(unix)]
  pub fn endpoint(&self) -> Endpoint { Endpoint::Unix(self.in_data_dir(&self.endpoint)) }

  #[cfg(not(unix))]
  pub fn endpoint(&self) -> Endpoint { Endpoint::Loopback(self.port) }

  pub fn install_timeout(&self) -> Duration { Duration::from_secs(self.install_timeout_secs) }

  pub fn sandbox_timeout(&self) -> Duration { Duration::from_secs(self.sandbox_timeout_secs) }

  pub fn rpc_timeout(&self) -> Duration { Duration::from_secs(self.rpc_timeout_secs) }

  pub fn tool_paths(&self) -> ToolPaths {
    ToolPaths { ruff: self.ruff.clone(), bandit: self.bandit.clone(), safety: self.safety.clone() }
  }

  pub fn service_config(&self) -> ServiceConfig {
    ServiceConfig {
      lock_timeout:     Duration::from_secs(self.lock_timeout_secs),
      cache_threshold:  self.cache_threshold,
      cache_capacity:   self.cache_capacity,
      heal_max_retries: self.heal_max_retries,
    }
  }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Some(home) = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE"))
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
