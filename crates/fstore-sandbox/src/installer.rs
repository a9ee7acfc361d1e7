//! Creating isolated interpreter environments.

use std::{
  path::{Path, PathBuf},
  process::Stdio,
  time::Duration,
};

use async_trait::async_trait;
use tokio::{
  io::{AsyncBufReadExt, AsyncRead, BufReader},
  process::Command,
};
use tracing::{debug, info};

use crate::{Error, Result};

const VENV_TIMEOUT: Duration = Duration::from_secs(60);

/// Interpreter location inside an environment directory.
pub fn interpreter_path(env_dir: &Path) -> PathBuf {
  if cfg!(windows) {
    env_dir.join("Scripts").join("python.exe")
  } else {
    env_dir.join("bin").join("python")
  }
}

/// Builds environments and reports what ended up installed in them.
///
/// Implementations do not clean up after a failed `create`; the pool removes
/// the directory so an entry is either complete or absent.
#[async_trait]
pub trait EnvInstaller: Send + Sync {
  /// Create an environment in `env_dir` and install `dependencies` into it,
  /// giving up after `timeout`.
  async fn create(&self, env_dir: &Path, dependencies: &[String], timeout: Duration)
  -> Result<()>;

  /// Exact `name==version` pins of everything installed for `python`.
  async fn freeze(&self, python: &Path) -> Result<Vec<String>>;
}

/// [`EnvInstaller`] backed by `uv venv` and `uv pip`.
#[derive(Debug, Clone)]
pub struct UvInstaller {
  uv: PathBuf,
}

impl UvInstaller {
  pub fn new(uv: impl Into<PathBuf>) -> Self { Self { uv: uv.into() } }
}

impl Default for UvInstaller {
  fn default() -> Self { Self::new("uv") }
}

async fn stream_lines<R: AsyncRead + Unpin>(reader: Option<R>, env: &str) -> Vec<String> {
  let Some(reader) = reader else {
    return Vec::new();
  };
  let mut lines = BufReader::new(reader).lines();
  let mut captured = Vec::new();
  while let Ok(Some(line)) = lines.next_line().await {
    let line = line.trim();
    if !line.is_empty() {
      info!(target: "fstore::install", env, "{line}");
      captured.push(line.to_owned());
    }
  }
  captured
}

fn env_key(env_dir: &Path) -> String {
  env_dir
    .file_name()
    .map_or_else(|| env_dir.display().to_string(), |n| n.to_string_lossy().into_owned())
}

#[async_trait]
impl EnvInstaller for UvInstaller {
  async fn create(
    &self,
    env_dir: &Path,
    dependencies: &[String],
    timeout: Duration,
  ) -> Result<()> {
    let key = env_key(env_dir);

    let venv = Command::new(&self.uv)
      .arg("venv")
      .arg(env_dir)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .output();
    let venv = tokio::time::timeout(VENV_TIMEOUT, venv)
      .await
      .map_err(|_| Error::InstallTimeout { key: key.clone(), timeout: VENV_TIMEOUT })??;
    if !venv.status.success() {
      return Err(Error::EnvironmentBuild {
        key,
        detail: format!("uv venv failed: {}", String::from_utf8_lossy(&venv.stderr).trim()),
      });
    }

    let python = interpreter_path(env_dir);
    let mut child = Command::new(&self.uv)
      .args(["pip", "install", "--python"])
      .arg(&python)
      .args(dependencies)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .spawn()?;
    info!(env = %key, ?dependencies, "installation started");

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let install = async {
      tokio::join!(
        stream_lines(stdout, &key),
        stream_lines(stderr, &key),
        child.wait()
      )
    };

    let (out, err, status) = match tokio::time::timeout(timeout, install).await {
      Ok(done) => done,
      Err(_) => {
        let _ = child.kill().await;
        return Err(Error::InstallTimeout { key, timeout });
      }
    };

    let status = status?;
    if !status.success() {
      let log = out.into_iter().chain(err).collect::<Vec<_>>().join("\n");
      return Err(Error::EnvironmentBuild {
        key,
        detail: format!("install failed ({status}):\n{log}"),
      });
    }
    info!(env = %key, "installation finished");
    Ok(())
  }

  async fn freeze(&self, python: &Path) -> Result<Vec<String>> {
    let output = Command::new(&self.uv)
      .args(["pip", "freeze", "--python"])
      .arg(python)
      .stdin(Stdio::null())
      .kill_on_drop(true)
      .output()
      .await?;
    if !output.status.success() {
      return Err(Error::EnvironmentBuild {
        key:    python.display().to_string(),
        detail: format!("uv pip freeze failed: {}", String::from_utf8_lossy(&output.stderr).trim()),
      });
    }
    let pins: Vec<String> = String::from_utf8_lossy(&output.stdout)
      .lines()
      .map(str::trim)
      .filter(|l| !l.is_empty())
      .map(str::to_owned)
      .collect();
    debug!(python = %python.display(), count = pins.len(), "captured lockfile");
    Ok(pins)
  }
}
