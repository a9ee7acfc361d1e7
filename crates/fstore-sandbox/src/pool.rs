//! The environment pool.
//!
//! Environments are keyed by a hash of the sorted, lower-cased dependency
//! list and live under `<root>/<key>`. A request of unpinned names that fits
//! inside a preset bundle shares the preset's environment instead of getting
//! its own. Whether the host interpreter already provides a set is probed
//! once per set and remembered. A
//! successful build leaves a ready marker; a directory without one is a
//! leftover from an interrupted build and is rebuilt.

use std::{
  collections::{BTreeSet, HashMap},
  path::{Path, PathBuf},
  process::Stdio,
  sync::Arc,
  time::Duration,
};

use sha2::{Digest, Sha256};
use tokio::{process::Command, sync::Mutex};
use tracing::{debug, info, warn};

use fstore_core::packages;

use crate::{
  Result,
  installer::{EnvInstaller, interpreter_path},
};

const READY_MARKER: &str = ".fstore-ready";

/// Preset bundles, checked in order.
const PRESETS: &[(&str, &[&str])] = &[
  ("data-science", &["numpy", "pandas", "scipy", "scikit-learn", "matplotlib"]),
  ("web-scraping", &["requests", "beautifulsoup4", "httpx", "lxml"]),
];

const PROBE_SCRIPT: &str = "import importlib.util, sys\n\
sys.exit(0 if all(importlib.util.find_spec(m) for m in sys.argv[1:]) else 1)\n";

/// An interpreter that can run code with a given dependency set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Runtime {
  pub python: PathBuf,
  /// Pool key; `None` for the host interpreter.
  pub key:    Option<String>,
}

impl Runtime {
  pub fn is_host(&self) -> bool { self.key.is_none() }
}

/// The package name of a requirement, lower-cased and without version
/// specifiers or extras.
pub fn normalize_requirement(req: &str) -> String {
  let end = req
    .find(|c: char| matches!(c, '=' | '<' | '>' | '!' | '~' | '[' | ';' | ' '))
    .unwrap_or(req.len());
  req[..end].trim().to_lowercase()
}

fn short_hash(input: &str, len: usize) -> String {
  let digest = hex::encode(Sha256::digest(input.as_bytes()));
  digest[..len].to_owned()
}

/// The pool key and the dependency list to install for `dependencies`.
///
/// Order-independent: any permutation of the same set yields the same key.
pub fn pool_key(dependencies: &[String]) -> (String, Vec<String>) {
  let requested: BTreeSet<String> =
    dependencies.iter().map(|d| normalize_requirement(d)).filter(|d| !d.is_empty()).collect();
  // A pin or extra must be installed as written.
  let unpinned = dependencies.iter().all(|d| d.trim().to_lowercase() == normalize_requirement(d));

  for (name, preset) in PRESETS {
    if unpinned
      && !requested.is_empty()
      && requested.iter().all(|r| preset.contains(&r.as_str()))
    {
      let mut members: Vec<String> = preset.iter().map(|s| (*s).to_owned()).collect();
      members.sort();
      let key = format!("base_{name}_{}", short_hash(&members.join("|"), 8));
      return (key, members);
    }
  }

  let exact: BTreeSet<String> = dependencies.iter().map(|d| d.trim().to_lowercase()).collect();
  let exact: Vec<String> = exact.into_iter().filter(|d| !d.is_empty()).collect();
  (short_hash(&exact.join("|"), 12), exact)
}

pub struct EnvironmentPool {
  root:            PathBuf,
  host_python:     PathBuf,
  installer:       Arc<dyn EnvInstaller>,
  install_timeout: Duration,
  ready:           Mutex<HashMap<String, PathBuf>>,
  /// Host probe results by sorted module list.
  host_probes:     Mutex<HashMap<Vec<String>, bool>>,
}

impl EnvironmentPool {
  pub fn new(
    root: impl Into<PathBuf>,
    host_python: impl Into<PathBuf>,
    installer: Arc<dyn EnvInstaller>,
    install_timeout: Duration,
  ) -> Self {
    Self {
      root: root.into(),
      host_python: host_python.into(),
      installer,
      install_timeout,
      ready: Mutex::new(HashMap::new()),
      host_probes: Mutex::new(HashMap::new()),
    }
  }

  pub fn root(&self) -> &Path { &self.root }

  fn host(&self) -> Runtime { Runtime { python: self.host_python.clone(), key: None } }

  /// An interpreter for `dependencies`, building its environment if needed.
  ///
  /// Builds are serialised; a second request for the same key waits for the
  /// first and then reuses its result.
  pub async fn resolve(&self, dependencies: &[String]) -> Result<Runtime> {
    if dependencies.is_empty() || self.host_provides(dependencies).await {
      debug!(?dependencies, "dependencies met by the host interpreter");
      return Ok(self.host());
    }

    let (key, install) = pool_key(dependencies);
    let mut ready = self.ready.lock().await;
    if let Some(python) = ready.get(&key) {
      debug!(%key, "environment cache hit");
      return Ok(Runtime { python: python.clone(), key: Some(key) });
    }

    let dir = self.root.join(&key);
    let python = interpreter_path(&dir);
    if dir.join(READY_MARKER).exists() {
      debug!(%key, "reusing environment built by an earlier process");
      ready.insert(key.clone(), python.clone());
      return Ok(Runtime { python, key: Some(key) });
    }

    if dir.exists() {
      warn!(%key, "removing partially built environment");
      tokio::fs::remove_dir_all(&dir).await?;
    }
    tokio::fs::create_dir_all(&self.root).await?;

    info!(%key, dependencies = ?install, "building environment");
    if let Err(err) = self.installer.create(&dir, &install, self.install_timeout).await {
      warn!(%key, error = %err, "environment build failed, removing it");
      if dir.exists()
        && let Err(rm) = tokio::fs::remove_dir_all(&dir).await
      {
        warn!(%key, error = %rm, "could not remove failed environment");
      }
      return Err(err);
    }
    tokio::fs::write(dir.join(READY_MARKER), install.join("\n")).await?;

    ready.insert(key.clone(), python.clone());
    Ok(Runtime { python, key: Some(key) })
  }

  /// Exact pins installed in `runtime`.
  pub async fn capture_lockfile(&self, runtime: &Runtime) -> Result<Vec<String>> {
    self.installer.freeze(&runtime.python).await
  }

  async fn host_provides(&self, dependencies: &[String]) -> bool {
    let modules: Vec<String> = dependencies
      .iter()
      .map(|d| packages::import_for(&normalize_requirement(d)))
      .collect::<BTreeSet<_>>()
      .into_iter()
      .collect();

    let mut probes = self.host_probes.lock().await;
    if let Some(&provided) = probes.get(&modules) {
      return provided;
    }
    let provided = self.probe_host(&modules).await;
    probes.insert(modules, provided);
    provided
  }

  async fn probe_host(&self, modules: &[String]) -> bool {
    debug!(?modules, "probing host interpreter");
    let status = Command::new(&self.host_python)
      .arg("-c")
      .arg(PROBE_SCRIPT)
      .args(modules)
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::null())
      .kill_on_drop(true)
      .status();
    match tokio::time::timeout(Duration::from_secs(15), status).await {
      Ok(Ok(status)) => status.success(),
      _ => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicU32, Ordering};

  use async_trait::async_trait;

  use super::*;
  use crate::Error;

  #[derive(Default)]
  struct CountingInstaller {
    builds: AtomicU32,
    fail:   bool,
  }

  #[async_trait]
  impl EnvInstaller for CountingInstaller {
    async fn create(&self, env_dir: &Path, deps: &[String], _timeout: Duration) -> Result<()> {
      self.builds.fetch_add(1, Ordering::SeqCst);
      tokio::fs::create_dir_all(env_dir).await?;
      if self.fail {
        return Err(Error::EnvironmentBuild { key: "test".into(), detail: deps.join(",") });
      }
      Ok(())
    }

    async fn freeze(&self, _python: &Path) -> Result<Vec<String>> {
      Ok(vec!["alpha==1.0".into()])
    }
  }

  fn pool(root: &Path, installer: Arc<CountingInstaller>) -> EnvironmentPool {
    EnvironmentPool::new(root, "fstore-no-such-python", installer, Duration::from_secs(5))
  }

  fn deps(names: &[&str]) -> Vec<String> { names.iter().map(|s| (*s).to_owned()).collect() }

  #[test]
  fn key_is_order_independent() {
    let (a, _) = pool_key(&deps(&["b", "a"]));
    let (b, _) = pool_key(&deps(&["a", "b"]));
    let (c, _) = pool_key(&deps(&["A ", "b"]));
    assert_eq!(a, b);
    assert_eq!(a, c);
    assert_eq!(a.len(), 12);
  }

  #[test]
  fn preset_subset_shares_preset_key() {
    let (key, install) = pool_key(&deps(&["pandas", "NumPy"]));
    assert!(key.starts_with("base_data-science_"));
    assert_eq!(install.len(), 5);

    let (other, _) = pool_key(&deps(&["scipy"]));
    assert_eq!(key, other);

    let (bespoke, _) = pool_key(&deps(&["pandas", "requests"]));
    assert!(!bespoke.starts_with("base_"));
  }

  #[test]
  fn pinned_requirements_skip_presets() {
    let (key, install) = pool_key(&deps(&["numpy==1.20"]));
    assert!(!key.starts_with("base_"));
    assert_eq!(install, vec!["numpy==1.20"]);

    let (key, _) = pool_key(&deps(&["numpy", "pandas"]));
    assert!(key.starts_with("base_data-science_"));
  }

  #[test]
  fn requirements_are_normalised() {
    assert_eq!(normalize_requirement("Requests[socks]>=2.0"), "requests");
    assert_eq!(normalize_requirement("numpy==1.26.4"), "numpy");
    assert_eq!(normalize_requirement("attrs"), "attrs");
  }

  #[tokio::test]
  async fn empty_dependencies_use_host() {
    let dir = tempfile::tempdir().unwrap();
    let installer = Arc::new(CountingInstaller::default());
    let runtime = pool(dir.path(), installer.clone()).resolve(&[]).await.unwrap();
    assert!(runtime.is_host());
    assert_eq!(installer.builds.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn same_set_installs_once() {
    let dir = tempfile::tempdir().unwrap();
    let installer = Arc::new(CountingInstaller::default());
    let pool = pool(dir.path(), installer.clone());

    let first = pool.resolve(&deps(&["beta", "alpha"])).await.unwrap();
    let second = pool.resolve(&deps(&["alpha", "beta"])).await.unwrap();
    assert_eq!(first, second);
    assert!(!first.is_host());
    assert_eq!(installer.builds.load(Ordering::SeqCst), 1);
    assert_eq!(pool.capture_lockfile(&first).await.unwrap(), vec!["alpha==1.0"]);
  }

  #[tokio::test]
  async fn ready_marker_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let installer = Arc::new(CountingInstaller::default());
    pool(dir.path(), installer.clone()).resolve(&deps(&["alpha"])).await.unwrap();

    let restarted = pool(dir.path(), installer.clone());
    restarted.resolve(&deps(&["alpha"])).await.unwrap();
    assert_eq!(installer.builds.load(Ordering::SeqCst), 1);
  }

  /// A stand-in host interpreter that logs the module names of each probe to
  /// `calls.log` and exits with `code`.
  #[cfg(unix)]
  fn fake_host(dir: &Path, code: i32) -> PathBuf {
    use std::os::unix::fs::PermissionsExt as _;

    let path = dir.join("fake-python");
    let log = dir.join("calls.log");
    let script =
      format!("#!/bin/sh\nshift 2\necho \"$*\" >> '{}'\nexit {code}\n", log.display());
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
  }

  #[cfg(unix)]
  fn host_calls(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("calls.log"))
      .unwrap_or_default()
      .lines()
      .map(str::to_owned)
      .collect()
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn warm_resolve_does_not_probe_host_again() {
    let dir = tempfile::tempdir().unwrap();
    let installer = Arc::new(CountingInstaller::default());
    let host = fake_host(dir.path(), 1);
    let pool = EnvironmentPool::new(
      dir.path().join("envs"),
      host,
      installer.clone(),
      Duration::from_secs(5),
    );

    let first = pool.resolve(&deps(&["requests"])).await.unwrap();
    let second = pool.resolve(&deps(&["requests"])).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(installer.builds.load(Ordering::SeqCst), 1);
    assert_eq!(host_calls(dir.path()).len(), 1);
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn host_probe_uses_import_names() {
    let dir = tempfile::tempdir().unwrap();
    let installer = Arc::new(CountingInstaller::default());
    let host = fake_host(dir.path(), 0);
    let pool = EnvironmentPool::new(
      dir.path().join("envs"),
      host,
      installer.clone(),
      Duration::from_secs(5),
    );

    let runtime = pool.resolve(&deps(&["scikit-learn", "Pillow>=10"])).await.unwrap();
    assert!(runtime.is_host());
    pool.resolve(&deps(&["Pillow", "scikit-learn"])).await.unwrap();
    assert_eq!(installer.builds.load(Ordering::SeqCst), 0);

    let calls = host_calls(dir.path());
    assert_eq!(calls, vec!["PIL sklearn"]);
  }

  #[tokio::test]
  async fn failed_build_leaves_nothing_behind() {
    let dir = tempfile::tempdir().unwrap();
    let installer = Arc::new(CountingInstaller { fail: true, ..Default::default() });
    let pool = pool(dir.path(), installer.clone());

    let err = pool.resolve(&deps(&["alpha"])).await.unwrap_err();
    assert!(matches!(err, Error::EnvironmentBuild { .. }));
    let (key, _) = pool_key(&deps(&["alpha"]));
    assert!(!dir.path().join(key).exists());

    // Not cached: the next request tries again.
    pool.resolve(&deps(&["alpha"])).await.unwrap_err();
    assert_eq!(installer.builds.load(Ordering::SeqCst), 2);
  }
}
