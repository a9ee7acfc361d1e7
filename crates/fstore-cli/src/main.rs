//! `fstore`: command-line front end for the function store.
//!
//! Every invocation first runs the Master/Proxy election on the configured
//! endpoint. The Master opens the database and serves other processes while
//! it runs; a Proxy forwards its command to the Master.
//!
//! # Usage
//!
//! ```
//! fstore serve
//! fstore save add --file add.py --description "Add two numbers" --tests add_tests.json
//! fstore search "sum of two numbers" --limit 3
//! fstore get quadruple --bundle
//! ```

mod settings;

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use anyhow::{Context as _, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

use fstore_analysis::{PythonGate, QualityGate};
use fstore_core::{
  function::{NewFunction, TestCase},
  store::{FunctionStore, ListQuery},
};
use fstore_rpc::{ProcessCoordinator, Role};
use fstore_sandbox::{EnvironmentPool, SandboxRunner, UvInstaller};
use fstore_service::{Components, FunctionService, HashingEmbedder};
use fstore_store_sqlite::{SqliteStore, WriteCoordinator};

use crate::settings::Settings;

// ─── CLI args ─────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "fstore", author, version, about = "Verified, searchable Python function store")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "fstore.toml")]
  config: PathBuf,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run as Master until interrupted, serving other fstore processes.
  Serve,

  /// Save a new version of a function.
  Save {
    name:              String,
    /// Source file, or `-` for stdin.
    #[arg(short, long, value_name = "FILE")]
    file:              PathBuf,
    #[arg(short, long, default_value = "")]
    description:       String,
    #[arg(long)]
    description_en:    Option<String>,
    #[arg(long)]
    description_jp:    Option<String>,
    #[arg(short, long = "tag")]
    tags:              Vec<String>,
    /// Third-party package the code needs, e.g. `pandas>=2`.
    #[arg(long = "dependency")]
    dependencies:      Vec<String>,
    /// JSON file holding an array of `{"input": {...}, "expected": ...}`.
    #[arg(long, value_name = "FILE")]
    tests:             Option<PathBuf>,
    /// Callable the tests invoke; defaults to the last public one.
    #[arg(long)]
    entry_point:       Option<String>,
    #[arg(long)]
    skip_verification: bool,
  },

  /// Semantic search.
  Search {
    query: String,
    #[arg(short, long, default_value_t = 5)]
    limit: usize,
  },

  /// Print the code of a function.
  Get {
    name:   String,
    /// Prepend every stored function it calls.
    #[arg(long)]
    bundle: bool,
  },

  Delete { name: String },

  History { name: String },

  Details { name: String },

  /// Print one version, archived or current.
  Version { name: String, version: u32 },

  List {
    #[arg(long)]
    text:  Option<String>,
    #[arg(long)]
    tag:   Option<String>,
    #[arg(short, long)]
    limit: Option<usize>,
  },

  Stats,

  /// Functions that need attention, worst first.
  Triage {
    #[arg(short, long, default_value_t = 10)]
    limit: usize,
  },

  Diagnose { name: String },
}

// ─── Entry point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  // Logs go to stderr; stdout carries results only.
  tracing_subscriber::fmt()
    .with_writer(std::io::stderr)
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();
  let settings = Settings::load(&cli.config)?;
  let coordinator = ProcessCoordinator::new(settings.endpoint(), settings.rpc_timeout());

  match coordinator.elect().await.context("role election failed")? {
    Role::Proxy(remote) => {
      if matches!(cli.command, Command::Serve) {
        bail!("a master is already serving {}", remote.endpoint());
      }
      run(&remote, cli.command).await
    }
    Role::Master(seat) => {
      let service = Arc::new(open_service(&settings).await?);
      service.reconcile().await.context("startup reconciliation failed")?;
      let server = seat.serve(service.clone());

      let result = match cli.command {
        Command::Serve => {
          tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
          info!("interrupted, shutting down");
          Ok(())
        }
        command => run(&*service, command).await,
      };

      server.shutdown().await;
      service.shutdown().await;
      result
    }
  }
}

/// Assemble the Master's service from `settings`.
async fn open_service(settings: &Settings) -> anyhow::Result<FunctionService> {
  let db_path = settings.db_path();
  let db = SqliteStore::open(&db_path)
    .await
    .with_context(|| format!("failed to open store at {db_path:?}"))?;
  let lock_path = settings.lock_path();
  let writes = WriteCoordinator::open(&lock_path)
    .with_context(|| format!("failed to open lock file {lock_path:?}"))?;

  let components = Components {
    analyzer: Arc::new(PythonGate),
    quality:  QualityGate::with_tools(settings.quality.clone(), settings.tool_paths()),
    pool:     EnvironmentPool::new(
      settings.envs_path(),
      settings.python.clone(),
      Arc::new(UvInstaller::new(settings.uv.clone())),
      settings.install_timeout(),
    ),
    runner:   SandboxRunner::new(settings.sandbox_timeout()),
    embedder: Arc::new(HashingEmbedder::new(settings.embedding_dimension)),
  };

  info!(db = %db_path.display(), "store opened");
  Ok(FunctionService::new(db, writes, components, settings.service_config()))
}

// ─── Commands ─────────────────────────────────────────────────────────────────

async fn run<S: FunctionStore>(store: &S, command: Command) -> anyhow::Result<()> {
  match command {
    Command::Serve => bail!("serve is handled by the master"),
    Command::Save {
      name,
      file,
      description,
      description_en,
      description_jp,
      tags,
      dependencies,
      tests,
      entry_point,
      skip_verification,
    } => {
      let test_cases = match tests {
        Some(path) => read_tests(&path).await?,
        None => Vec::new(),
      };
      let input = NewFunction {
        description,
        description_en,
        description_jp,
        tags,
        dependencies,
        test_cases,
        entry_point,
        skip_verification,
        ..NewFunction::new(name, read_source(&file).await?)
      };
      println!("{}", store.save(input).await?);
    }
    Command::Search { query, limit } => print_json(&store.search(&query, limit).await?)?,
    Command::Get { name, bundle } => println!("{}", store.get(&name, bundle).await?),
    Command::Delete { name } => println!("{}", store.delete(&name).await?),
    Command::History { name } => print_json(&store.history(&name).await?)?,
    Command::Details { name } => print_json(&store.details(&name).await?)?,
    Command::Version { name, version } => print_json(&store.version(&name, version).await?)?,
    Command::List { text, tag, limit } => {
      print_json(&store.list(&ListQuery { text, tag, limit }).await?)?
    }
    Command::Stats => print_json(&store.stats().await?)?,
    Command::Triage { limit } => print_json(&store.triage(limit).await?)?,
    Command::Diagnose { name } => print_json(&store.diagnose(&name).await?)?,
  }
  Ok(())
}

async fn read_source(file: &Path) -> anyhow::Result<String> {
  if file.as_os_str() == "-" {
    let mut code = String::new();
    tokio::io::stdin().read_to_string(&mut code).await.context("failed to read stdin")?;
    return Ok(code);
  }
  tokio::fs::read_to_string(file).await.with_context(|| format!("failed to read {file:?}"))
}

async fn read_tests(path: &Path) -> anyhow::Result<Vec<TestCase>> {
  let raw = tokio::fs::read_to_string(path)
    .await
    .with_context(|| format!("failed to read {path:?}"))?;
  serde_json::from_str(&raw).with_context(|| format!("{path:?} is not a JSON array of test cases"))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}
