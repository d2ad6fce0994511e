mod cache;
mod clients;
mod config;
mod engine;
mod error;
mod lifecycle;
mod network;
mod precache;
mod request;
mod router;
mod server;
mod sweeper;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

use cache::{CacheStore, MemoryStore, SqliteStore};
use engine::{Engine, FetchOutcome};
use network::HttpFetcher;
use request::Request;

#[derive(Parser, Debug)]
#[command(name = "shellcache")]
#[command(about = "An offline-first caching proxy for single-page applications")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/shellcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Application origin / scope URL
  #[arg(short, long)]
  origin: Option<String>,

  /// Version token for this deployment's cache generation
  #[arg(long = "version-tag")]
  version_tag: Option<String>,

  /// Keep the cache in memory instead of the SQLite database
  #[arg(long)]
  ephemeral: bool,

  /// Also write logs to daily files in this directory
  #[arg(long)]
  log_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the manifest into this version's generation
  Install,
  /// Install and, if it succeeds, activate
  Activate,
  /// Install + activate, falling back to an installed generation when offline
  Start,
  /// Run one request through the engine and print the result
  Fetch {
    /// Absolute URL or path relative to the origin
    url: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
  },
  /// List cache generations in the store
  Generations,
  /// Delete every generation except this version's
  Sweep,
  /// Run the reverse proxy
  Serve,
}

/// Initialize the tracing subscriber for logging.
///
/// RUST_LOG controls the level (default: shellcache=info).
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("shellcache=info"));

  let (file_layer, guard) = match log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "shellcache.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      (
        Some(fmt::layer().with_writer(writer).with_ansi(false)),
        Some(guard),
      )
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(io::stderr))
    .with(file_layer)
    .with(filter)
    .init();

  guard
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_tracing(args.log_dir.as_deref());

  // Load configuration, then apply command line overrides
  let mut config = config::Config::load(args.config.as_deref())?;
  if let Some(origin) = args.origin.clone() {
    config.origin = Some(origin);
  }
  if let Some(version) = args.version_tag.clone() {
    config.version = version;
  }

  if args.ephemeral {
    run(MemoryStore::new(), config, args.command).await
  } else {
    let store = match &config.database {
      Some(path) => SqliteStore::open(path)?,
      None => SqliteStore::open_default()?,
    };
    run(store, config, args.command).await
  }
}

async fn run<S: CacheStore>(store: S, config: config::Config, command: Command) -> Result<()> {
  let deployment = config.deployment()?;
  let fetcher = HttpFetcher::new(config.timeout())?;
  let engine = Arc::new(Engine::new(deployment, Arc::new(store), Arc::new(fetcher)));
  info!(generation = %engine.deployment().generation, "engine ready");

  let mut out = io::stdout();
  match command {
    Command::Install => {
      let outcome = engine.install().await?;
      writeln!(
        out,
        "installed {} ({} assets, {:?})",
        outcome.generation,
        outcome.stored,
        engine.state()
      )?;
    }
    Command::Activate => {
      engine.install().await?;
      let outcome = engine.activate().await?;
      report_activation(&mut out, &outcome)?;
    }
    Command::Start => match engine.start().await? {
      Some(outcome) => report_activation(&mut out, &outcome)?,
      None => writeln!(
        out,
        "serving {}",
        engine.serving_generation().unwrap_or_default()
      )?,
    },
    Command::Fetch { url, method } => {
      engine.start().await?;
      let url = resolve_target(&engine.deployment().scope, &url)?;
      let method: reqwest::Method = method
        .to_uppercase()
        .parse()
        .map_err(|_| eyre!("Invalid method {}", method))?;
      let client = engine.register_client();
      let request = Request::new(method, url).with_client(client);

      let (response, source) = match engine.handle_fetch(&request).await {
        FetchOutcome::Respond(served) => (served.response, served.source.as_str()),
        FetchOutcome::Fallthrough => (engine.passthrough(&request).await?, "passthrough"),
      };
      engine.unregister_client(client);
      engine.drain_writes().await;

      writeln!(out, "{} ({})", response.status, source)?;
      for (name, value) in &response.headers {
        writeln!(out, "{}: {}", name, value)?;
      }
      writeln!(out)?;
      out.write_all(&response.body)?;
      writeln!(out)?;
    }
    Command::Generations => {
      for id in engine.generation_ids().await? {
        let marker = if id == engine.deployment().generation { "*" } else { " " };
        writeln!(out, "{} {}", marker, id)?;
      }
    }
    Command::Sweep => {
      let deleted = sweeper::Sweeper::new(Arc::clone(engine.store()))
        .sweep(&engine.deployment().generation)
        .await?;
      writeln!(out, "deleted {} generation(s)", deleted.len())?;
      for id in deleted {
        writeln!(out, "  {}", id)?;
      }
    }
    Command::Serve => {
      engine.start().await?;
      let listener = tokio::net::TcpListener::bind(config.listen).await?;
      server::serve(engine, listener).await?;
    }
  }

  Ok(())
}

fn report_activation(out: &mut impl Write, outcome: &engine::ActivateOutcome) -> Result<()> {
  writeln!(
    out,
    "active {} (swept {}, claimed {} clients)",
    outcome.generation,
    outcome.deleted.len(),
    outcome.claimed
  )?;
  Ok(())
}

/// Accept either an absolute URL or a path relative to the scope.
fn resolve_target(scope: &Url, target: &str) -> Result<Url> {
  Url::parse(target)
    .or_else(|_| scope.join(target))
    .map_err(|e| eyre!("Invalid URL {}: {}", target, e))
}
