mod cache;
mod config;
mod error;
mod interceptor;
mod lifecycle;
mod origin;
mod replay;
mod router;

use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cache::{CacheSource, CacheStorage, SqliteStorage};
use interceptor::{InterceptedRequest, Interceptor, MutationOutcome};
use lifecycle::InstallOutcome;
use replay::Mutation;
use router::Destination;

#[derive(Parser, Debug)]
#[command(name = "relaycache")]
#[command(about = "Offline-first request cache with versioned stores and mutation replay")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/relaycache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Generation tag to operate on (overrides the config file)
  #[arg(short, long)]
  generation: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Pre-populate the static store of the current generation
  Install,
  /// Prune stores of other generations and start serving from cache
  Activate,
  /// Show the lifecycle state of the current generation
  Status,
  /// Send a request through the interceptor
  Fetch {
    /// Path (or absolute URL) to request
    path: String,
    #[arg(short, long, default_value = "GET")]
    method: String,
    #[arg(short, long, value_enum, default_value_t = Destination::Empty)]
    destination: Destination,
    /// Request header as "Name: value" (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Request body, sent as-is
    #[arg(short, long)]
    body: Option<String>,
  },
  /// List stores and the identities they hold
  Stores {
    /// Also print every stored identity
    #[arg(long)]
    keys: bool,
  },
  /// Submit a mutation, queueing it if the origin is unreachable
  Mutate {
    method: String,
    path: String,
    /// JSON request body
    #[arg(short, long)]
    body: Option<String>,
  },
  /// Fire a reconnect signal and replay queued mutations
  Sync {
    #[arg(short, long)]
    tag: Option<String>,
  },
  /// List queued mutations
  Pending {
    #[arg(short, long)]
    tag: Option<String>,
  },
}

/// Initialize the tracing subscriber for logging.
///
/// Use RELAYCACHE_LOG to control the level (e.g. RELAYCACHE_LOG=debug).
/// With a log directory, a daily rolling file is written as well.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
  let filter =
    EnvFilter::try_from_env("RELAYCACHE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  let (file_layer, guard) = match log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "relaycache.log");
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

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  // Override generation if specified on command line
  let config = if let Some(generation) = args.generation {
    config::Config {
      generation,
      ..config
    }
  } else {
    config
  };

  let _guard = init_tracing(config.log_dir.as_deref());

  let storage = Arc::new(SqliteStorage::open_at(&config.database_path()?)?);
  let interceptor = Interceptor::new(&config, Arc::clone(&storage))?;
  info!(generation = %config.generation, origin = %config.origin, "relaycache starting");

  match args.command {
    Command::Install => match interceptor.install().await? {
      InstallOutcome::Installed(count) => {
        println!("Installed generation {} ({} assets)", config.generation, count)
      }
      InstallOutcome::AlreadyInstalled => {
        println!("Generation {} already installed", config.generation)
      }
    },
    Command::Activate => {
      let deleted = interceptor.activate()?;
      println!("Generation {} active", config.generation);
      for name in deleted {
        println!("  deleted {}", name);
      }
    }
    Command::Status => {
      let lifecycle = interceptor.lifecycle();
      println!("{}: {}", lifecycle.generation(), lifecycle.state()?);
    }
    Command::Fetch {
      path,
      method,
      destination,
      headers,
      body,
    } => {
      let method = Method::from_str(&method.to_uppercase())
        .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;
      let mut request =
        InterceptedRequest::new(method, interceptor.client().resolve(&path)?, destination);
      for header in headers {
        let (name, value) = header
          .split_once(':')
          .ok_or_else(|| eyre!("Header '{}' is not in 'Name: value' form", header))?;
        request = request.with_header(name.trim(), value.trim());
      }
      if let Some(body) = body {
        request = request.with_body(body);
      }

      let result = interceptor.handle(request).await?;
      if result.source == CacheSource::Offline {
        warn!("Origin unreachable, serving stored copy");
      }
      println!("{} ({})", result.data.status, result.source);
      for (name, value) in &result.data.headers {
        println!("{}: {}", name, value);
      }
      println!();
      println!("{}", result.data.body_text());

      interceptor.settle().await?;
    }
    Command::Stores { keys } => {
      for name in storage.list_store_names()? {
        let store = storage.open(&name)?;
        let identities = storage.keys(&store)?;
        println!("{} ({} entries)", name, identities.len());
        if keys {
          for identity in identities {
            println!("  {}", identity);
          }
        }
      }
    }
    Command::Mutate { method, path, body } => {
      let method = Method::from_str(&method.to_uppercase())
        .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;
      let body = body
        .map(|b| serde_json::from_str(&b))
        .transpose()
        .map_err(|e| eyre!("Body is not valid JSON: {}", e))?;

      match interceptor
        .submit_mutation(Mutation::new(&method, path, body))
        .await?
      {
        MutationOutcome::Sent(response) => println!("{}", response.status),
        MutationOutcome::Queued(id) => println!(
          "Origin unreachable, queued as task {} ({})",
          id,
          interceptor.reconnect_tag()
        ),
      }
    }
    Command::Sync { tag } => {
      let tag = tag.unwrap_or_else(|| interceptor.reconnect_tag().to_string());
      let report = interceptor.on_reconnect(&tag).await?;
      println!("{} replayed, {} still pending", report.replayed, report.failed);
    }
    Command::Pending { tag } => {
      let tag = tag.unwrap_or_else(|| interceptor.reconnect_tag().to_string());
      for task in interceptor.replay_queue().pending(&tag)? {
        println!(
          "{}\t{}\t{} {}\tattempts={}\tqueued={}",
          task.id,
          task.tag,
          task.mutation.method,
          task.mutation.path,
          task.attempts,
          task.enqueued_at.to_rfc3339()
        );
      }
    }
  }

  Ok(())
}
