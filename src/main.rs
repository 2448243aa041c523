use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use offgrid::cache::StoreName;
use offgrid::control::{ControlChannel, ControlReply, ControlRequest};
use offgrid::{Agent, Config};

#[derive(Parser, Debug)]
#[command(name = "offgrid")]
#[command(about = "Offline caching and write-queue agent")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offgrid/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch the core assets of the configured release
  Install,
  /// Make the configured release the serving one and purge older stores
  Activate,
  /// Promote a waiting release even if pages are still open
  SkipWaiting,
  /// Show the lifecycle state of the configured release
  Status,
  /// Send one request through the agent
  Fetch {
    /// Path on the configured origin, e.g. /api/properties
    path: String,
    #[arg(short, long, default_value = "GET")]
    method: String,
    /// Accept header to send
    #[arg(short, long)]
    accept: Option<String>,
    /// Request body
    #[arg(short, long)]
    body: Option<String>,
  },
  /// Replay queued writes
  Sync,
  /// List pending and dead-lettered writes
  Queue,
  /// Total cached bytes
  CacheSize,
  /// Delete every cache store
  ClearCache,
  /// List cache stores and their entries
  Stores,
  /// Show a notification from a push payload
  Push {
    /// JSON payload, e.g. '{"title":"Hi","url":"/"}'
    payload: String,
  },
}

/// Log to stderr and to a daily file under `log_dir`. `RUST_LOG` overrides
/// the default filter. Keep the guard alive until exit so the file writer
/// flushes.
fn init_tracing(log_dir: &Path) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let file_appender = tracing_appender::rolling::daily(log_dir, "offgrid.log");
  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("offgrid=info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(io::stderr))
    .with(fmt::layer().with_ansi(false).with_writer(file_writer))
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _guard = init_tracing(&config.log_dir()?)?;
  info!(release = %config.release, origin = %config.origin, "Starting agent");

  let agent = Arc::new(Agent::open(&config)?);

  match args.command {
    Command::Install => {
      let state = agent.install().await?;
      println!("release {}: {}", agent.generation(), state);
    }
    Command::Activate => {
      let report = agent.activate().await?;
      println!("release {} active", agent.generation());
      for store in report.purged {
        println!("  purged {}", store);
      }
    }
    Command::SkipWaiting => {
      let (channel, task) = ControlChannel::spawn(Arc::clone(&agent));
      channel.request(ControlRequest::SkipWaiting).await?;
      drop(channel);
      task.await?;
      println!("release {}: {}", agent.generation(), agent.state()?);
    }
    Command::Status => {
      println!("release {}: {}", agent.generation(), agent.state()?);
      println!("serving {}", agent.serving_generation());
    }
    Command::Fetch {
      path,
      method,
      accept,
      body,
    } => {
      let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;
      let mut request = agent.request(method, &path)?;
      if let Some(accept) = accept {
        request = request.with_header("accept", accept);
      }
      if let Some(body) = body {
        request = request
          .with_header("content-type", "application/json")
          .with_body(body);
      }

      let mut result = agent.handle_detailed(&request).await;
      result.settle().await;

      println!("{} ({:?})", result.response.status, result.source);
      for (name, value) in &result.response.headers {
        println!("{}: {}", name, value);
      }
      println!();
      println!("{}", result.response.text());
    }
    Command::Sync => {
      let report = agent.connectivity_restored().await?;
      println!("replayed {}, remaining {}", report.replayed, report.remaining);
      if let Some(id) = report.dead_lettered {
        println!("dead-lettered #{}", id);
      } else if let Some(id) = report.failed {
        println!("stopped at #{}", id);
      }
    }
    Command::Queue => {
      for item in agent.queue().pending()? {
        println!(
          "#{} {} {} attempts={} created={}{}",
          item.id,
          item.payload.method,
          item.payload.url,
          item.attempt_count,
          item.created_at.to_rfc3339(),
          item
            .last_error
            .map(|e| format!(" last_error={}", e))
            .unwrap_or_default()
        );
      }
      for dead in agent.queue().dead_letters()? {
        let target = match dead.record() {
          Some(record) => format!("{} {}", record.method, record.url),
          None => "<undecodable>".to_string(),
        };
        println!(
          "dead #{} {} attempts={} dead_at={}{}",
          dead.id,
          target,
          dead.attempt_count,
          dead.dead_at.to_rfc3339(),
          dead
            .last_error
            .map(|e| format!(" last_error={}", e))
            .unwrap_or_default()
        );
      }
    }
    Command::CacheSize => {
      let (channel, _task) = ControlChannel::spawn(Arc::clone(&agent));
      if let Some(ControlReply::CacheSize { size }) =
        channel.request(ControlRequest::GetCacheSize).await?
      {
        println!("{} bytes", size);
      }
    }
    Command::ClearCache => {
      let (channel, _task) = ControlChannel::spawn(Arc::clone(&agent));
      if let Some(ControlReply::CacheCleared) = channel.request(ControlRequest::ClearCache).await? {
        println!("cache cleared");
      }
    }
    Command::Stores => {
      let storage = agent.storage();
      for store in storage.list_stores()? {
        print_store(&agent, &store)?;
      }
    }
    Command::Push { payload } => {
      let notification = agent.push(payload.as_bytes())?;
      println!(
        "[{}] {}: {} -> {}",
        notification.tag.as_deref().unwrap_or("-"),
        notification.title,
        notification.body,
        notification.target
      );
    }
  }

  Ok(())
}

fn print_store(agent: &Agent, store: &StoreName) -> Result<()> {
  let entries = agent.storage().list_entries(store)?;
  println!("{} ({} entries)", store, entries.len());
  for entry in entries {
    println!(
      "  {} {} bytes sha256={} stored={}",
      entry.key,
      entry.size,
      &entry.digest[..12.min(entry.digest.len())],
      entry.stored_at.to_rfc3339()
    );
  }
  Ok(())
}
