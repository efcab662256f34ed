mod analytics;
mod cache;
mod clients;
mod config;
mod db;
mod http;
mod network;
mod push;
mod router;
mod server;
mod sync_queue;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::analytics::{Analytics, LocalStorage};
use crate::cache::SqliteStorage;
use crate::clients::Clients;
use crate::config::Config;
use crate::db::Database;
use crate::network::HttpNetwork;
use crate::server::{AppState, AppWorker};
use crate::sync_queue::SyncQueue;
use crate::worker::{Worker, DATA_SYNC_TAG, PHOTOS_SYNC_TAG};

#[derive(Parser, Debug)]
#[command(name = "wedding-sw")]
#[command(about = "Offline caching worker for the wedding site")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/wedding-sw/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also write daily-rotated logs to this directory
  #[arg(long, env = "WEDDING_SW_LOG_DIR")]
  log_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install the worker and serve the site through it (default)
  Serve {
    /// Site origin to proxy
    #[arg(long)]
    origin: Option<String>,

    /// Address to listen on
    #[arg(long)]
    listen: Option<String>,
  },
  /// Run one background sync event
  Sync {
    #[arg(long, default_value = DATA_SYNC_TAG)]
    tag: String,
  },
  /// Delete every cache
  ClearCache,
  /// Print caches and queue length
  Status,
  /// Send buffered analytics events
  FlushAnalytics,
}

struct Services {
  config: Config,
  db: Database,
  network: Arc<HttpNetwork>,
  worker: AppWorker,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_tracing(args.log_dir.as_deref())?;

  let mut config = Config::load(args.config.as_deref())?;

  match args.command.unwrap_or(Command::Serve {
    origin: None,
    listen: None,
  }) {
    Command::Serve { origin, listen } => {
      // Command line overrides config file
      if let Some(origin) = origin {
        config.origin = origin;
        config.origin_url()?;
      }
      if let Some(listen) = listen {
        config.listen = listen;
      }
      serve(build(config)?).await
    }
    Command::Sync { tag } => {
      let services = build(config)?;
      let report = services.worker.on_sync(&tag).await?;
      println!(
        "{}: {} succeeded, {} failed",
        report.tag, report.succeeded, report.failed
      );
      Ok(())
    }
    Command::ClearCache => {
      let services = build(config)?;
      for name in services.worker.clear_caches()? {
        println!("deleted {}", name);
      }
      Ok(())
    }
    Command::Status => {
      let services = build(config)?;
      let status = services.worker.status()?;
      println!("version {}", status.version);
      for cache in &status.caches {
        println!("{:<24} {:>6} entries {:>12} bytes", cache.name, cache.entries, cache.bytes);
      }
      println!("{} queued writes, {} open pages", status.queued, status.clients.len());
      Ok(())
    }
    Command::FlushAnalytics => {
      let services = build(config)?;
      let analytics = analytics(&services)?;
      let outcome = analytics.flush_events().await?;
      println!("{}", serde_json::to_string(&outcome)?);
      Ok(())
    }
  }
}

fn init_tracing(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "wedding_sw=info".into());
  let stderr = fmt::layer().with_writer(std::io::stderr);

  match log_dir {
    Some(dir) => {
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

      let appender = tracing_appender::rolling::daily(dir, "wedding-sw.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);

      tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .init();

      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .init();

      Ok(None)
    }
  }
}

fn build(config: Config) -> Result<Services> {
  let db = Database::open(&config.database_path()?)?;
  let network = Arc::new(HttpNetwork::new(config.request_timeout())?);

  let worker = Worker::new(
    config.clone(),
    SqliteStorage::new(db.clone()),
    Arc::clone(&network),
    SyncQueue::new(db.clone()),
    Clients::new(100),
  )?;

  Ok(Services {
    config,
    db,
    network,
    worker,
  })
}

fn analytics(services: &Services) -> Result<Arc<Analytics<HttpNetwork>>> {
  Ok(Arc::new(Analytics::new(
    LocalStorage::new(services.db.clone()),
    Arc::clone(&services.network),
    services.config.resolve(&services.config.analytics.endpoint)?,
  )))
}

async fn serve(services: Services) -> Result<()> {
  let worker = services.worker.clone();

  // Without a successful install the worker stays out of the way and
  // requests pass straight through
  if let Err(e) = worker.start().await {
    error!(error = %e, "Worker failed to start, serving without caching");
  }

  let interval_secs = services.config.sync.photo_sync_interval_secs;
  if interval_secs > 0 {
    let worker = worker.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
      loop {
        ticker.tick().await;
        if let Err(e) = worker.on_sync(PHOTOS_SYNC_TAG).await {
          warn!(error = %e, "Periodic photo sync failed");
        }
      }
    });
  }

  let analytics = analytics(&services)?;

  let interval_secs = services.config.analytics.flush_interval_secs;
  if interval_secs > 0 {
    let analytics = Arc::clone(&analytics);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
      loop {
        ticker.tick().await;
        analytics.flush_in_background();
      }
    });
  }

  let state = AppState {
    analytics,
    origin: services.config.origin_url()?,
    worker,
  };
  let app = server::create_router(state);

  let listener = tokio::net::TcpListener::bind(services.config.listen.as_str())
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", services.config.listen, e))?;
  info!(
    listen = %services.config.listen,
    origin = %services.config.origin,
    "Serving"
  );

  axum::serve(listener, app)
    .await
    .map_err(|e| eyre!("Server error: {}", e))?;

  Ok(())
}
