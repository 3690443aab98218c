mod app;
mod cache;
mod classifier;
mod config;
mod lifecycle;
mod logging;
mod mediator;
mod net;
mod notify;
mod server;
mod session;

use cache::{CacheStorage, MemoryStorage, SqliteStorage};
use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "neydra-sw")]
#[command(about = "A service-worker style caching proxy with gated pages and push notifications")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./neydra-sw.yaml, then $XDG_CONFIG_HOME/neydra-sw/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install and activate the current cache version, then run the proxy
  Serve,
  /// Pre-populate the current cache version from the manifest
  Install,
  /// Evict every cache version except the current one
  Activate,
  /// List cache versions
  Caches,
  /// Run one mediated GET and print the result
  Fetch {
    /// Path on the origin, e.g. /PAE.html
    path: String,
  },
  /// Deliver a push event
  Push {
    /// Notification body; the configured default is used when omitted
    payload: Option<String>,
  },
  /// Run the trusted origin server
  Origin,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let _guard = logging::init(&config.logging)?;

  if let Command::Origin = args.command {
    return app::serve_origin(&config).await;
  }

  if config.cache.is_in_memory() {
    let app = app::App::new(config, MemoryStorage::new())?;
    run(&app, args.command).await
  } else {
    let storage = SqliteStorage::open(config.cache.path.as_deref())?;
    let app = app::App::new(config, storage)?;
    run(&app, args.command).await
  }
}

async fn run<S: CacheStorage + 'static>(app: &app::App<S>, command: Command) -> Result<()> {
  match command {
    Command::Serve => app.serve().await,
    Command::Install => app.install().await,
    Command::Activate => app.activate().await,
    Command::Caches => app.caches().await,
    Command::Fetch { path } => app.fetch(&path).await,
    Command::Push { payload } => app.push(payload.as_deref()).await,
    Command::Origin => Ok(()),
  }
}
