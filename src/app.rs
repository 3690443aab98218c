use crate::cache::{CacheLayer, CacheStorage};
use crate::classifier::Classifier;
use crate::config::Config;
use crate::lifecycle::LifecycleManager;
use crate::mediator::FetchMediator;
use crate::net::{HttpNetwork, Request};
use crate::notify::{Clients, NotificationGateway, NotificationTray};
use crate::server::origin::{self, OriginState};
use crate::server::proxy::{self, ProxyState};
use crate::session::{PlanEntitlements, SessionRegistry};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Wires configuration, network and cache storage into the proxy components.
pub struct App<S: CacheStorage> {
  config: Config,
  state: Arc<ProxyState<HttpNetwork, S>>,
}

impl<S: CacheStorage + 'static> App<S> {
  pub fn new(config: Config, storage: S) -> Result<Self> {
    let network = Arc::new(HttpNetwork::new(&config.network)?);
    let caches = CacheLayer::new(storage);
    let current = config.cache.current_name();

    let mediator = FetchMediator::new(
      Arc::clone(&network),
      caches.clone(),
      Classifier::new(config.gated.iter().cloned()),
      config.resolve(&config.fallback)?,
      current.clone(),
    )
    .with_write_back(config.cache.write_back_on_miss);

    let manifest = config
      .manifest
      .iter()
      .map(|path| config.resolve(path))
      .collect::<Result<Vec<_>>>()?;
    let lifecycle = LifecycleManager::new(network, caches, current, manifest);

    let tray = Arc::new(NotificationTray::new(
      config.notifications.enabled,
      config.notifications.max_shown,
    ));
    let gateway = NotificationGateway::new(
      tray.clone(),
      Arc::new(Clients::new()),
      config.notifications.clone(),
      config.resolve(&config.notifications.landing)?,
    );

    let state = Arc::new(ProxyState {
      origin: config.origin.clone(),
      mediator,
      lifecycle,
      gateway,
      tray,
    });

    Ok(Self { config, state })
  }

  /// Install and activate the current version, then run the proxy until ctrl-c.
  ///
  /// A failed install does not stop the proxy; requests are still mediated,
  /// only without the pre-populated cache.
  pub async fn serve(&self) -> Result<()> {
    match self.state.lifecycle.install().await {
      Ok(_) => {
        self.state.lifecycle.activate().await?;
      }
      Err(err) => warn!(error = %err, "serving without a fresh install"),
    }

    let listener = TcpListener::bind(self.config.listen)
      .await
      .map_err(|e| eyre!("Failed to bind {}: {}", self.config.listen, e))?;
    info!(origin = %self.config.origin, "proxy ready");

    proxy::run(listener, Arc::clone(&self.state)).await
  }

  pub async fn install(&self) -> Result<()> {
    let report = self.state.lifecycle.install().await?;
    println!("{}: {} entries stored", report.cache, report.stored);
    Ok(())
  }

  pub async fn activate(&self) -> Result<()> {
    let evicted = self.state.lifecycle.activate().await?;
    if evicted.is_empty() {
      println!("{} active, nothing evicted", self.state.lifecycle.current_cache());
    }
    for name in evicted {
      println!("evicted {}", name);
    }
    Ok(())
  }

  /// Print every cache version with its entry count, marking the current one.
  pub async fn caches(&self) -> Result<()> {
    let caches = self.state.mediator.caches();
    let current = self.state.lifecycle.current_cache();

    for name in caches.names().await? {
      let entries = caches.open(&name).await?.keys().await?.len();
      let marker = if name == current { "*" } else { " " };
      println!("{} {} ({} entries)", marker, name, entries);
    }
    Ok(())
  }

  /// Run one mediated GET and write the outcome and body to stdout.
  pub async fn fetch(&self, path: &str) -> Result<()> {
    let request = Request::get(self.config.resolve(path)?);
    let mediated = self.state.mediator.handle(&request).await?;

    let mut stdout = std::io::stdout().lock();
    writeln!(
      stdout,
      "{} {} {}{}",
      mediated.response.status,
      mediated.outcome.as_str(),
      mediated.response.url,
      if mediated.outcome.is_fallback() { " (fallback)" } else { "" }
    )?;
    stdout.write_all(&mediated.response.body)?;
    writeln!(stdout)?;
    Ok(())
  }

  /// Deliver one push and print what ended up in the tray.
  pub async fn push(&self, payload: Option<&str>) -> Result<()> {
    self.state.gateway.on_push(payload).await;

    for notification in self.state.tray.list().await {
      println!(
        "#{} {}: {}",
        notification.id, notification.title, notification.body
      );
    }
    Ok(())
  }
}

/// Run the trusted origin server until ctrl-c.
pub async fn serve_origin(config: &Config) -> Result<()> {
  let settings = &config.origin_server;
  if !settings.root.is_dir() {
    return Err(eyre!(
      "Origin root is not a directory: {}",
      settings.root.display()
    ));
  }

  let state = Arc::new(OriginState::new(
    settings.root.clone(),
    Classifier::new(config.gated.iter().cloned()),
    Box::new(PlanEntitlements),
    SessionRegistry::new(chrono::Duration::minutes(settings.session_ttl_minutes)),
  ));

  let listener = TcpListener::bind(settings.listen)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", settings.listen, e))?;
  info!(root = %settings.root.display(), "origin ready");

  origin::run(listener, state).await
}
