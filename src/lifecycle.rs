//! Install and activation of cache versions.

use color_eyre::Report;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};
use url::Url;

use crate::cache::{AddAllError, CacheLayer, CacheStorage};
use crate::net::{Network, Request};

/// Why install did not complete. Nothing from the manifest is stored in either case.
#[derive(Error, Debug)]
pub enum InstallError {
  #[error("manifest entry {url} could not be cached: {reason}")]
  ManifestFetch { url: String, reason: String },

  #[error("cache storage failure during install: {0}")]
  Storage(Report),
}

impl From<AddAllError> for InstallError {
  fn from(err: AddAllError) -> Self {
    match err {
      AddAllError::Fetch { url, source } => InstallError::ManifestFetch {
        url,
        reason: source.to_string(),
      },
      AddAllError::BadStatus { url, status } => InstallError::ManifestFetch {
        url,
        reason: format!("status {}", status),
      },
      AddAllError::Storage(report) => InstallError::Storage(report),
    }
  }
}

/// Lifecycle state of the current cache version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
  /// Nothing attempted yet
  #[default]
  Parsed,
  Installing,
  /// Manifest stored, waiting for activation
  Installed,
  Activating,
  /// Current version is the only one left
  Activated,
  /// Install failed
  Redundant,
}

/// Result of a successful install.
#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
  pub cache: String,
  pub stored: usize,
}

/// Pre-populates the current cache version and retires old ones.
pub struct LifecycleManager<N: Network, S: CacheStorage> {
  network: Arc<N>,
  caches: CacheLayer<S>,
  /// Name of the current cache version
  current: String,
  manifest: Vec<Url>,
  state: RwLock<LifecycleState>,
}

impl<N: Network, S: CacheStorage> LifecycleManager<N, S> {
  pub fn new(
    network: Arc<N>,
    caches: CacheLayer<S>,
    current: impl Into<String>,
    manifest: Vec<Url>,
  ) -> Self {
    Self {
      network,
      caches,
      current: current.into(),
      manifest,
      state: RwLock::new(LifecycleState::Parsed),
    }
  }

  pub fn current_cache(&self) -> &str {
    &self.current
  }

  pub async fn state(&self) -> LifecycleState {
    *self.state.read().await
  }

  async fn set_state(&self, state: LifecycleState) {
    *self.state.write().await = state;
  }

  /// Fetch every manifest entry and store them together in the current cache.
  ///
  /// A single unreachable or non-2xx entry fails the whole install.
  pub async fn install(&self) -> Result<InstallReport, InstallError> {
    self.set_state(LifecycleState::Installing).await;
    info!(cache = %self.current, entries = self.manifest.len(), "installing");

    let result = self.populate().await;

    match &result {
      Ok(report) => {
        self.set_state(LifecycleState::Installed).await;
        info!(cache = %report.cache, stored = report.stored, "installed");
      }
      Err(err) => {
        self.set_state(LifecycleState::Redundant).await;
        warn!(cache = %self.current, error = %err, "install failed");
      }
    }

    result
  }

  async fn populate(&self) -> Result<InstallReport, InstallError> {
    let cache = self
      .caches
      .open(&self.current)
      .await
      .map_err(InstallError::Storage)?;

    let requests: Vec<Request> = self.manifest.iter().cloned().map(Request::get).collect();
    let stored = cache.add_all(self.network.as_ref(), &requests).await?;

    Ok(InstallReport {
      cache: cache.name().to_string(),
      stored,
    })
  }

  /// Delete every cache version other than the current one.
  pub async fn activate(&self) -> color_eyre::Result<Vec<String>> {
    self.set_state(LifecycleState::Activating).await;

    let evicted = match self.caches.delete_except(&self.current).await {
      Ok(evicted) => evicted,
      Err(err) => {
        warn!(cache = %self.current, error = %err, "activation sweep failed");
        return Err(err);
      }
    };
    for name in &evicted {
      info!(cache = %name, "evicted stale cache");
    }

    self.set_state(LifecycleState::Activated).await;
    info!(cache = %self.current, evicted = evicted.len(), "activated");

    Ok(evicted)
  }
}
