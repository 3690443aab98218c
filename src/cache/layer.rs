//! Named-cache handles over a storage backend.

use color_eyre::Report;
use futures::future::try_join_all;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use super::traits::{CacheStorage, CachedResponse};
use crate::net::{Network, NetworkError, Request, Response};

/// Why a bulk pre-population did not complete.
#[derive(Error, Debug)]
pub enum AddAllError {
  #[error("fetching {url} failed: {source}")]
  Fetch {
    url: String,
    #[source]
    source: NetworkError,
  },

  #[error("fetching {url} returned status {status}")]
  BadStatus { url: String, status: u16 },

  #[error("cache storage failure: {0}")]
  Storage(Report),
}

/// Shared entry point to the cache store.
///
/// Cloning is cheap; every clone talks to the same backend.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
}

impl<S: CacheStorage> CacheLayer<S> {
  /// Create a new cache layer with the given storage backend.
  pub fn new(storage: S) -> Self {
    Self {
      storage: Arc::new(storage),
    }
  }

  /// Open (creating if needed) the cache called `name`.
  pub async fn open(&self, name: &str) -> color_eyre::Result<NamedCache<S>> {
    self.storage.open(name).await?;
    Ok(NamedCache {
      name: name.to_string(),
      storage: Arc::clone(&self.storage),
    })
  }

  /// Look up a request across every cache. Non-GET requests never match.
  pub async fn match_request(&self, request: &Request) -> color_eyre::Result<Option<Response>> {
    if !request.is_cacheable() {
      return Ok(None);
    }
    let hit = self.storage.match_any(request.cache_key()).await?;
    Ok(hit.map(|entry| entry.to_response()))
  }

  pub async fn names(&self) -> color_eyre::Result<Vec<String>> {
    self.storage.names().await
  }

  /// Delete every cache but `keep`, returning what was removed.
  pub async fn delete_except(&self, keep: &str) -> color_eyre::Result<Vec<String>> {
    self.storage.delete_except(keep).await
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
    }
  }
}

/// Handle to one opened cache.
pub struct NamedCache<S: CacheStorage> {
  name: String,
  storage: Arc<S>,
}

impl<S: CacheStorage> NamedCache<S> {
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Store `response` as the answer to `request`. Non-GET requests are ignored.
  pub async fn put(&self, request: &Request, response: &Response) -> color_eyre::Result<()> {
    if !request.is_cacheable() {
      return Ok(());
    }
    let entry = CachedResponse::snapshot(request.cache_key(), response);
    self.storage.put(&self.name, &entry).await
  }

  pub async fn keys(&self) -> color_eyre::Result<Vec<String>> {
    self.storage.keys(&self.name).await
  }

  /// Fetch every request and store the responses as one batch.
  ///
  /// Fetches run concurrently. Any failed fetch or non-2xx response aborts the
  /// whole batch before anything is written.
  pub async fn add_all<N: Network + ?Sized>(
    &self,
    network: &N,
    requests: &[Request],
  ) -> Result<usize, AddAllError> {
    let fetches = requests.iter().map(|request| async move {
      let url = request.cache_key().to_string();
      let response = network
        .fetch(request)
        .await
        .map_err(|source| AddAllError::Fetch {
          url: url.clone(),
          source,
        })?;
      if !response.is_ok() {
        return Err(AddAllError::BadStatus {
          url,
          status: response.status,
        });
      }
      debug!(url = %url, status = response.status, "fetched for cache");
      Ok(CachedResponse::snapshot(&url, &response))
    });

    let entries = try_join_all(fetches).await?;

    self
      .storage
      .put_all(&self.name, &entries)
      .await
      .map_err(AddAllError::Storage)?;

    Ok(entries.len())
  }
}
