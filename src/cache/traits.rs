//! Core traits and types for the cache store.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::net::Response;

/// A named generation of the cache store (e.g. `"v1"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheVersion(String);

impl CacheVersion {
  pub fn new(version: impl Into<String>) -> Self {
    Self(version.into())
  }

  /// Store name for this version under `prefix` (`neydra-cache` + `v1` = `neydra-cache-v1`).
  pub fn cache_name(&self, prefix: &str) -> String {
    format!("{}-{}", prefix, self.0)
  }
}

impl fmt::Display for CacheVersion {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Immutable snapshot of a response, keyed by the URL of the request that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
  /// Request URL this snapshot answers
  pub url: String,
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
  /// When the snapshot was taken
  pub cached_at: DateTime<Utc>,
}

impl CachedResponse {
  /// Snapshot `response` as the answer to a request for `request_url`.
  pub fn snapshot(request_url: &str, response: &Response) -> Self {
    Self {
      url: request_url.to_string(),
      status: response.status,
      headers: response.headers.clone(),
      body: response.body.clone(),
      cached_at: Utc::now(),
    }
  }

  /// Rebuild a response from this snapshot.
  pub fn to_response(&self) -> Response {
    Response {
      url: self.url.clone(),
      status: self.status,
      headers: self.headers.clone(),
      body: self.body.clone(),
    }
  }

  /// Stable, fixed-length storage key for this snapshot.
  pub fn key(&self) -> String {
    request_hash(&self.url)
  }
}

/// SHA256 of the request URL, hex encoded.
pub fn request_hash(url: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(url.as_bytes());
  hex::encode(hasher.finalize())
}

/// Trait for cache storage backends.
///
/// A backend holds any number of named caches. Caches are kept in creation
/// order; `match_any` searches them oldest first.
#[async_trait]
pub trait CacheStorage: Send + Sync {
  /// Create the named cache if it does not exist yet.
  async fn open(&self, cache: &str) -> Result<()>;

  /// Whether the named cache exists.
  async fn has(&self, cache: &str) -> Result<bool>;

  /// Names of all caches, in creation order.
  async fn names(&self) -> Result<Vec<String>>;

  /// Delete a cache and every entry in it. Returns whether it existed.
  async fn delete(&self, cache: &str) -> Result<bool>;

  /// Delete every cache except `keep` in one step. Returns the deleted names.
  async fn delete_except(&self, keep: &str) -> Result<Vec<String>>;

  /// Store one snapshot, replacing any entry for the same URL.
  async fn put(&self, cache: &str, entry: &CachedResponse) -> Result<()>;

  /// Store a batch of snapshots atomically: either all are written or none.
  async fn put_all(&self, cache: &str, entries: &[CachedResponse]) -> Result<()>;

  /// Look up a snapshot for `url` in one cache.
  async fn get(&self, cache: &str, url: &str) -> Result<Option<CachedResponse>>;

  /// Look up a snapshot for `url` across all caches.
  async fn match_any(&self, url: &str) -> Result<Option<CachedResponse>>;

  /// URLs stored in one cache.
  async fn keys(&self, cache: &str) -> Result<Vec<String>>;
}
