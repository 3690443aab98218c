//! In-process cache store.

use async_trait::async_trait;
use color_eyre::Result;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::traits::{CacheStorage, CachedResponse};

/// A single named cache.
#[derive(Debug, Default)]
struct Cache {
  name: String,
  entries: HashMap<String, CachedResponse>,
}

/// Cache storage held entirely in memory, lost on drop.
#[derive(Debug, Default)]
pub struct MemoryStorage {
  /// Caches in creation order
  caches: RwLock<Vec<Cache>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

fn find_or_create<'a>(caches: &'a mut Vec<Cache>, name: &str) -> &'a mut Cache {
  let pos = match caches.iter().position(|c| c.name == name) {
    Some(pos) => pos,
    None => {
      caches.push(Cache {
        name: name.to_string(),
        entries: HashMap::new(),
      });
      caches.len() - 1
    }
  };
  &mut caches[pos]
}

#[async_trait]
impl CacheStorage for MemoryStorage {
  async fn open(&self, cache: &str) -> Result<()> {
    let mut caches = self.caches.write().await;
    find_or_create(&mut caches, cache);
    Ok(())
  }

  async fn has(&self, cache: &str) -> Result<bool> {
    Ok(self.caches.read().await.iter().any(|c| c.name == cache))
  }

  async fn names(&self) -> Result<Vec<String>> {
    Ok(
      self
        .caches
        .read()
        .await
        .iter()
        .map(|c| c.name.clone())
        .collect(),
    )
  }

  async fn delete(&self, cache: &str) -> Result<bool> {
    let mut caches = self.caches.write().await;
    let before = caches.len();
    caches.retain(|c| c.name != cache);
    Ok(caches.len() != before)
  }

  async fn delete_except(&self, keep: &str) -> Result<Vec<String>> {
    let mut caches = self.caches.write().await;
    let doomed = caches
      .iter()
      .filter(|c| c.name != keep)
      .map(|c| c.name.clone())
      .collect();
    caches.retain(|c| c.name == keep);
    Ok(doomed)
  }

  async fn put(&self, cache: &str, entry: &CachedResponse) -> Result<()> {
    let mut caches = self.caches.write().await;
    find_or_create(&mut caches, cache)
      .entries
      .insert(entry.url.clone(), entry.clone());
    Ok(())
  }

  async fn put_all(&self, cache: &str, entries: &[CachedResponse]) -> Result<()> {
    // A single write guard makes the batch visible all at once
    let mut caches = self.caches.write().await;
    let target = find_or_create(&mut caches, cache);
    for entry in entries {
      target.entries.insert(entry.url.clone(), entry.clone());
    }
    Ok(())
  }

  async fn get(&self, cache: &str, url: &str) -> Result<Option<CachedResponse>> {
    Ok(
      self
        .caches
        .read()
        .await
        .iter()
        .find(|c| c.name == cache)
        .and_then(|c| c.entries.get(url).cloned()),
    )
  }

  async fn match_any(&self, url: &str) -> Result<Option<CachedResponse>> {
    Ok(
      self
        .caches
        .read()
        .await
        .iter()
        .find_map(|c| c.entries.get(url).cloned()),
    )
  }

  async fn keys(&self, cache: &str) -> Result<Vec<String>> {
    let caches = self.caches.read().await;
    let mut urls: Vec<String> = caches
      .iter()
      .find(|c| c.name == cache)
      .map(|c| c.entries.keys().cloned().collect())
      .unwrap_or_default();
    urls.sort();
    Ok(urls)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::Response;

  fn entry(url: &str, body: &str) -> CachedResponse {
    CachedResponse::snapshot(url, &Response::new(url, 200, body.to_string()))
  }

  #[tokio::test]
  async fn test_memory_storage_lifecycle() {
    let storage = MemoryStorage::new();
    storage.open("neydra-cache-v1").await.unwrap();
    storage
      .put("neydra-cache-v2", &entry("http://origin.test/a", "a"))
      .await
      .unwrap();

    assert_eq!(
      storage.names().await.unwrap(),
      vec!["neydra-cache-v1", "neydra-cache-v2"]
    );
    assert!(storage
      .get("neydra-cache-v2", "http://origin.test/a")
      .await
      .unwrap()
      .is_some());

    let evicted = storage.delete_except("neydra-cache-v2").await.unwrap();
    assert_eq!(evicted, vec!["neydra-cache-v1"]);
    assert!(!storage.has("neydra-cache-v1").await.unwrap());
  }

  #[tokio::test]
  async fn test_match_any_searches_in_creation_order() {
    let storage = MemoryStorage::new();
    storage
      .put("old", &entry("http://origin.test/a", "old"))
      .await
      .unwrap();
    storage
      .put("new", &entry("http://origin.test/a", "new"))
      .await
      .unwrap();

    let found = storage
      .match_any("http://origin.test/a")
      .await
      .unwrap()
      .unwrap();
    assert_eq!(&found.body[..], b"old");
  }
}
