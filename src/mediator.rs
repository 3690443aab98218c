//! Per-request strategy selection between cache and network.
//!
//! Every intercepted request is classified and then runs exactly one strategy:
//!
//! - Gated: network first. A 403 is swapped for the fallback resource and never
//!   answered from cache. When the network cannot be reached, a cached copy is
//!   served if one exists, otherwise the fallback.
//! - Public: cache first. A miss goes to the network once and the result is
//!   passed through as-is (optionally written back into the current cache).
//!   Responses to credentialed requests, and responses a shared cache may not
//!   keep, are never written back.

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheStorage};
use crate::classifier::{Classification, Classifier};
use crate::net::{Network, NetworkError, Request, Response};

/// A request that could not be answered at all.
#[derive(Error, Debug)]
pub enum FetchError {
  /// Public resource, not cached, network unreachable
  #[error(transparent)]
  Network(#[from] NetworkError),

  /// The fallback resource itself could not be served
  #[error("fallback {url} unavailable: {source}")]
  Fallback {
    url: String,
    #[source]
    source: NetworkError,
  },
}

/// Terminal state a request ended in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
  /// Gated, network answered with anything but 403
  Authorized,
  /// Gated, network answered 403, fallback served
  Denied,
  /// Gated, network unreachable, cached copy served
  OfflineCached,
  /// Gated, network unreachable and nothing cached, fallback served
  OfflineFallback,
  /// Public, served from cache without touching the network
  CacheHit,
  /// Public, fetched from the network
  CacheMiss,
}

impl Outcome {
  pub fn as_str(&self) -> &'static str {
    match self {
      Outcome::Authorized => "authorized",
      Outcome::Denied => "denied",
      Outcome::OfflineCached => "offline-cached",
      Outcome::OfflineFallback => "offline-fallback",
      Outcome::CacheHit => "cache-hit",
      Outcome::CacheMiss => "cache-miss",
    }
  }

  /// Whether the caller got something other than the resource it asked for.
  pub fn is_fallback(&self) -> bool {
    matches!(self, Outcome::Denied | Outcome::OfflineFallback)
  }
}

/// A response together with how it was obtained.
#[derive(Debug, Clone)]
pub struct Mediated {
  pub response: Response,
  pub outcome: Outcome,
}

impl Mediated {
  fn new(response: Response, outcome: Outcome) -> Self {
    Self { response, outcome }
  }
}

/// Intercepts requests and answers them from cache, network or fallback.
pub struct FetchMediator<N: Network, S: CacheStorage> {
  network: Arc<N>,
  caches: CacheLayer<S>,
  classifier: Classifier,
  fallback: Url,
  /// Cache written to on public misses
  current_cache: String,
  write_back_on_miss: bool,
}

impl<N: Network, S: CacheStorage> FetchMediator<N, S> {
  pub fn new(
    network: Arc<N>,
    caches: CacheLayer<S>,
    classifier: Classifier,
    fallback: Url,
    current_cache: impl Into<String>,
  ) -> Self {
    Self {
      network,
      caches,
      classifier,
      fallback,
      current_cache: current_cache.into(),
      write_back_on_miss: false,
    }
  }

  /// Store successful public responses that missed the cache.
  pub fn with_write_back(mut self, enabled: bool) -> Self {
    self.write_back_on_miss = enabled;
    self
  }

  pub fn caches(&self) -> &CacheLayer<S> {
    &self.caches
  }

  pub fn classify(&self, request: &Request) -> Classification {
    self.classifier.classify(request.url.path())
  }

  /// Answer one intercepted request.
  pub async fn handle(&self, request: &Request) -> Result<Mediated, FetchError> {
    let classification = self.classify(request);
    debug!(
      method = %request.method,
      url = %request.url,
      class = classification.as_str(),
      "intercepted"
    );

    let result = match classification {
      Classification::Gated => self.gated(request).await,
      Classification::Public => self.public(request).await,
    };

    match &result {
      Ok(mediated) => info!(
        url = %request.url,
        outcome = mediated.outcome.as_str(),
        status = mediated.response.status,
        "mediated"
      ),
      Err(err) => warn!(url = %request.url, error = %err, "request failed"),
    }

    result
  }

  async fn gated(&self, request: &Request) -> Result<Mediated, FetchError> {
    match self.network.fetch(request).await {
      Ok(response) if response.is_forbidden() => {
        debug!(url = %request.url, page = request.page(), "denied by origin");
        let fallback = self.fallback().await?;
        Ok(Mediated::new(fallback, Outcome::Denied))
      }
      Ok(response) => Ok(Mediated::new(response, Outcome::Authorized)),
      Err(err) => {
        debug!(url = %request.url, error = %err, "origin unreachable, trying cache");
        if let Some(cached) = self.lookup(request).await {
          return Ok(Mediated::new(cached, Outcome::OfflineCached));
        }
        let fallback = self.fallback().await?;
        Ok(Mediated::new(fallback, Outcome::OfflineFallback))
      }
    }
  }

  async fn public(&self, request: &Request) -> Result<Mediated, FetchError> {
    if let Some(cached) = self.lookup(request).await {
      return Ok(Mediated::new(cached, Outcome::CacheHit));
    }

    let response = self.network.fetch(request).await?;
    if self.write_back_on_miss && response.is_ok() {
      if request.carries_credentials() || !response.is_storable() {
        debug!(url = %request.url, "per-client response not written back");
      } else {
        self.write_back(request, &response).await;
      }
    }

    Ok(Mediated::new(response, Outcome::CacheMiss))
  }

  /// Fetch the fallback, using its cached copy when the network is down.
  async fn fallback(&self) -> Result<Response, FetchError> {
    let request = Request::get(self.fallback.clone());
    match self.network.fetch(&request).await {
      Ok(response) => Ok(response),
      Err(source) => match self.lookup(&request).await {
        Some(cached) => Ok(cached),
        None => Err(FetchError::Fallback {
          url: self.fallback.to_string(),
          source,
        }),
      },
    }
  }

  /// Cache lookup; storage failures count as a miss.
  async fn lookup(&self, request: &Request) -> Option<Response> {
    match self.caches.match_request(request).await {
      Ok(hit) => hit,
      Err(err) => {
        warn!(url = %request.url, error = %err, "cache read failed");
        None
      }
    }
  }

  async fn write_back(&self, request: &Request, response: &Response) {
    let result = async {
      let cache = self.caches.open(&self.current_cache).await?;
      cache.put(request, response).await
    }
    .await;

    match result {
      Ok(()) => debug!(url = %request.url, cache = %self.current_cache, "written back"),
      Err(err) => warn!(url = %request.url, error = %err, "cache write failed"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use crate::net::testing::ScriptedNetwork;

  const ORIGIN: &str = "http://origin.test";
  const CACHE: &str = "neydra-cache-v1";

  fn url(path: &str) -> String {
    format!("{}{}", ORIGIN, path)
  }

  fn get(path: &str) -> Request {
    Request::get(Url::parse(&url(path)).unwrap())
  }

  struct Harness {
    network: Arc<ScriptedNetwork>,
    caches: CacheLayer<MemoryStorage>,
    mediator: FetchMediator<ScriptedNetwork, MemoryStorage>,
  }

  fn harness(network: ScriptedNetwork) -> Harness {
    let network = Arc::new(network);
    let caches = CacheLayer::new(MemoryStorage::new());
    let mediator = FetchMediator::new(
      Arc::clone(&network),
      caches.clone(),
      Classifier::new(["PAE.html"]),
      Url::parse(&url("/home.html")).unwrap(),
      CACHE,
    );
    Harness {
      network,
      caches,
      mediator,
    }
  }

  async fn seed(caches: &CacheLayer<MemoryStorage>, path: &str, body: &str) {
    let cache = caches.open(CACHE).await.unwrap();
    cache
      .put(&get(path), &Response::new(url(path), 200, body.to_string()))
      .await
      .unwrap();
  }

  #[tokio::test]
  async fn test_gated_authorized_passes_through_unchanged() {
    let upstream = Response::new(url("/PAE.html"), 200, "<h1>PAE</h1>")
      .with_header("content-type", "text/html")
      .with_header("x-plan", "standard");
    let h = harness(ScriptedNetwork::new().respond_with(&url("/PAE.html"), upstream.clone()));

    let result = h.mediator.handle(&get("/PAE.html")).await.unwrap();

    assert_eq!(result.outcome, Outcome::Authorized);
    assert_eq!(result.response, upstream);
  }

  #[tokio::test]
  async fn test_gated_other_errors_are_authorized() {
    let h = harness(
      ScriptedNetwork::new()
        .respond(&url("/PAE.html"), 500, "boom")
        .respond(&url("/home.html"), 200, "home"),
    );

    let result = h.mediator.handle(&get("/PAE.html")).await.unwrap();

    assert_eq!(result.outcome, Outcome::Authorized);
    assert_eq!(result.response.status, 500);
    assert_eq!(h.network.calls_to(&url("/home.html")), 0);
  }

  #[tokio::test]
  async fn test_gated_forbidden_serves_fallback() {
    let h = harness(
      ScriptedNetwork::new()
        .respond(&url("/PAE.html"), 403, "upgrade required")
        .respond(&url("/home.html"), 200, "home"),
    );

    let result = h.mediator.handle(&get("/PAE.html")).await.unwrap();

    assert_eq!(result.outcome, Outcome::Denied);
    assert!(result.response.url.ends_with("home.html"));
    assert_eq!(&result.response.body[..], b"home");
  }

  #[tokio::test]
  async fn test_gated_forbidden_never_uses_cache() {
    let h = harness(
      ScriptedNetwork::new()
        .respond(&url("/PAE.html"), 403, "denied")
        .respond(&url("/home.html"), 200, "home"),
    );
    seed(&h.caches, "/PAE.html", "stale premium content").await;

    let result = h.mediator.handle(&get("/PAE.html")).await.unwrap();

    assert_eq!(result.outcome, Outcome::Denied);
    assert_eq!(&result.response.body[..], b"home");
  }

  #[tokio::test]
  async fn test_gated_offline_serves_cached_copy_without_fallback() {
    let h = harness(ScriptedNetwork::new().fail(&url("/PAE.html")));
    seed(&h.caches, "/PAE.html", "cached PAE").await;

    let result = h.mediator.handle(&get("/PAE.html")).await.unwrap();

    assert_eq!(result.outcome, Outcome::OfflineCached);
    assert_eq!(&result.response.body[..], b"cached PAE");
    assert_eq!(h.network.calls_to(&url("/home.html")), 0);
  }

  #[tokio::test]
  async fn test_gated_offline_without_cache_serves_fallback() {
    let h = harness(
      ScriptedNetwork::new()
        .fail(&url("/PAE.html"))
        .respond(&url("/home.html"), 200, "home"),
    );

    let result = h.mediator.handle(&get("/PAE.html")).await.unwrap();

    assert_eq!(result.outcome, Outcome::OfflineFallback);
    assert!(result.outcome.is_fallback());
    assert_eq!(&result.response.body[..], b"home");
  }

  #[tokio::test]
  async fn test_fallback_uses_cached_copy_when_fully_offline() {
    let h = harness(ScriptedNetwork::new());
    seed(&h.caches, "/home.html", "cached home").await;

    let result = h.mediator.handle(&get("/PAE.html")).await.unwrap();

    assert_eq!(result.outcome, Outcome::OfflineFallback);
    assert_eq!(&result.response.body[..], b"cached home");
  }

  #[tokio::test]
  async fn test_unavailable_fallback_is_hard_failure() {
    let h = harness(ScriptedNetwork::new().respond(&url("/PAE.html"), 403, "denied"));

    let err = h.mediator.handle(&get("/PAE.html")).await.unwrap_err();

    assert!(matches!(err, FetchError::Fallback { ref url, .. } if url.ends_with("/home.html")));
  }

  #[tokio::test]
  async fn test_public_cache_hit_skips_network() {
    let h = harness(ScriptedNetwork::new().respond(&url("/index.html"), 200, "fresh"));
    seed(&h.caches, "/index.html", "cached index").await;

    let result = h.mediator.handle(&get("/index.html")).await.unwrap();

    assert_eq!(result.outcome, Outcome::CacheHit);
    assert_eq!(&result.response.body[..], b"cached index");
    assert_eq!(h.network.call_count(), 0);
  }

  #[tokio::test]
  async fn test_public_miss_fetches_once_verbatim() {
    let upstream = Response::new(url("/about.html"), 404, "not here").with_header("x-a", "1");
    let h = harness(ScriptedNetwork::new().respond_with(&url("/about.html"), upstream.clone()));

    let result = h.mediator.handle(&get("/about.html")).await.unwrap();

    assert_eq!(result.outcome, Outcome::CacheMiss);
    assert_eq!(result.response, upstream);
    assert_eq!(h.network.call_count(), 1);
  }

  #[tokio::test]
  async fn test_public_miss_offline_propagates() {
    let h = harness(ScriptedNetwork::new());

    let err = h.mediator.handle(&get("/about.html")).await.unwrap_err();

    assert!(matches!(err, FetchError::Network(_)));
  }

  #[tokio::test]
  async fn test_public_miss_not_written_back_by_default() {
    let h = harness(ScriptedNetwork::new().respond(&url("/about.html"), 200, "about"));

    h.mediator.handle(&get("/about.html")).await.unwrap();
    h.mediator.handle(&get("/about.html")).await.unwrap();

    assert_eq!(h.network.calls_to(&url("/about.html")), 2);
  }

  #[tokio::test]
  async fn test_write_back_turns_second_request_into_hit() {
    let h = harness(ScriptedNetwork::new().respond(&url("/about.html"), 200, "about"));
    let mediator = h.mediator.with_write_back(true);

    let first = mediator.handle(&get("/about.html")).await.unwrap();
    let second = mediator.handle(&get("/about.html")).await.unwrap();

    assert_eq!(first.outcome, Outcome::CacheMiss);
    assert_eq!(second.outcome, Outcome::CacheHit);
    assert_eq!(h.network.call_count(), 1);
  }

  #[tokio::test]
  async fn test_write_back_skips_error_responses() {
    let h = harness(ScriptedNetwork::new().respond(&url("/gone.html"), 404, ""));
    let mediator = h.mediator.with_write_back(true);

    mediator.handle(&get("/gone.html")).await.unwrap();
    let second = mediator.handle(&get("/gone.html")).await.unwrap();

    assert_eq!(second.outcome, Outcome::CacheMiss);
  }

  #[tokio::test]
  async fn test_write_back_skips_credentialed_requests() {
    let h = harness(ScriptedNetwork::new().respond(&url("/session"), 200, "ultra"));
    let mediator = h.mediator.with_write_back(true);

    let owner = get("/session").with_header("x-neydra-session", "s-1");
    mediator.handle(&owner).await.unwrap();
    let stranger = mediator.handle(&get("/session")).await.unwrap();

    assert_eq!(stranger.outcome, Outcome::CacheMiss);
    assert_eq!(h.network.calls_to(&url("/session")), 2);
    assert!(h.caches.open(CACHE).await.unwrap().keys().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_write_back_honours_no_store() {
    let upstream = Response::new(url("/quote.json"), 200, "42")
      .with_header("Cache-Control", "no-store");
    let h = harness(ScriptedNetwork::new().respond_with(&url("/quote.json"), upstream));
    let mediator = h.mediator.with_write_back(true);

    mediator.handle(&get("/quote.json")).await.unwrap();
    let second = mediator.handle(&get("/quote.json")).await.unwrap();

    assert_eq!(second.outcome, Outcome::CacheMiss);
    assert_eq!(h.network.calls_to(&url("/quote.json")), 2);
  }

  #[tokio::test]
  async fn test_post_to_public_path_goes_to_network() {
    let h = harness(ScriptedNetwork::new().respond(&url("/index.html"), 201, "created"));
    seed(&h.caches, "/index.html", "cached").await;
    let mut post = get("/index.html");
    post.method = http::Method::POST;

    let result = h.mediator.handle(&post).await.unwrap();

    assert_eq!(result.outcome, Outcome::CacheMiss);
    assert_eq!(result.response.status, 201);
  }

  #[test]
  fn test_outcome_fallback_flag() {
    assert!(Outcome::Denied.is_fallback());
    assert!(!Outcome::OfflineCached.is_fallback());
    assert_eq!(Outcome::OfflineFallback.as_str(), "offline-fallback");
  }
}
