//! The intercepting proxy: every request goes through the fetch mediator,
//! control routes under `/__sw/` drive lifecycle and notifications.

use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use http::header::{HeaderName, HeaderValue};
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, warn};
use url::Url;

use super::{empty, json, serve, text, HttpResponse};
use crate::cache::CacheStorage;
use crate::lifecycle::{LifecycleManager, LifecycleState};
use crate::mediator::{FetchMediator, Mediated};
use crate::net::{is_hop_by_hop, Network, Request};
use crate::notify::{NotificationGateway, NotificationTray};

/// Header naming the terminal state of a mediated request.
pub const OUTCOME_HEADER: &str = "x-neydra-outcome";

const CONTROL_PREFIX: &str = "/__sw/";

/// Everything the proxy needs to answer a request.
pub struct ProxyState<N: Network, S: CacheStorage> {
  pub origin: Url,
  pub mediator: FetchMediator<N, S>,
  pub lifecycle: LifecycleManager<N, S>,
  pub gateway: NotificationGateway,
  pub tray: Arc<NotificationTray>,
}

#[derive(Serialize)]
struct Status {
  state: LifecycleState,
  cache: String,
  caches: Vec<String>,
  notifications: usize,
}

/// Serve the proxy on `listener` until ctrl-c.
pub async fn run<N, S>(listener: TcpListener, state: Arc<ProxyState<N, S>>) -> Result<()>
where
  N: Network + 'static,
  S: CacheStorage + 'static,
{
  serve(listener, state, handle_request::<N, S>)
    .await
    .map_err(|e| eyre!("Proxy server failed: {}", e))
}

/// Route one incoming request.
pub async fn handle_request<N, S>(
  state: Arc<ProxyState<N, S>>,
  req: hyper::Request<Incoming>,
) -> Result<HttpResponse, Infallible>
where
  N: Network + 'static,
  S: CacheStorage + 'static,
{
  let path = req.uri().path().to_string();

  let resp = match path.strip_prefix(CONTROL_PREFIX) {
    Some(route) => {
      let route = route.to_string();
      control(state, req, &route).await
    }
    None => mediate(&state, req).await,
  };

  Ok(resp)
}

async fn mediate<N: Network, S: CacheStorage>(
  state: &ProxyState<N, S>,
  req: hyper::Request<Incoming>,
) -> HttpResponse {
  let (parts, body) = req.into_parts();

  let body = match body.collect().await {
    Ok(collected) => collected.to_bytes(),
    Err(e) => return text(StatusCode::BAD_REQUEST, format!("Failed to read request body: {}", e)),
  };

  // Only the path and query of the client's URI are used, the origin is fixed
  let mut url = state.origin.clone();
  url.set_path(parts.uri.path());
  url.set_query(parts.uri.query());

  let headers = parts
    .headers
    .iter()
    .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
    .filter_map(|(name, value)| {
      value
        .to_str()
        .ok()
        .map(|v| (name.as_str().to_string(), v.to_string()))
    })
    .collect();

  let request = Request {
    method: parts.method,
    url,
    headers,
    body,
  };

  match state.mediator.handle(&request).await {
    Ok(mediated) => into_http(mediated),
    Err(err) => text(StatusCode::BAD_GATEWAY, err.to_string()),
  }
}

fn into_http(mediated: Mediated) -> HttpResponse {
  let Mediated { response, outcome } = mediated;

  let status = match StatusCode::from_u16(response.status) {
    Ok(status) => status,
    Err(_) => {
      warn!(status = response.status, url = %response.url, "invalid upstream status");
      return text(StatusCode::BAD_GATEWAY, "Invalid upstream status");
    }
  };

  let mut resp = hyper::Response::new(Full::new(response.body));
  *resp.status_mut() = status;

  let headers = resp.headers_mut();
  for (name, value) in &response.headers {
    if is_hop_by_hop(name) {
      continue;
    }
    match (
      HeaderName::from_bytes(name.as_bytes()),
      HeaderValue::from_str(value),
    ) {
      (Ok(name), Ok(value)) => {
        headers.append(name, value);
      }
      _ => debug!(header = %name, "dropping invalid header"),
    }
  }
  headers.insert(
    HeaderName::from_static(OUTCOME_HEADER),
    HeaderValue::from_static(outcome.as_str()),
  );

  resp
}

async fn control<N, S>(
  state: Arc<ProxyState<N, S>>,
  req: hyper::Request<Incoming>,
  route: &str,
) -> HttpResponse
where
  N: Network + 'static,
  S: CacheStorage + 'static,
{
  let method = req.method().clone();
  let segments: Vec<&str> = route.split('/').filter(|s| !s.is_empty()).collect();

  match (method, segments.as_slice()) {
    (Method::GET, ["status"]) => {
      let caches = match state.mediator.caches().names().await {
        Ok(names) => names,
        Err(e) => return text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
      };
      json(
        StatusCode::OK,
        &Status {
          state: state.lifecycle.state().await,
          cache: state.lifecycle.current_cache().to_string(),
          caches,
          notifications: state.tray.list().await.len(),
        },
      )
    }

    (Method::POST, ["install"]) => match state.lifecycle.install().await {
      Ok(report) => json(StatusCode::OK, &report),
      Err(e) => text(StatusCode::BAD_GATEWAY, e.to_string()),
    },

    (Method::POST, ["activate"]) => match state.lifecycle.activate().await {
      Ok(evicted) => json(StatusCode::OK, &serde_json::json!({ "evicted": evicted })),
      Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    },

    (Method::POST, ["push"]) => {
      let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
          return text(StatusCode::BAD_REQUEST, format!("Failed to read push body: {}", e))
        }
      };
      let payload = payload_text(&body);

      // Fire and forget, the outcome is logged by the gateway
      let state = Arc::clone(&state);
      tokio::spawn(async move {
        state.gateway.on_push(payload.as_deref()).await;
      });

      empty(StatusCode::ACCEPTED)
    }

    (Method::GET, ["notifications"]) => json(StatusCode::OK, &state.tray.list().await),

    (Method::POST, ["notifications", id, "click"]) => {
      let Ok(id) = id.parse::<u64>() else {
        return text(StatusCode::BAD_REQUEST, format!("Invalid notification id: {}", id));
      };
      match state.gateway.on_click(id).await {
        Ok(client) => json(StatusCode::OK, &client),
        Err(e) => text(StatusCode::NOT_FOUND, e.to_string()),
      }
    }

    _ => text(StatusCode::NOT_FOUND, format!("Unknown control route: {}", route)),
  }
}

/// Push body as text; empty or non-UTF-8 bodies carry no payload.
fn payload_text(body: &Bytes) -> Option<String> {
  std::str::from_utf8(body)
    .ok()
    .filter(|s| !s.is_empty())
    .map(String::from)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheLayer, MemoryStorage};
  use crate::classifier::Classifier;
  use crate::config::NotificationConfig;
  use crate::net::testing::ScriptedNetwork;
  use crate::notify::Clients;
  use std::net::SocketAddr;

  const ORIGIN: &str = "http://origin.test/";

  type TestState = Arc<ProxyState<ScriptedNetwork, MemoryStorage>>;

  async fn start(network: ScriptedNetwork) -> (SocketAddr, TestState) {
    start_with(network, false).await
  }

  async fn start_with(network: ScriptedNetwork, write_back: bool) -> (SocketAddr, TestState) {
    let origin = Url::parse(ORIGIN).unwrap();
    let network = Arc::new(network);
    let caches = CacheLayer::new(MemoryStorage::new());
    let tray = Arc::new(NotificationTray::new(true, 50));

    let state = Arc::new(ProxyState {
      mediator: FetchMediator::new(
        Arc::clone(&network),
        caches.clone(),
        Classifier::new(["PAE.html"]),
        origin.join("/home.html").unwrap(),
        "neydra-cache-v1",
      )
      .with_write_back(write_back),
      lifecycle: LifecycleManager::new(
        Arc::clone(&network),
        caches,
        "neydra-cache-v1",
        vec![origin.join("/home.html").unwrap()],
      ),
      gateway: NotificationGateway::new(
        tray.clone(),
        Arc::new(Clients::new()),
        NotificationConfig::default(),
        origin.join("/home.html").unwrap(),
      ),
      tray,
      origin,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(run(listener, Arc::clone(&state)));

    (addr, state)
  }

  #[tokio::test]
  async fn test_denied_page_becomes_home() {
    let network = ScriptedNetwork::new()
      .respond("http://origin.test/PAE.html", 403, "no")
      .respond("http://origin.test/home.html", 200, "home");
    let (addr, _state) = start(network).await;

    let resp = reqwest::get(format!("http://{}/PAE.html", addr)).await.unwrap();

    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.headers()[OUTCOME_HEADER], "denied");
    assert_eq!(resp.text().await.unwrap(), "home");
  }

  #[tokio::test]
  async fn test_session_lookup_is_not_replayed_to_other_clients() {
    let network = ScriptedNetwork::new()
      .respond("http://origin.test/session", 200, "ultra")
      .respond("http://origin.test/index.html", 200, "index");
    let (addr, _state) = start_with(network, true).await;
    let client = reqwest::Client::new();

    let owner = client
      .get(format!("http://{}/session", addr))
      .header("x-neydra-session", "s-1")
      .send()
      .await
      .unwrap();
    assert_eq!(owner.headers()[OUTCOME_HEADER], "cache-miss");

    let stranger = client
      .get(format!("http://{}/session", addr))
      .send()
      .await
      .unwrap();
    assert_eq!(stranger.headers()[OUTCOME_HEADER], "cache-miss");

    // Anonymous public pages are still written back
    client.get(format!("http://{}/index.html", addr)).send().await.unwrap();
    let again = client
      .get(format!("http://{}/index.html", addr))
      .send()
      .await
      .unwrap();
    assert_eq!(again.headers()[OUTCOME_HEADER], "cache-hit");
  }

  #[tokio::test]
  async fn test_public_miss_offline_is_bad_gateway() {
    let (addr, _state) = start(ScriptedNetwork::new()).await;

    let resp = reqwest::get(format!("http://{}/about.html", addr)).await.unwrap();

    assert_eq!(resp.status().as_u16(), 502);
  }

  #[tokio::test]
  async fn test_install_then_serve_from_cache() {
    let network = ScriptedNetwork::new().respond("http://origin.test/home.html", 200, "home");
    let (addr, state) = start(network).await;
    let client = reqwest::Client::new();

    let install = client
      .post(format!("http://{}/__sw/install", addr))
      .send()
      .await
      .unwrap();
    assert_eq!(install.status().as_u16(), 200);
    assert_eq!(state.lifecycle.state().await, LifecycleState::Installed);

    let resp = client
      .get(format!("http://{}/home.html", addr))
      .send()
      .await
      .unwrap();
    assert_eq!(resp.headers()[OUTCOME_HEADER], "cache-hit");
  }

  #[tokio::test]
  async fn test_push_and_click_routes() {
    let (addr, state) = start(ScriptedNetwork::new()).await;
    let client = reqwest::Client::new();

    let push = client
      .post(format!("http://{}/__sw/push", addr))
      .send()
      .await
      .unwrap();
    assert_eq!(push.status().as_u16(), 202);

    // Push handling runs detached
    let mut shown = Vec::new();
    for _ in 0..50 {
      shown = state.tray.list().await;
      if !shown.is_empty() {
        break;
      }
      tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].body, "NEYDRA Update");

    let click = client
      .post(format!(
        "http://{}/__sw/notifications/{}/click",
        addr, shown[0].id
      ))
      .send()
      .await
      .unwrap();
    assert_eq!(click.status().as_u16(), 200);
    let opened: serde_json::Value = serde_json::from_str(&click.text().await.unwrap()).unwrap();
    assert_eq!(opened["url"], "http://origin.test/home.html");
  }

  #[tokio::test]
  async fn test_unknown_control_route() {
    let (addr, _state) = start(ScriptedNetwork::new()).await;

    let resp = reqwest::get(format!("http://{}/__sw/nope", addr)).await.unwrap();

    assert_eq!(resp.status().as_u16(), 404);
  }

  #[test]
  fn test_payload_text() {
    assert_eq!(payload_text(&Bytes::from_static(b"hi")), Some("hi".to_string()));
    assert_eq!(payload_text(&Bytes::new()), None);
    assert_eq!(payload_text(&Bytes::from_static(&[0xff, 0xfe])), None);
  }
}
