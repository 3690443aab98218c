//! Trusted origin: static pages plus the subscription check behind gated pages.
//!
//! The plan comes from a server-held session looked up by the
//! `x-neydra-session` header. A gated page the session's plan does not cover
//! is answered with 403 and no body content.
//!
//! Every answer that depends on the session is marked `no-store` so shared
//! caches in front of the origin never replay it to another client.

use color_eyre::{eyre::eyre, Result};
use http::header::{HeaderValue, CACHE_CONTROL};
use http::{Method, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use serde::Serialize;
use std::convert::Infallible;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};

use super::{empty, json, respond, serve, text, HttpResponse};
use crate::classifier::{Classification, Classifier};
use crate::net::last_segment;
use crate::session::{EntitlementStore, Plan, Session, SessionRegistry};

pub const SESSION_HEADER: &str = "x-neydra-session";

pub struct OriginState {
  root: PathBuf,
  classifier: Classifier,
  entitlements: Box<dyn EntitlementStore>,
  sessions: SessionRegistry,
}

impl OriginState {
  pub fn new(
    root: impl Into<PathBuf>,
    classifier: Classifier,
    entitlements: Box<dyn EntitlementStore>,
    sessions: SessionRegistry,
  ) -> Self {
    Self {
      root: root.into(),
      classifier,
      entitlements,
      sessions,
    }
  }
}

#[derive(Serialize)]
struct SessionView<'a> {
  id: &'a str,
  plan: Plan,
  price: u32,
  expires_at: String,
}

impl<'a> SessionView<'a> {
  fn of(session: &'a Session) -> Self {
    Self {
      id: &session.id,
      plan: session.plan,
      price: session.plan.price(),
      expires_at: session.expires_at.to_rfc3339(),
    }
  }
}

/// Serve the origin on `listener` until ctrl-c.
pub async fn run(listener: TcpListener, state: Arc<OriginState>) -> Result<()> {
  serve(listener, state, handle_request)
    .await
    .map_err(|e| eyre!("Origin server failed: {}", e))
}

/// Route one request to the session API or the static tree.
pub async fn handle_request(
  state: Arc<OriginState>,
  req: hyper::Request<Incoming>,
) -> Result<HttpResponse, Infallible> {
  let session_id = req
    .headers()
    .get(SESSION_HEADER)
    .and_then(|v| v.to_str().ok())
    .map(String::from);

  let method = req.method().clone();
  let path = req.uri().path().to_string();

  let resp = match (method, path.as_str()) {
    (Method::POST, "/session") => {
      let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
          return Ok(text(
            StatusCode::BAD_REQUEST,
            format!("Failed to read body: {}", e),
          ))
        }
      };
      login(&state, &String::from_utf8_lossy(&body)).await
    }
    (Method::GET, "/session") => match current_session(&state, session_id.as_deref()).await {
      Some(session) => json(StatusCode::OK, &SessionView::of(&session)),
      None => text(StatusCode::NOT_FOUND, "No session"),
    },
    (Method::DELETE, "/session") => match session_id {
      Some(id) if state.sessions.end(&id).await => empty(StatusCode::NO_CONTENT),
      _ => text(StatusCode::NOT_FOUND, "No session"),
    },
    (Method::GET, path) | (Method::HEAD, path) => {
      serve_page(&state, path, session_id.as_deref()).await
    }
    _ => text(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed"),
  };

  let per_session = path == "/session"
    || resp.status() == StatusCode::FORBIDDEN
    || state.classifier.classify(&path) == Classification::Gated;
  Ok(if per_session { no_store(resp) } else { resp })
}

fn no_store(mut resp: HttpResponse) -> HttpResponse {
  resp
    .headers_mut()
    .insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
  resp
}

async fn login(state: &OriginState, plan: &str) -> HttpResponse {
  match plan.parse::<Plan>() {
    Ok(plan) => {
      let session = state.sessions.create(plan).await;
      json(StatusCode::CREATED, &SessionView::of(&session))
    }
    Err(e) => text(StatusCode::BAD_REQUEST, e.to_string()),
  }
}

async fn current_session(state: &OriginState, id: Option<&str>) -> Option<Session> {
  match id {
    Some(id) => state.sessions.get(id).await,
    None => None,
  }
}

async fn serve_page(state: &OriginState, path: &str, session_id: Option<&str>) -> HttpResponse {
  let Some(file) = resolve_path(&state.root, path) else {
    return text(StatusCode::NOT_FOUND, "Not found");
  };

  // Would reach the gated file on a case-insensitive filesystem
  if state.classifier.is_case_variant(path) {
    debug!(path, "case variant of a gated page refused");
    return text(StatusCode::NOT_FOUND, "Not found");
  }

  if state.classifier.classify(path) == Classification::Gated {
    let session = current_session(state, session_id).await;
    let page = last_segment(path);
    if !state.entitlements.is_authorized(session.as_ref(), page) {
      info!(
        page,
        plan = session.map(|s| s.plan).unwrap_or_default().name(),
        "gated page refused"
      );
      return empty(StatusCode::FORBIDDEN);
    }
  }

  match tokio::fs::read(&file).await {
    Ok(contents) => respond(StatusCode::OK, content_type(&file), contents),
    Err(e) => {
      debug!(path = %file.display(), error = %e, "static file not served");
      text(StatusCode::NOT_FOUND, "Not found")
    }
  }
}

/// Map a URL path onto the static root. Paths that climb out of it are rejected.
fn resolve_path(root: &Path, path: &str) -> Option<PathBuf> {
  let relative = path.trim_start_matches('/');
  let relative = if relative.is_empty() || relative.ends_with('/') {
    format!("{}index.html", relative)
  } else {
    relative.to_string()
  };

  let relative = Path::new(&relative);
  if relative
    .components()
    .any(|c| !matches!(c, Component::Normal(_)))
  {
    return None;
  }

  Some(root.join(relative))
}

fn content_type(path: &Path) -> &'static str {
  match path.extension().and_then(|e| e.to_str()) {
    Some("html") => "text/html; charset=utf-8",
    Some("css") => "text/css; charset=utf-8",
    Some("js") => "application/javascript",
    Some("json") => "application/json",
    Some("png") => "image/png",
    Some("svg") => "image/svg+xml",
    Some("ico") => "image/x-icon",
    _ => "application/octet-stream",
  }
}
