//! HTTP servers: the mediating proxy and the trusted origin.
//!
//! Both use hyper http1 with TokioIo, one task per connection.

pub mod origin;
pub mod proxy;

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::StatusCode;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

pub type Body = Full<Bytes>;
pub type HttpResponse = hyper::Response<Body>;

/// Accept connections until ctrl-c, handing each request to `handler`.
pub async fn serve<S, F, Fut>(
  listener: TcpListener,
  state: Arc<S>,
  handler: F,
) -> std::io::Result<()>
where
  S: Send + Sync + 'static,
  F: Fn(Arc<S>, hyper::Request<Incoming>) -> Fut + Copy + Send + Sync + 'static,
  Fut: Future<Output = Result<HttpResponse, Infallible>> + Send + 'static,
{
  let local = listener.local_addr()?;
  info!(addr = %local, "listening");

  let shutdown = tokio::signal::ctrl_c();
  tokio::pin!(shutdown);

  loop {
    tokio::select! {
      accepted = listener.accept() => match accepted {
        Ok((stream, addr)) => {
          let state = Arc::clone(&state);
          tokio::spawn(async move {
            let io = hyper_util::rt::TokioIo::new(stream);

            let service = service_fn(move |req| handler(Arc::clone(&state), req));

            if let Err(err) = http1::Builder::new()
              .serve_connection(io, service)
              .await
            {
              debug!(peer = %addr, error = %err, "connection closed with error");
            }
          });
        }
        Err(e) => {
          error!("Error accepting connection: {:?}", e);
        }
      },
      _ = &mut shutdown => {
        info!(addr = %local, "shutting down");
        return Ok(());
      }
    }
  }
}

/// A response with a body and content type.
pub fn respond(
  status: StatusCode,
  content_type: &'static str,
  body: impl Into<Bytes>,
) -> HttpResponse {
  let mut resp = hyper::Response::new(Full::new(body.into()));
  *resp.status_mut() = status;
  resp
    .headers_mut()
    .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
  resp
}

pub fn text(status: StatusCode, body: impl Into<String>) -> HttpResponse {
  respond(status, "text/plain; charset=utf-8", body.into())
}

pub fn json<T: Serialize>(status: StatusCode, value: &T) -> HttpResponse {
  match serde_json::to_vec(value) {
    Ok(body) => respond(status, "application/json", body),
    Err(e) => text(
      StatusCode::INTERNAL_SERVER_ERROR,
      format!("Internal serialization error: {}", e),
    ),
  }
}

pub fn empty(status: StatusCode) -> HttpResponse {
  let mut resp = hyper::Response::new(Full::new(Bytes::new()));
  *resp.status_mut() = status;
  resp
}
