use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::types::{is_hop_by_hop, Request, Response};
use crate::config::NetworkConfig;

/// A live fetch that could not complete.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
  #[error("connection to {url} failed: {reason}")]
  Connect { url: String, reason: String },

  #[error("request to {url} timed out")]
  Timeout { url: String },

  #[error("request to {url} failed: {reason}")]
  Other { url: String, reason: String },
}

/// Anything that can perform a live fetch.
///
/// A completed exchange is always `Ok`, whatever its status code; only failures
/// to complete the exchange are errors.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError>;
}

/// Network access backed by reqwest.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new(config: &NetworkConfig) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .user_agent(config.user_agent.clone())
      .redirect(reqwest::redirect::Policy::limited(10))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }

  fn classify(url: &str, err: reqwest::Error) -> NetworkError {
    if err.is_timeout() {
      NetworkError::Timeout {
        url: url.to_string(),
      }
    } else if err.is_connect() {
      NetworkError::Connect {
        url: url.to_string(),
        reason: err.to_string(),
      }
    } else {
      NetworkError::Other {
        url: url.to_string(),
        reason: err.to_string(),
      }
    }
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
    let url = request.url.as_str();
    debug!(method = %request.method, url, "network fetch");

    let mut builder = self.client.request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      if !is_hop_by_hop(name) {
        builder = builder.header(name.as_str(), value.as_str());
      }
    }
    if !request.body.is_empty() {
      builder = builder.body(request.body.clone());
    }

    let resp = builder.send().await.map_err(|e| Self::classify(url, e))?;

    let final_url = resp.url().to_string();
    let status = resp.status().as_u16();
    let headers = resp
      .headers()
      .iter()
      .filter_map(|(k, v)| {
        v.to_str()
          .ok()
          .map(|v| (k.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = resp.bytes().await.map_err(|e| Self::classify(url, e))?;

    Ok(Response {
      url: final_url,
      status,
      headers,
      body,
    })
  }
}
