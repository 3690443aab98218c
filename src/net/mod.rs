//! Live network access and the request/response model shared by the proxy.

mod client;
mod types;

pub use client::{HttpNetwork, Network, NetworkError};
pub use types::{is_hop_by_hop, last_segment, Request, Response};

#[cfg(test)]
pub mod testing {
  //! Scripted network double that records every fetch.

  use super::*;
  use async_trait::async_trait;
  use std::collections::HashMap;
  use std::sync::Mutex;

  #[derive(Debug, Clone)]
  enum Script {
    Respond(Response),
    Fail,
  }

  /// Network that answers from a script and counts calls per URL.
  ///
  /// Unscripted URLs fail with a connection error.
  #[derive(Default)]
  pub struct ScriptedNetwork {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<String>>,
  }

  impl ScriptedNetwork {
    pub fn new() -> Self {
      Self::default()
    }

    pub fn respond(self, url: &str, status: u16, body: &str) -> Self {
      let resp = Response::new(url, status, body.to_string());
      self.respond_with(url, resp)
    }

    pub fn respond_with(self, url: &str, resp: Response) -> Self {
      self
        .scripts
        .lock()
        .unwrap()
        .insert(url.to_string(), Script::Respond(resp));
      self
    }

    pub fn fail(self, url: &str) -> Self {
      self
        .scripts
        .lock()
        .unwrap()
        .insert(url.to_string(), Script::Fail);
      self
    }

    /// Total number of fetches issued.
    pub fn call_count(&self) -> usize {
      self.calls.lock().unwrap().len()
    }

    /// Number of fetches issued for `url`.
    pub fn calls_to(&self, url: &str) -> usize {
      self
        .calls
        .lock()
        .unwrap()
        .iter()
        .filter(|u| u.as_str() == url)
        .count()
    }
  }

  #[async_trait]
  impl Network for ScriptedNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
      let url = request.url.to_string();
      self.calls.lock().unwrap().push(url.clone());

      let script = self.scripts.lock().unwrap().get(&url).cloned();
      match script {
        Some(Script::Respond(resp)) => Ok(resp),
        Some(Script::Fail) | None => Err(NetworkError::Connect {
          url,
          reason: "connection refused".to_string(),
        }),
      }
    }
  }
}
