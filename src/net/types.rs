//! Request and response types passed between the proxy, the mediator and the network.

use bytes::Bytes;
use http::Method;
use url::Url;

/// Headers that describe a single connection and must not be forwarded.
pub const HOP_BY_HOP: &[&str] = &[
  "connection",
  "keep-alive",
  "proxy-authenticate",
  "proxy-authorization",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
  "host",
  "content-length",
];

/// Whether a header name is connection-scoped.
pub fn is_hop_by_hop(name: &str) -> bool {
  HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Request headers that tie a response to one client.
const CREDENTIAL_HEADERS: &[&str] = &["authorization", "cookie", "x-neydra-session"];

/// An intercepted resource fetch.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
}

impl Request {
  /// A plain GET for `url`.
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      headers: Vec::new(),
      body: Bytes::new(),
    }
  }

  #[cfg(test)]
  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// The last segment of the URL path (`"/a/PAE.html"` gives `"PAE.html"`, `"/"` gives `""`).
  pub fn page(&self) -> &str {
    last_segment(self.url.path())
  }

  /// Only GET requests are matched against or written into the cache.
  pub fn is_cacheable(&self) -> bool {
    self.method == Method::GET
  }

  /// Whether the request carries a session, cookie or authorization header.
  pub fn carries_credentials(&self) -> bool {
    self
      .headers
      .iter()
      .any(|(k, _)| CREDENTIAL_HEADERS.iter().any(|c| c.eq_ignore_ascii_case(k)))
  }

  /// Identity used as the cache key.
  pub fn cache_key(&self) -> &str {
    self.url.as_str()
  }
}

/// Last `/`-separated segment of a path.
pub fn last_segment(path: &str) -> &str {
  path.rsplit('/').next().unwrap_or("")
}

/// A completed response, either from the network or rebuilt from a cached snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  /// URL the response was produced for
  pub url: String,
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
}

impl Response {
  pub fn new(url: impl Into<String>, status: u16, body: impl Into<Bytes>) -> Self {
    Self {
      url: url.into(),
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  #[cfg(test)]
  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// 2xx status.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// The only status the mediator interprets as a denial.
  pub fn is_forbidden(&self) -> bool {
    self.status == 403
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Whether a shared cache may keep this response.
  ///
  /// `Cache-Control: no-store` or `private`, or any `Set-Cookie`, rules it out.
  pub fn is_storable(&self) -> bool {
    if self.header("set-cookie").is_some() {
      return false;
    }
    let Some(cache_control) = self.header("cache-control") else {
      return true;
    };
    !cache_control.split(',').any(|directive| {
      let directive = directive.trim();
      directive.eq_ignore_ascii_case("no-store") || directive.eq_ignore_ascii_case("private")
    })
  }
}
