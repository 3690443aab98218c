use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::CacheVersion;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Upstream the proxy mediates requests to
  pub origin: Url,
  /// Address the proxy listens on
  pub listen: SocketAddr,
  pub cache: CacheConfig,
  /// Paths pre-cached at install time, in order
  pub manifest: Vec<String>,
  /// Page names that take the network-first path (exact, case-sensitive)
  pub gated: BTreeSet<String>,
  /// Served when a gated page is denied or unavailable offline
  pub fallback: String,
  pub network: NetworkConfig,
  pub notifications: NotificationConfig,
  pub logging: LoggingConfig,
  pub origin_server: OriginServerConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: Url::parse("http://127.0.0.1:8081/").expect("static origin url"),
      listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
      cache: CacheConfig::default(),
      manifest: [
        "/",
        "/index.html",
        "/home.html",
        "/styles.css",
        "/js/subscriptions.js",
        "/assets/icon.png",
      ]
      .into_iter()
      .map(String::from)
      .collect(),
      gated: ["PAE.html", "AIL.html", "RT-NLP-SA.html"]
        .into_iter()
        .map(String::from)
        .collect(),
      fallback: "/home.html".to_string(),
      network: NetworkConfig::default(),
      notifications: NotificationConfig::default(),
      logging: LoggingConfig::default(),
      origin_server: OriginServerConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Cache names are `{prefix}-{version}`
  pub prefix: String,
  pub version: CacheVersion,
  /// SQLite file; `:memory:` keeps the cache in process, unset uses the data dir
  pub path: Option<PathBuf>,
  /// Store successful public GET responses that missed the cache
  pub write_back_on_miss: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: "neydra-cache".to_string(),
      version: CacheVersion::new("v1"),
      path: None,
      write_back_on_miss: true,
    }
  }
}

impl CacheConfig {
  /// Name of the cache for the current version.
  pub fn current_name(&self) -> String {
    self.version.cache_name(&self.prefix)
  }

  pub fn is_in_memory(&self) -> bool {
    self
      .path
      .as_deref()
      .is_some_and(|p| p == Path::new(":memory:"))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub timeout_secs: u64,
  pub user_agent: String,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      timeout_secs: 10,
      user_agent: concat!("neydra-sw/", env!("CARGO_PKG_VERSION")).to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  /// When false every notification is refused as if permission were denied
  pub enabled: bool,
  pub title: String,
  /// Body used when a push carries no payload
  pub default_body: String,
  pub icon: String,
  pub badge: String,
  /// Opened when a notification is clicked
  pub landing: String,
  /// Unclicked notifications kept in the tray; the oldest go first
  pub max_shown: usize,
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      title: "[NEYDRA] Market Alert".to_string(),
      default_body: "NEYDRA Update".to_string(),
      icon: "assets/icon.png".to_string(),
      badge: "assets/icon.png".to_string(),
      landing: "/home.html".to_string(),
      max_shown: 50,
    }
  }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
  /// Human-readable multi-line output
  #[default]
  Pretty,
  /// Single-line output
  Compact,
  /// One JSON object per event
  Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Default filter, overridden by RUST_LOG
  pub level: String,
  pub format: LogFormat,
  /// Also write a daily-rotated log file at this path
  pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      format: LogFormat::default(),
      file: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OriginServerConfig {
  /// Directory of static pages to serve
  pub root: PathBuf,
  pub listen: SocketAddr,
  pub session_ttl_minutes: i64,
}

impl Default for OriginServerConfig {
  fn default() -> Self {
    Self {
      root: PathBuf::from("site"),
      listen: SocketAddr::from(([127, 0, 0, 1], 8081)),
      session_ttl_minutes: 12 * 60,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./neydra-sw.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/neydra-sw/config.yaml
  ///
  /// Falls back to the built-in defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };
    config.validate()?;

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("neydra-sw.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("neydra-sw").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if !matches!(self.origin.scheme(), "http" | "https") {
      return Err(eyre!("origin must be an http(s) URL, got {}", self.origin));
    }
    if !self.fallback.starts_with('/') {
      return Err(eyre!("fallback must be a path starting with '/', got {}", self.fallback));
    }
    if !self.notifications.landing.starts_with('/') {
      return Err(eyre!(
        "notifications.landing must be a path starting with '/', got {}",
        self.notifications.landing
      ));
    }
    if self.notifications.max_shown == 0 {
      return Err(eyre!("notifications.max_shown must be at least 1"));
    }
    if let Some(bad) = self.manifest.iter().find(|p| !p.starts_with('/')) {
      return Err(eyre!("manifest entries must start with '/', got {}", bad));
    }
    if let Some(bad) = self.gated.iter().find(|p| p.is_empty() || p.contains('/')) {
      return Err(eyre!("gated entries must be bare page names, got '{}'", bad));
    }
    Ok(())
  }

  /// Resolve a configured path against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Failed to resolve {} against {}: {}", path, self.origin, e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_match_service_worker_constants() {
    let config = Config::default();
    assert_eq!(config.cache.current_name(), "neydra-cache-v1");
    assert_eq!(config.manifest.len(), 6);
    assert!(config.gated.contains("PAE.html"));
    assert!(config.gated.contains("RT-NLP-SA.html"));
    assert_eq!(config.fallback, "/home.html");
    assert_eq!(config.notifications.default_body, "NEYDRA Update");
    assert!(config.validate().is_ok());
  }

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config = Config::parse(
      r#"
origin: "https://neydra.example/"
cache:
  version: v2
gated: ["PAE.html"]
logging:
  format: json
"#,
    )
    .unwrap();

    assert_eq!(config.origin.as_str(), "https://neydra.example/");
    assert_eq!(config.cache.current_name(), "neydra-cache-v2");
    assert!(config.cache.write_back_on_miss);
    assert_eq!(config.gated.len(), 1);
    assert_eq!(config.logging.format, LogFormat::Json);
    assert_eq!(config.fallback, "/home.html");
  }

  #[test]
  fn test_in_memory_cache_path() {
    let config = Config::parse("cache:\n  path: \":memory:\"\n").unwrap();
    assert!(config.cache.is_in_memory());
    assert!(!Config::default().cache.is_in_memory());
  }

  #[test]
  fn test_validate_rejects_relative_fallback() {
    let config = Config::parse("fallback: home.html\n").unwrap();
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_validate_rejects_empty_tray() {
    let config = Config::parse("notifications:\n  max_shown: 0\n").unwrap();
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_validate_rejects_non_http_origin() {
    let config = Config::parse("origin: \"ftp://files.example/\"\n").unwrap();
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_resolve_against_origin() {
    let config = Config::default();
    assert_eq!(
      config.resolve("/home.html").unwrap().as_str(),
      "http://127.0.0.1:8081/home.html"
    );
  }

  #[test]
  fn test_load_missing_explicit_path_fails() {
    let err = Config::load(Some(Path::new("/nonexistent/neydra-sw.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }

  #[test]
  fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("neydra-sw.yaml");
    std::fs::write(&path, "fallback: /index.html\n").unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.fallback, "/index.html");
  }
}
