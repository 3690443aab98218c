//! Push notifications and notification clicks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::NotificationConfig;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotifyError {
  #[error("notification permission denied")]
  PermissionDenied,

  #[error("notification {0} not found")]
  NotFound(u64),

  #[error("cannot open window: {0}")]
  Window(String),
}

/// A user-visible notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
  pub id: u64,
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub created_at: DateTime<Utc>,
}

/// Somewhere notifications can be shown.
#[async_trait]
pub trait Notifier: Send + Sync {
  async fn show(&self, notification: &Notification) -> Result<(), NotifyError>;

  /// Dismiss a shown notification, returning it.
  async fn close(&self, id: u64) -> Result<Notification, NotifyError>;
}

/// A window client opened for the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowClient {
  pub id: String,
  pub url: String,
  pub focused: bool,
}

/// Something that can open (or focus) a window at a URL.
#[async_trait]
pub trait WindowOpener: Send + Sync {
  async fn open_window(&self, url: &Url) -> Result<WindowClient, NotifyError>;
}

// ==================== Tray ====================

/// Holds shown notifications until they are closed.
///
/// Clients poll the tray to display notifications. At most `max_shown` are
/// kept; showing one more drops the oldest.
#[derive(Debug)]
pub struct NotificationTray {
  permitted: bool,
  max_shown: usize,
  shown: RwLock<Vec<Notification>>,
}

impl NotificationTray {
  pub fn new(permitted: bool, max_shown: usize) -> Self {
    Self {
      permitted,
      max_shown: max_shown.max(1),
      shown: RwLock::new(Vec::new()),
    }
  }

  /// Notifications currently shown, oldest first.
  pub async fn list(&self) -> Vec<Notification> {
    self.shown.read().await.clone()
  }
}

#[async_trait]
impl Notifier for NotificationTray {
  async fn show(&self, notification: &Notification) -> Result<(), NotifyError> {
    if !self.permitted {
      return Err(NotifyError::PermissionDenied);
    }
    let mut shown = self.shown.write().await;
    shown.push(notification.clone());
    if shown.len() > self.max_shown {
      let dropped = shown.len() - self.max_shown;
      shown.drain(..dropped);
      debug!(dropped, "oldest notifications dropped from tray");
    }
    Ok(())
  }

  async fn close(&self, id: u64) -> Result<Notification, NotifyError> {
    let mut shown = self.shown.write().await;
    let pos = shown
      .iter()
      .position(|n| n.id == id)
      .ok_or(NotifyError::NotFound(id))?;
    Ok(shown.remove(pos))
  }
}

// ==================== Clients ====================

/// Window clients opened on the user's behalf.
#[derive(Debug, Default)]
pub struct Clients {
  clients: RwLock<HashMap<String, WindowClient>>,
}

impl Clients {
  pub fn new() -> Self {
    Self::default()
  }

  #[cfg(test)]
  pub async fn get(&self, id: &str) -> Option<WindowClient> {
    self.clients.read().await.get(id).cloned()
  }

  #[cfg(test)]
  pub async fn len(&self) -> usize {
    self.clients.read().await.len()
  }
}

#[async_trait]
impl WindowOpener for Clients {
  /// Focus an existing client at `url`, or open a new one.
  async fn open_window(&self, url: &Url) -> Result<WindowClient, NotifyError> {
    if !matches!(url.scheme(), "http" | "https") {
      return Err(NotifyError::Window(format!("unsupported url {}", url)));
    }

    let mut clients = self.clients.write().await;
    for client in clients.values_mut() {
      client.focused = false;
    }

    if let Some(existing) = clients.values_mut().find(|c| c.url == url.as_str()) {
      existing.focused = true;
      return Ok(existing.clone());
    }

    let client = WindowClient {
      id: format!("client-{}", uuid::Uuid::new_v4()),
      url: url.to_string(),
      focused: true,
    };
    clients.insert(client.id.clone(), client.clone());
    Ok(client)
  }
}

// ==================== Gateway ====================

/// Turns push events into notifications and clicks into windows.
pub struct NotificationGateway {
  notifier: Arc<dyn Notifier>,
  opener: Arc<dyn WindowOpener>,
  options: NotificationConfig,
  /// Absolute URL opened on click
  landing: Url,
  next_id: AtomicU64,
}

impl NotificationGateway {
  pub fn new(
    notifier: Arc<dyn Notifier>,
    opener: Arc<dyn WindowOpener>,
    options: NotificationConfig,
    landing: Url,
  ) -> Self {
    Self {
      notifier,
      opener,
      options,
      landing,
      next_id: AtomicU64::new(1),
    }
  }

  /// Build the notification for a push payload.
  pub fn build(&self, payload: Option<&str>) -> Notification {
    let body = payload
      .filter(|p| !p.is_empty())
      .unwrap_or(&self.options.default_body);

    Notification {
      id: self.next_id.fetch_add(1, Ordering::Relaxed),
      title: self.options.title.clone(),
      body: body.to_string(),
      icon: self.options.icon.clone(),
      badge: self.options.badge.clone(),
      created_at: Utc::now(),
    }
  }

  /// Handle a push event. Failures are logged, never returned.
  pub async fn on_push(&self, payload: Option<&str>) {
    let notification = self.build(payload);

    match self.notifier.show(&notification).await {
      Ok(()) => info!(
        id = notification.id,
        body = %notification.body,
        "notification shown"
      ),
      Err(err) => warn!(id = notification.id, error = %err, "notification not shown"),
    }
  }

  /// Handle a click: close the notification, then open the landing page.
  pub async fn on_click(&self, id: u64) -> Result<WindowClient, NotifyError> {
    if let Err(err) = self.notifier.close(id).await {
      warn!(id, error = %err, "notification close failed");
      return Err(err);
    }

    let client = self.opener.open_window(&self.landing).await?;
    info!(id, client = %client.id, url = %client.url, "notification clicked");

    Ok(client)
  }
}
