//! Subscription plans, sessions and the entitlement check behind 403s.
//!
//! Plans are only ever read from server-held sessions. Nothing a client sends
//! besides its session id takes part in the decision.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Report};
use serde::Serialize;
use std::collections::HashMap;
use std::str::FromStr;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Pages every plan can see.
const BASE_PAGES: &[&str] = &["index.html", "home.html", "about.html"];

/// Premium feature and the page it unlocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Feature {
  Exchange,
  Pae,
  Ail,
  Nlp,
}

impl Feature {
  pub fn page(&self) -> &'static str {
    match self {
      Feature::Exchange => "exchange.html",
      Feature::Pae => "PAE.html",
      Feature::Ail => "AIL.html",
      Feature::Nlp => "RT-NLP-SA.html",
    }
  }

  /// The feature that unlocks `page`, if any.
  pub fn for_page(page: &str) -> Option<Feature> {
    [Feature::Exchange, Feature::Pae, Feature::Ail, Feature::Nlp]
      .into_iter()
      .find(|f| f.page() == page)
  }
}

/// Subscription tiers, each including everything below it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
  #[default]
  Free,
  Standard,
  Premium,
  Ultra,
}

impl Plan {
  pub fn name(&self) -> &'static str {
    match self {
      Plan::Free => "Free",
      Plan::Standard => "Standard",
      Plan::Premium => "Premium",
      Plan::Ultra => "Ultra",
    }
  }

  /// Monthly price in whole currency units.
  pub fn price(&self) -> u32 {
    match self {
      Plan::Free => 0,
      Plan::Standard => 15,
      Plan::Premium => 40,
      Plan::Ultra => 90,
    }
  }

  pub fn features(&self) -> &'static [Feature] {
    use Feature::*;
    match self {
      Plan::Free => &[Exchange],
      Plan::Standard => &[Exchange, Pae],
      Plan::Premium => &[Exchange, Pae, Ail],
      Plan::Ultra => &[Exchange, Pae, Ail, Nlp],
    }
  }

  pub fn has_feature(&self, feature: Feature) -> bool {
    self.features().contains(&feature)
  }

  /// Whether a page (last path segment) is open to this plan.
  pub fn can_access(&self, page: &str) -> bool {
    BASE_PAGES.contains(&page) || Feature::for_page(page).is_some_and(|f| self.has_feature(f))
  }
}

impl FromStr for Plan {
  type Err = Report;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "free" => Ok(Plan::Free),
      "standard" => Ok(Plan::Standard),
      "premium" => Ok(Plan::Premium),
      "ultra" => Ok(Plan::Ultra),
      other => Err(eyre!("Invalid plan: {}", other)),
    }
  }
}

/// Server-held authorization context for one client.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
  pub id: String,
  pub plan: Plan,
  pub created_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
}

impl Session {
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    now >= self.expires_at
  }
}

/// Decides whether a session may read a resource.
pub trait EntitlementStore: Send + Sync {
  /// `None` means no session, which is treated as the free plan.
  fn is_authorized(&self, session: Option<&Session>, page: &str) -> bool;
}

/// Entitlements taken straight from the plan table.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanEntitlements;

impl EntitlementStore for PlanEntitlements {
  fn is_authorized(&self, session: Option<&Session>, page: &str) -> bool {
    let plan = session.map(|s| s.plan).unwrap_or_default();
    plan.can_access(page)
  }
}

/// Live sessions, created at login and dropped at logout or expiry.
#[derive(Debug)]
pub struct SessionRegistry {
  ttl: Duration,
  sessions: RwLock<HashMap<String, Session>>,
}

impl SessionRegistry {
  pub fn new(ttl: Duration) -> Self {
    Self {
      ttl,
      sessions: RwLock::new(HashMap::new()),
    }
  }

  /// Start a session on `plan`. Expired sessions are swept first.
  pub async fn create(&self, plan: Plan) -> Session {
    let now = Utc::now();
    let session = Session {
      id: uuid::Uuid::new_v4().to_string(),
      plan,
      created_at: now,
      expires_at: now + self.ttl,
    };

    let mut sessions = self.sessions.write().await;
    let before = sessions.len();
    sessions.retain(|_, s| !s.is_expired(now));
    let swept = before - sessions.len();
    if swept > 0 {
      debug!(swept, "expired sessions removed");
    }
    sessions.insert(session.id.clone(), session.clone());
    drop(sessions);

    info!(plan = plan.name(), expires_at = %session.expires_at, "session started");
    session
  }

  #[cfg(test)]
  pub async fn len(&self) -> usize {
    self.sessions.read().await.len()
  }

  /// Look up a live session; expired ones are removed.
  pub async fn get(&self, id: &str) -> Option<Session> {
    let now = Utc::now();
    {
      let sessions = self.sessions.read().await;
      match sessions.get(id) {
        Some(s) if !s.is_expired(now) => return Some(s.clone()),
        Some(_) => {}
        None => return None,
      }
    }

    self.sessions.write().await.remove(id);
    debug!("session expired");
    None
  }

  /// End a session. Returns whether it existed.
  pub async fn end(&self, id: &str) -> bool {
    let removed = self.sessions.write().await.remove(id).is_some();
    if removed {
      info!("session ended");
    }
    removed
  }
}
