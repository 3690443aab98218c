//! Splits requests into public and gated resources.

use std::collections::BTreeSet;

use crate::net::last_segment;

/// Which strategy a request takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
  /// Cache first, network as fill
  Public,
  /// Network first, cache only when offline, fallback as last resort
  Gated,
}

impl Classification {
  pub fn as_str(&self) -> &'static str {
    match self {
      Classification::Public => "public",
      Classification::Gated => "gated",
    }
  }
}

/// Classifies a path by its last segment against a fixed gated set.
///
/// Matching is exact and case-sensitive: `"pae.html"` is public when the set
/// holds `"PAE.html"`.
#[derive(Debug, Clone)]
pub struct Classifier {
  gated: BTreeSet<String>,
}

impl Classifier {
  pub fn new<I, S>(gated: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      gated: gated.into_iter().map(Into::into).collect(),
    }
  }

  pub fn classify(&self, path: &str) -> Classification {
    if self.gated.contains(last_segment(path)) {
      Classification::Gated
    } else {
      Classification::Public
    }
  }

  /// Whether the last segment names a gated page in a different letter case.
  ///
  /// Such a path classifies as public but may open the gated file on a
  /// case-insensitive filesystem.
  pub fn is_case_variant(&self, path: &str) -> bool {
    let page = last_segment(path);
    !self.gated.contains(page) && self.gated.iter().any(|g| g.eq_ignore_ascii_case(page))
  }
}
