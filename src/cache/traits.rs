//! Core traits and types for the response caches.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};

use crate::http::{Request, Response};

/// The three logical caches the worker keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
  /// Precached shell and long-lived assets
  Static,
  /// API responses and pages
  Dynamic,
  /// Photos and other images, size capped
  Image,
}

impl CacheKind {
  pub const ALL: [CacheKind; 3] = [CacheKind::Static, CacheKind::Dynamic, CacheKind::Image];

  fn prefix(self) -> &'static str {
    match self {
      Self::Static => "static",
      Self::Dynamic => "dynamic",
      Self::Image => "image",
    }
  }
}

/// Generation-tagged cache names, e.g. `static-cache-v1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNames {
  version: String,
}

impl CacheNames {
  pub fn new(version: impl Into<String>) -> Self {
    Self {
      version: version.into(),
    }
  }

  pub fn name(&self, kind: CacheKind) -> String {
    format!("{}-cache-{}", kind.prefix(), self.version)
  }

  /// Current names in lookup order: static, dynamic, image.
  pub fn all(&self) -> Vec<String> {
    CacheKind::ALL.iter().map(|k| self.name(*k)).collect()
  }

  pub fn is_current(&self, name: &str) -> bool {
    CacheKind::ALL.iter().any(|k| self.name(*k) == name)
  }
}

/// A response read back from a cache.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  /// Cache the entry was read from
  pub cache_name: String,
  pub response: Response,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Bookkeeping for one entry, without its body.
#[derive(Debug, Clone)]
pub struct EntryInfo {
  pub request_key: String,
  pub size: u64,
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// Caches are addressed by name; entries by the request's normalized key.
/// Every write replaces the whole entry.
pub trait CacheStore: Send + Sync + 'static {
  /// Names of every existing cache, in creation order.
  fn keys(&self) -> Result<Vec<String>>;

  /// Create the named cache if it does not exist yet.
  fn open(&self, name: &str) -> Result<()>;

  /// Whether the named cache exists.
  fn has(&self, name: &str) -> Result<bool>;

  /// Delete a cache and all its entries. Returns false if it did not exist.
  fn delete(&self, name: &str) -> Result<bool>;

  /// Look up a request in one cache.
  fn match_request(&self, name: &str, request: &Request) -> Result<Option<CachedResponse>>;

  /// Look up a request across several caches, first hit wins.
  fn match_any(&self, names: &[String], request: &Request) -> Result<Option<CachedResponse>> {
    for name in names {
      if let Some(hit) = self.match_request(name, request)? {
        return Ok(Some(hit));
      }
    }
    Ok(None)
  }

  /// Store a response, opening the cache if needed. Non-GET requests are
  /// ignored.
  fn put(&self, name: &str, request: &Request, response: &Response) -> Result<()>;

  /// Remove an entry by its normalized request key.
  fn delete_entry(&self, name: &str, request_key: &str) -> Result<bool>;

  /// Size of a single entry, if present.
  fn entry_size(&self, name: &str, request: &Request) -> Result<Option<u64>>;

  /// Sum of all body sizes in the cache.
  fn total_size(&self, name: &str) -> Result<u64>;

  /// Entries ordered oldest first.
  fn entries_by_age(&self, name: &str) -> Result<Vec<EntryInfo>>;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_cache_names_are_generation_tagged() {
    let names = CacheNames::new("v1");
    assert_eq!(names.name(CacheKind::Static), "static-cache-v1");
    assert_eq!(names.name(CacheKind::Dynamic), "dynamic-cache-v1");
    assert_eq!(names.name(CacheKind::Image), "image-cache-v1");
  }

  #[test]
  fn test_is_current_rejects_old_generation() {
    let names = CacheNames::new("v2");
    assert!(names.is_current("image-cache-v2"));
    assert!(!names.is_current("image-cache-v1"));
    assert!(!names.is_current("workbox-precache"));
  }
}
