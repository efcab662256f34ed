//! Request classification into caching strategies.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::http::{Destination, Request};

/// How a request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
  /// Network, falling back to cache and then the offline page
  NetworkFirst,
  /// Cache, falling back to network
  CacheFirst,
  /// Cache-first against the size-capped image cache
  Image,
  /// Cached copy now, refreshed in the background
  StaleWhileRevalidate,
}

/// URL patterns that drive classification.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
  /// Path prefixes served network-first
  pub network_first_prefixes: Vec<String>,
  /// Path segments served cache-first
  pub cache_first_segments: Vec<String>,
  /// File extensions (with dot) served cache-first
  pub cache_first_extensions: Vec<String>,
  /// File extensions (with dot) treated as images
  pub image_extensions: Vec<String>,
}

impl Default for RouteConfig {
  fn default() -> Self {
    fn owned(items: &[&str]) -> Vec<String> {
      items.iter().map(|s| s.to_string()).collect()
    }

    Self {
      network_first_prefixes: owned(&["/api/", "/auth/", "/_next/static/"]),
      cache_first_segments: owned(&["/images/", "/photos/", "/audio/", "/_next/image"]),
      cache_first_extensions: owned(&[".woff", ".woff2", ".ttf", ".otf", ".eot", ".css", ".js"]),
      image_extensions: owned(&[
        ".png", ".jpg", ".jpeg", ".gif", ".webp", ".svg", ".ico", ".avif",
      ]),
    }
  }
}

/// Strategy selector for intercepted requests.
#[derive(Debug, Clone)]
pub struct Router {
  origin: Url,
  routes: RouteConfig,
}

impl Router {
  pub fn new(origin: Url, routes: RouteConfig) -> Self {
    Self { origin, routes }
  }

  /// Classify a request.
  ///
  /// Returns `None` for requests the worker must not touch: anything that is
  /// not a GET, and anything cross-origin.
  pub fn classify(&self, request: &Request) -> Option<Strategy> {
    if request.method != reqwest::Method::GET || !self.is_same_origin(&request.url) {
      return None;
    }

    let path = request.url.path();

    if self
      .routes
      .network_first_prefixes
      .iter()
      .any(|p| path.starts_with(p.as_str()))
    {
      return Some(Strategy::NetworkFirst);
    }

    if self
      .routes
      .cache_first_segments
      .iter()
      .any(|s| path.contains(s.as_str()))
      || has_extension(path, &self.routes.cache_first_extensions)
    {
      return Some(Strategy::CacheFirst);
    }

    if self.is_image(request) {
      return Some(Strategy::Image);
    }

    Some(Strategy::StaleWhileRevalidate)
  }

  /// Whether the request is for an image, by destination or extension.
  pub fn is_image(&self, request: &Request) -> bool {
    request.destination == Destination::Image
      || has_extension(request.url.path(), &self.routes.image_extensions)
  }

  pub fn is_same_origin(&self, url: &Url) -> bool {
    url.origin() == self.origin.origin()
  }
}

fn has_extension(path: &str, extensions: &[String]) -> bool {
  let path = path.to_ascii_lowercase();
  extensions
    .iter()
    .any(|ext| path.ends_with(&ext.to_ascii_lowercase()))
}
