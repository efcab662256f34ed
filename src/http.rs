//! Request and response values passed between the proxy, the worker and the
//! network layer.

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

/// What the page intends to do with the response (`Sec-Fetch-Dest`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
  Document,
  Image,
  Script,
  Style,
  Font,
  Audio,
  Video,
  #[default]
  Empty,
}

impl Destination {
  /// Parse a `Sec-Fetch-Dest` header value. Unknown values map to `Empty`.
  pub fn from_header(value: &str) -> Self {
    match value.trim().to_ascii_lowercase().as_str() {
      "document" | "iframe" | "frame" => Self::Document,
      "image" => Self::Image,
      "script" | "worker" | "sharedworker" => Self::Script,
      "style" => Self::Style,
      "font" => Self::Font,
      "audio" => Self::Audio,
      "video" | "track" => Self::Video,
      _ => Self::Empty,
    }
  }
}

/// Request mode (`Sec-Fetch-Mode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
  Navigate,
  SameOrigin,
  #[default]
  Cors,
  NoCors,
}

impl RequestMode {
  pub fn from_header(value: &str) -> Self {
    match value.trim().to_ascii_lowercase().as_str() {
      "navigate" => Self::Navigate,
      "same-origin" => Self::SameOrigin,
      "no-cors" => Self::NoCors,
      _ => Self::Cors,
    }
  }
}

/// An outgoing or intercepted HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub destination: Destination,
  pub mode: RequestMode,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      destination: Destination::Empty,
      mode: RequestMode::Cors,
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// A top-level page load.
  pub fn navigate(url: Url) -> Self {
    Self {
      destination: Destination::Document,
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  /// A POST carrying a JSON body.
  pub fn post_json<T: Serialize>(url: Url, body: &T) -> Result<Self> {
    let body = serde_json::to_vec(body).map_err(|e| eyre!("Failed to serialize body: {}", e))?;

    Ok(
      Self::new(Method::POST, url)
        .with_header("content-type", "application/json")
        .with_body(body),
    )
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn with_mode(mut self, mode: RequestMode) -> Self {
    self.mode = mode;
    self
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn with_body(mut self, body: Vec<u8>) -> Self {
    self.body = Some(body);
    self
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  /// Normalized cache key: method plus absolute URL without fragment.
  pub fn cache_key(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    format!("{} {}", self.method, url)
  }
}

/// An HTTP response with a fully buffered body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub status_text: String,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    let status_text = reqwest::StatusCode::from_u16(status)
      .ok()
      .and_then(|s| s.canonical_reason())
      .unwrap_or("")
      .to_string();

    Self {
      status,
      status_text,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  /// Whether the status is in the 2xx range.
  pub fn ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Body size in bytes.
  pub fn size(&self) -> u64 {
    self.body.len() as u64
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_cache_key_strips_fragment() {
    let request = Request::get(url("http://localhost:3000/photos/a.jpg?size=2#top"));
    assert_eq!(
      request.cache_key(),
      "GET http://localhost:3000/photos/a.jpg?size=2"
    );
  }

  #[test]
  fn test_cache_key_includes_method() {
    let get = Request::get(url("http://localhost:3000/api/rsvp"));
    let post = Request::new(Method::POST, url("http://localhost:3000/api/rsvp"));
    assert_ne!(get.cache_key(), post.cache_key());
  }

  #[test]
  fn test_navigate_is_navigation() {
    let request = Request::navigate(url("http://localhost:3000/gallery"));
    assert!(request.is_navigation());
    assert_eq!(request.destination, Destination::Document);
    assert!(!Request::get(url("http://localhost:3000/gallery")).is_navigation());
  }

  #[test]
  fn test_destination_from_header() {
    assert_eq!(Destination::from_header("image"), Destination::Image);
    assert_eq!(Destination::from_header(" Document "), Destination::Document);
    assert_eq!(Destination::from_header("manifest"), Destination::Empty);
  }

  #[test]
  fn test_response_ok_range() {
    assert!(Response::new(200, "x").ok());
    assert!(Response::new(204, "").ok());
    assert!(!Response::new(304, "").ok());
    assert!(!Response::new(500, "").ok());
    assert_eq!(Response::new(404, "").status_text, "Not Found");
  }

  #[test]
  fn test_header_lookup_is_case_insensitive() {
    let response = Response::new(200, "x").with_header("Content-Type", "text/html");
    assert_eq!(response.header("content-type"), Some("text/html"));
    assert_eq!(response.header("etag"), None);
  }
}
