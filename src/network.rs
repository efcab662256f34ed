//! Network access used by the worker and analytics.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;

use crate::http::{Request, Response};

/// Headers that describe the wire encoding rather than the buffered body.
const WIRE_HEADERS: &[&str] = &[
  "connection",
  "content-encoding",
  "content-length",
  "keep-alive",
  "transfer-encoding",
];

/// Request headers the HTTP client sets itself.
const CLIENT_NEGOTIATED_HEADERS: &[&str] = &["accept-encoding", "host", "if-range", "range"];

/// Anything that can perform a fetch.
///
/// An `Err` means the request never produced a response (offline, DNS,
/// timeout); HTTP error statuses come back as `Ok` responses.
#[async_trait]
pub trait Network: Send + Sync + 'static {
  async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// Network implementation backed by reqwest.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());

    for (name, value) in request.headers.iter().filter(|(n, _)| is_forwarded(n)) {
      builder = builder.header(name.as_str(), value.as_str());
    }

    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status();
    let headers = response
      .headers()
      .iter()
      .filter(|(name, _)| !is_wire_header(name.as_str()))
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

    Ok(Response {
      status: status.as_u16(),
      status_text: status.canonical_reason().unwrap_or("").to_string(),
      headers,
      body: body.to_vec(),
    })
  }
}

pub(crate) fn is_wire_header(name: &str) -> bool {
  WIRE_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Whether a page's request header is passed on to the origin.
///
/// Encoding and partial-content negotiation stay with the client, which
/// only decodes the encodings it advertises and always buffers whole bodies.
fn is_forwarded(name: &str) -> bool {
  !is_wire_header(name)
    && !CLIENT_NEGOTIATED_HEADERS
      .iter()
      .any(|h| h.eq_ignore_ascii_case(name))
}

/// Scripted network for tests.
#[cfg(test)]
pub mod mock {
  use super::*;
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::sync::Mutex;

  /// Serves canned responses by URL and can be switched offline.
  pub struct MockNetwork {
    online: AtomicBool,
    routes: Mutex<HashMap<String, Response>>,
    calls: Mutex<Vec<(String, String, Option<Vec<u8>>)>>,
  }

  impl MockNetwork {
    pub fn new() -> Self {
      Self {
        online: AtomicBool::new(true),
        routes: Mutex::new(HashMap::new()),
        calls: Mutex::new(Vec::new()),
      }
    }

    pub fn respond(&self, url: &str, response: Response) {
      self
        .routes
        .lock()
        .unwrap()
        .insert(url.to_string(), response);
    }

    pub fn set_online(&self, online: bool) {
      self.online.store(online, Ordering::SeqCst);
    }

    /// Number of fetches issued for `url`, whatever their outcome.
    pub fn calls_to(&self, url: &str) -> usize {
      self
        .calls
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, u, _)| u == url)
        .count()
    }

    /// Bodies of all POSTs issued to `url`.
    pub fn posted_bodies(&self, url: &str) -> Vec<Vec<u8>> {
      self
        .calls
        .lock()
        .unwrap()
        .iter()
        .filter(|(m, u, _)| m == "POST" && u == url)
        .filter_map(|(_, _, body)| body.clone())
        .collect()
    }
  }

  #[async_trait]
  impl Network for MockNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response> {
      let url = request.url.to_string();
      self
        .calls
        .lock()
        .unwrap()
        .push((request.method.to_string(), url.clone(), request.body.clone()));

      if !self.online.load(Ordering::SeqCst) {
        return Err(eyre!("Failed to fetch {}: network unreachable", url));
      }

      let response = self.routes.lock().unwrap().get(&url).cloned();
      Ok(response.unwrap_or_else(|| Response::new(404, "not found")))
    }
  }
}
